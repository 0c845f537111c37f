mod logging;

use crate::logging::init_logging;
use anyhow::{Context, Result};
use orpheus_status::{DEFAULT_MAX_JOBS, StatusManager, router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

const DEFAULT_ADDR: &str = "127.0.0.1:19910";

async fn shutdown_signal(manager: StatusManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("无法监听 Ctrl-C: {e}");
        return;
    }
    info!("收到关闭信号，正在关闭所有订阅...");
    // SSE 连接不会自行结束，先关闭广播通道
    manager.close_all();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logging().context("无法初始化文件日志系统")?;

    let addr: SocketAddr = std::env::var("ORPHEUS_STATUS_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("ORPHEUS_STATUS_ADDR 不是有效的地址")?;

    let max_jobs = match std::env::var("ORPHEUS_STATUS_MAX_JOBS") {
        Ok(raw) => raw
            .parse()
            .context("ORPHEUS_STATUS_MAX_JOBS 不是有效的数字")?,
        Err(_) => DEFAULT_MAX_JOBS,
    };
    let manager = StatusManager::with_max_jobs(max_jobs);
    let app = router(manager.clone());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("无法监听 {addr}"))?;
    info!("状态服务已启动: http://{addr}");
    println!("orpheus-status listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("状态服务异常退出")?;

    info!("状态服务已成功关闭。");
    Ok(())
}
