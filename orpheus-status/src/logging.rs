use anyhow::{Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init_logging() -> Result<WorkerGuard> {
    // 定义日志文件的路径
    let log_file = ".orpheus-status.log";

    // 使用 File::create 会在每次运行时创建新文件或覆盖旧文件
    let file = std::fs::File::create(log_file)?;

    // 配置 tracing-appender，实现非阻塞写入
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file);

    let default_level = if std::env::var_os("ORPHEUS_VERBOSE").is_some() {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("ORPHEUS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // 构建 subscriber
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {e}"))?;

    // 返回 guard，将其生命周期交给调用者管理
    Ok(guard)
}
