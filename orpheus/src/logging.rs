use anyhow::{Context, Result, anyhow};
use orpheus::config::config_dir;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// 日志写入配置目录下的文件，避免打乱终端上的进度显示
pub fn init_logging(verbose: bool) -> Result<WorkerGuard> {
    let log_file = config_dir()?.join("orpheus.log");

    // 每次运行覆盖旧文件
    let file = std::fs::File::create(&log_file)
        .with_context(|| format!("无法创建日志文件 {}", log_file.display()))?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file);

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("ORPHEUS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {e}"))?;

    // 返回 guard，将其生命周期交给调用者管理
    Ok(guard)
}
