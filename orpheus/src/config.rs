use crate::http::{build_client, build_stream_client};
use crate::polling::PollSettings;
use crate::reconciler::{IndexBase, MediaLayout};
use anyhow::{Context, Result, anyhow};
use orpheus_common::JobId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// 提交 prompt 的核心服务
    pub core_url: String,
    /// 推送状态的服务
    pub status_url: String,
    pub avatar_url: String,
    pub slides_url: String,
    /// 快照里没有结果目录时用于拼接视频地址
    pub media_base_url: String,

    #[serde(default)]
    pub video_index_base: IndexBase,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 推送通道多久没有消息就提示一次，缺省为不检测
    #[serde(default)]
    pub push_idle_timeout_secs: Option<u64>,

    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PollConfig {
    #[serde(default = "default_slides_interval")]
    pub slides_interval_secs: u64,
    #[serde(default = "default_avatar_fallback")]
    pub avatar_fallback_secs: u64,
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_request_timeout() -> u64 {
    10
}

fn default_slides_interval() -> u64 {
    3
}

fn default_avatar_fallback() -> u64 {
    5
}

fn default_min_delay() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    5
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            slides_interval_secs: default_slides_interval(),
            avatar_fallback_secs: default_avatar_fallback(),
            min_delay_ms: default_min_delay(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_url: "http://127.0.0.1:8080".into(),
            status_url: "http://127.0.0.1:19910".into(),
            avatar_url: "http://127.0.0.1:8000".into(),
            slides_url: "http://127.0.0.1:8001".into(),
            media_base_url: "http://127.0.0.1:8002/media".into(),
            video_index_base: IndexBase::default(),
            course_id: None,
            request_timeout_secs: default_request_timeout(),
            push_idle_timeout_secs: None,
            poll: PollConfig::default(),
        }
    }
}

impl Config {
    pub fn layout_for(&self, job_id: &JobId) -> MediaLayout {
        MediaLayout::for_job(&self.media_base_url, job_id, self.video_index_base)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            slides_interval: Duration::from_secs(self.poll.slides_interval_secs),
            avatar_fallback: Duration::from_secs(self.poll.avatar_fallback_secs),
            min_delay: Duration::from_millis(self.poll.min_delay_ms),
            max_retries: self.poll.max_retries,
        }
    }

    pub fn push_idle_timeout(&self) -> Option<Duration> {
        self.push_idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        build_client(Duration::from_secs(self.request_timeout_secs))
            .context("创建 HTTP 客户端失败")
    }

    pub fn stream_client(&self) -> Result<reqwest::Client> {
        build_stream_client(Duration::from_secs(self.request_timeout_secs))
            .context("创建推送通道客户端失败")
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| anyhow!("无法确定配置目录"))?;

    let dir = base.join("orpheus");
    fs::create_dir_all(&dir).context("创建配置目录失败")?;
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn load_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).context("读取配置文件失败")?;
    let cfg: Config = toml::from_str(&content).context("解析配置文件失败")?;
    Ok(cfg)
}

/// 写入带注释的默认配置
pub fn write_default(path: &Path) -> Result<()> {
    let default = Config::default();
    let poll = &default.poll;

    let config_content = format!(
        r#"# ================ 服务地址 ================

# 提交 prompt 的核心服务
core_url = "{}"

# 推送生成状态的服务 (orpheus-status)
status_url = "{}"

# 数字人服务与幻灯片服务，推送不可用时轮询它们
avatar_url = "{}"
slides_url = "{}"

# 快照中没有结果目录时，视频地址为 {{media_base_url}}/jobs/{{JobId}}/{{序号}}.mp4
media_base_url = "{}"

# 视频序号从 0 还是 1 开始
video_index_base = {}

# 默认课程 ID
# course_id = "your_course_id"

# 单次请求超时 (秒)
request_timeout_secs = {}

# 推送通道空闲多少秒后提示一次 (不设置则不检测)
# push_idle_timeout_secs = 60

# ================ 轮询参数 ================

[poll]
# 幻灯片服务的轮询间隔 (秒)
slides_interval_secs = {}

# 数字人服务没有给出剩余时间时的轮询间隔 (秒)
avatar_fallback_secs = {}

# 按剩余时间轮询时的最小间隔 (毫秒)
min_delay_ms = {}

# 连续失败多少次后放弃并标记为失败
max_retries = {}
"#,
        default.core_url,
        default.status_url,
        default.avatar_url,
        default.slides_url,
        default.media_base_url,
        u8::from(default.video_index_base),
        default.request_timeout_secs,
        poll.slides_interval_secs,
        poll.avatar_fallback_secs,
        poll.min_delay_ms,
        poll.max_retries,
    );

    fs::write(path, config_content).context("写入默认配置失败")?;
    Ok(())
}

/// 加载或创建配置文件；首次运行时写入默认配置并返回 `None`
pub fn load_or_create_config() -> Result<Option<Config>> {
    let path = config_path()?;
    if path.exists() {
        return load_from(&path).map(Some);
    }
    write_default(&path)?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file_parses_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_default(&path).unwrap();

        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.push_idle_timeout(), None);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
core_url = "http://core"
status_url = "http://status"
avatar_url = "http://avatar"
slides_url = "http://slides"
media_base_url = "http://cdn"
video_index_base = 0
push_idle_timeout_secs = 30

[poll]
max_retries = 2
"#,
        )
        .unwrap();

        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.video_index_base, IndexBase::Zero);
        assert_eq!(cfg.push_idle_timeout(), Some(Duration::from_secs(30)));

        let settings = cfg.poll_settings();
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.slides_interval, Duration::from_secs(3));
        assert_eq!(settings.min_delay, Duration::from_millis(500));

        let layout = cfg.layout_for(&JobId::from("abc"));
        assert_eq!(layout.segment_url(None, 0), "http://cdn/jobs/abc/0.mp4");
    }

    #[test]
    fn invalid_index_base_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let content = toml::to_string(&Config::default())
            .unwrap()
            .replace("video_index_base = 1", "video_index_base = 7");
        fs::write(&path, content).unwrap();
        assert!(load_from(&path).is_err());
    }
}
