use thiserror::Error;

/// 网络或通道层面的失败（不包括 404 "尚未创建"）
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("请求 {url} 失败: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} 返回异常状态码 {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("推送通道错误: {0}")]
    Channel(String),
}

/// 状态报文无法解析为预期的结构
#[derive(Debug, Error)]
#[error("状态报文解析失败: {source}")]
pub struct ParseError {
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

impl ParseError {
    pub fn new(raw: impl Into<String>, source: serde_json::Error) -> Self {
        Self {
            raw: raw.into(),
            source,
        }
    }
}

/// 提交 prompt 时的失败；此时还没有 JobId，只能整体报错
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("prompt 不能为空")]
    EmptyPrompt,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}
