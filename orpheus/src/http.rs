use crate::error::{ParseError, TransportError};
use crate::polling::{PollReply, Service, ServiceStatus, StatusSource};
use async_trait::async_trait;
use orpheus_common::utils::join_url;
use orpheus_common::{AvatarStatusResponse, JobId, SlidesStatusResponse, from_json};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// 创建各个服务共用的 HTTP 客户端
pub fn build_client(request_timeout: Duration) -> Result<Client, TransportError> {
    Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|source| TransportError::Request {
            url: String::new(),
            source,
        })
}

/// 推送通道专用的客户端。长连接会一直保持，只限制建立连接的时间。
pub fn build_stream_client(connect_timeout: Duration) -> Result<Client, TransportError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|source| TransportError::Request {
            url: String::new(),
            source,
        })
}

/// 请求一次状态接口。404 表示资源还不存在，不算错误。
async fn fetch_status<T: DeserializeOwned>(
    client: &Client,
    url: &str,
) -> Result<Option<Result<T, ParseError>>, TransportError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        debug!(%url, "状态接口返回 404");
        return Ok(None);
    }

    let body = response
        .text()
        .await
        .map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

    if !status.is_success() {
        return Err(TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    Ok(Some(from_json(&body).map_err(|e| ParseError::new(body, e))))
}

fn into_reply<T>(
    fetched: Option<Result<T, ParseError>>,
    wrap: impl FnOnce(T) -> ServiceStatus,
) -> PollReply {
    match fetched {
        None => PollReply::NotFound,
        Some(Ok(value)) => PollReply::Status(wrap(value)),
        Some(Err(e)) => PollReply::Malformed(e),
    }
}

/// 数字人服务: `GET {base}/v1/video/{id}/status`
#[derive(Debug, Clone)]
pub struct AvatarHttpSource {
    client: Client,
    base_url: String,
}

impl AvatarHttpSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn status_url(&self, job_id: &JobId) -> String {
        join_url(&self.base_url, &format!("v1/video/{job_id}/status"))
    }
}

#[async_trait]
impl StatusSource for AvatarHttpSource {
    fn service(&self) -> Service {
        Service::Avatar
    }

    async fn fetch(&self, job_id: &JobId) -> Result<PollReply, TransportError> {
        let url = self.status_url(job_id);
        let fetched = fetch_status::<AvatarStatusResponse>(&self.client, &url).await?;
        Ok(into_reply(fetched, ServiceStatus::Avatar))
    }
}

/// 幻灯片服务: `GET {base}/v1/slides/{id}/status`
#[derive(Debug, Clone)]
pub struct SlidesHttpSource {
    client: Client,
    base_url: String,
}

impl SlidesHttpSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn status_url(&self, job_id: &JobId) -> String {
        join_url(&self.base_url, &format!("v1/slides/{job_id}/status"))
    }
}

#[async_trait]
impl StatusSource for SlidesHttpSource {
    fn service(&self) -> Service {
        Service::Slides
    }

    async fn fetch(&self, job_id: &JobId) -> Result<PollReply, TransportError> {
        let url = self.status_url(job_id);
        let fetched = fetch_status::<SlidesStatusResponse>(&self.client, &url).await?;
        Ok(into_reply(fetched, ServiceStatus::Slides))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_urls() {
        let client = Client::new();
        let job = JobId::from("42");
        assert_eq!(
            AvatarHttpSource::new(client.clone(), "http://avatar:8000/").status_url(&job),
            "http://avatar:8000/v1/video/42/status"
        );
        assert_eq!(
            SlidesHttpSource::new(client, "http://slides:8001").status_url(&job),
            "http://slides:8001/v1/slides/42/status"
        );
    }
}
