use crate::error::{ParseError, SubmitError, TransportError};
use orpheus_common::utils::join_url;
use orpheus_common::{JobId, PromptRequest, PromptResponse, from_json};
use reqwest::Client;
use tracing::info;

/// 核心服务的提交接口
#[derive(Debug, Clone)]
pub struct CoreClient {
    client: Client,
    core_url: String,
}

impl CoreClient {
    pub fn new(client: Client, core_url: impl Into<String>) -> Self {
        Self {
            client,
            core_url: core_url.into(),
        }
    }

    pub fn prompt_url(&self) -> String {
        join_url(&self.core_url, "v1/lecture/prompt")
    }

    /// 提交 prompt，返回后续查询状态所用的 JobId
    pub async fn create_lecture(
        &self,
        prompt: &str,
        course_id: Option<&str>,
    ) -> Result<JobId, SubmitError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }

        let url = self.prompt_url();
        let payload = PromptRequest {
            prompt: prompt.to_string(),
            course_id: course_id.map(str::to_string),
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: PromptResponse = from_json(&body).map_err(|e| ParseError::new(body, e))?;
        info!(job_id = %parsed.prompt_id, "prompt 已提交");
        Ok(parsed.prompt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blank_prompt_is_rejected_locally() {
        // 地址不可达，若真的发出请求会得到传输错误
        let core = CoreClient::new(Client::new(), "http://127.0.0.1:1");
        let err = core.create_lecture("   \n", None).await.unwrap_err();
        assert!(matches!(err, SubmitError::EmptyPrompt));
    }

    #[test]
    fn prompt_url() {
        let core = CoreClient::new(Client::new(), "http://core:8080/");
        assert_eq!(core.prompt_url(), "http://core:8080/v1/lecture/prompt");
    }
}
