use crate::status::{AvatarUnit, JobId, SlideStructure, StepStatus};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

// 提交接口
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub prompt_id: JobId,
}

/// 服务端返回的错误描述
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorModel {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// 数字人服务轮询接口: GET /v1/video/{lectureId}/status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvatarStatusResponse {
    pub lecture_id: JobId,
    pub status: StepStatus,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// 完成后分段视频所在的目录地址
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorModel>,
    /// 服务端估计的剩余秒数，用于决定下一次轮询的间隔
    #[serde(default)]
    pub estimated_seconds_remaining: Option<u64>,
    /// 逐分段的进度；缺省时整体状态适用于所有已知分段
    #[serde(default)]
    pub segments: Option<Vec<AvatarUnit>>,
}

// 幻灯片服务轮询接口: GET /v1/slides/{lectureId}/status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlidesStatusResponse {
    pub lecture_id: JobId,
    pub status: StepStatus,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// 幻灯片成品地址（不参与视频地址推导）
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorModel>,
    #[serde(default)]
    pub slide_structure: Option<SlideStructure>,
    #[serde(default)]
    pub generated_slides: Option<u32>,
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_response_optional_fields_default() {
        let resp: AvatarStatusResponse = from_json(
            r#"{"lectureId": "abc", "status": "IN_PROGRESS", "estimatedSecondsRemaining": 12}"#,
        )
        .unwrap();
        assert_eq!(resp.lecture_id.as_str(), "abc");
        assert_eq!(resp.status, StepStatus::InProgress);
        assert_eq!(resp.estimated_seconds_remaining, Some(12));
        assert!(resp.segments.is_none());
        assert!(resp.result_url.is_none());
    }

    #[test]
    fn prompt_request_skips_missing_course() {
        let req = PromptRequest {
            prompt: "explain for loops".into(),
            course_id: None,
        };
        assert_eq!(to_json(&req).unwrap(), r#"{"prompt":"explain for loops"}"#);

        let resp: PromptResponse = from_json(r#"{"promptId": "8df92d96"}"#).unwrap();
        assert_eq!(resp.prompt_id, JobId::from("8df92d96"));
    }
}
