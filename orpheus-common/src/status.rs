use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// 一次生成请求（用户提交的一个 prompt）的关联标识
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// 流水线中单个步骤的进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Done,
    Failed,
}

impl StepStatus {
    /// 合并时使用的次序: NOT_STARTED < IN_PROGRESS < DONE < FAILED
    fn rank(self) -> u8 {
        match self {
            StepStatus::NotStarted => 0,
            StepStatus::InProgress => 1,
            StepStatus::Done => 2,
            StepStatus::Failed => 3,
        }
    }

    /// 单调合并：取两者中较靠后的状态，FAILED 一旦出现便不再改变
    pub fn merge(self, incoming: StepStatus) -> StepStatus {
        if incoming.rank() > self.rank() {
            incoming
        } else {
            self
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::NotStarted => "NOT_STARTED",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Done => "DONE",
            StepStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个分段（对应一页幻灯片）的数字人视频与音频生成进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarUnit {
    pub video: StepStatus,
    pub audio: StepStatus,
}

impl AvatarUnit {
    pub fn new(video: StepStatus, audio: StepStatus) -> Self {
        Self { video, audio }
    }

    /// 视频与音频使用同一个状态
    pub fn uniform(status: StepStatus) -> Self {
        Self::new(status, status)
    }

    pub fn merge(self, incoming: AvatarUnit) -> AvatarUnit {
        AvatarUnit {
            video: self.video.merge(incoming.video),
            audio: self.audio.merge(incoming.audio),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidePage {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideStructure {
    pub pages: Vec<SlidePage>,
}

impl SlideStructure {
    pub fn from_contents<I, S>(contents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pages: contents
                .into_iter()
                .map(|c| SlidePage { content: c.into() })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// 状态服务推送的完整快照（不是增量）。
///
/// 标量步骤与 `stepsAvatarGeneration` 是必填字段，缺失即视为报文无效。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub step_understanding: StepStatus,
    pub step_lookup: StepStatus,
    pub step_lecture_script_generation: StepStatus,
    pub step_slide_structure_generation: StepStatus,
    /// 已生成的幻灯片数量
    pub step_slide_generation: u32,
    pub step_slide_postprocessing: StepStatus,
    pub steps_avatar_generation: Vec<AvatarUnit>,
    #[serde(default)]
    pub lecture_summary: Option<String>,
    #[serde(default)]
    pub slide_structure: Option<SlideStructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_base_url: Option<String>,
}

impl PipelineStatus {
    /// 幻灯片总数，由幻灯片结构的页数得出
    pub fn total_slides(&self) -> usize {
        self.slide_structure.as_ref().map_or(0, SlideStructure::len)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 按幻灯片页数补齐数字人分段，新分段均为 NOT_STARTED
    pub fn pad_avatar_units(&mut self) {
        let expected = self.total_slides();
        if self.steps_avatar_generation.len() < expected {
            self.steps_avatar_generation
                .resize(expected, AvatarUnit::default());
        }
    }

    /// 状态服务端的补丁语义：出现的字段直接覆盖（后写者胜），
    /// 分段按索引写入，写入前先按幻灯片页数补齐。
    pub fn apply_patch(&mut self, patch: &StatusPatch) {
        if let Some(s) = patch.step_understanding {
            self.step_understanding = s;
        }
        if let Some(s) = patch.step_lookup {
            self.step_lookup = s;
        }
        if let Some(s) = patch.step_lecture_script_generation {
            self.step_lecture_script_generation = s;
        }
        if let Some(s) = patch.step_slide_structure_generation {
            self.step_slide_structure_generation = s;
        }
        if let Some(n) = patch.step_slide_generation {
            self.step_slide_generation = n;
        }
        if let Some(s) = patch.step_slide_postprocessing {
            self.step_slide_postprocessing = s;
        }
        if let Some(summary) = &patch.lecture_summary {
            self.lecture_summary = Some(summary.clone());
        }
        if let Some(structure) = &patch.slide_structure {
            self.slide_structure = Some(structure.clone());
        }
        if let Some(url) = &patch.result_base_url {
            self.result_base_url = Some(url.clone());
        }

        self.pad_avatar_units();

        if let Some(units) = &patch.steps_avatar_generation {
            for (key, unit) in units {
                let idx = match key.parse::<usize>() {
                    Ok(idx) => idx,
                    Err(e) => {
                        warn!(key = %key, error = %e, "无法将分段索引转换为整数，已跳过");
                        continue;
                    }
                };
                match self.steps_avatar_generation.get_mut(idx) {
                    Some(slot) => *slot = *unit,
                    None => warn!(
                        index = idx,
                        len = self.steps_avatar_generation.len(),
                        "分段索引越界，已跳过"
                    ),
                }
            }
        }
    }
}

/// 对状态的局部更新，所有字段均可缺省。
///
/// `stepsAvatarGeneration` 是 "索引字符串 -> 分段状态" 的映射。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_understanding: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_lookup: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_lecture_script_generation: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_slide_structure_generation: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_slide_generation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_slide_postprocessing: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_avatar_generation: Option<BTreeMap<String, AvatarUnit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lecture_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_structure: Option<SlideStructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_base_url: Option<String>,
}
