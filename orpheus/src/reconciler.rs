use orpheus_common::utils::{join_url, trim_base};
use orpheus_common::{JobId, PipelineStatus, StepStatus};
use serde::{Deserialize, Serialize};

/// 分段视频文件名的起始编号
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IndexBase {
    Zero,
    #[default]
    One,
}

impl IndexBase {
    fn offset(self) -> usize {
        match self {
            IndexBase::Zero => 0,
            IndexBase::One => 1,
        }
    }
}

impl TryFrom<u8> for IndexBase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IndexBase::Zero),
            1 => Ok(IndexBase::One),
            other => Err(format!("video_index_base 只能是 0 或 1, 实际为 {other}")),
        }
    }
}

impl From<IndexBase> for u8 {
    fn from(value: IndexBase) -> Self {
        value.offset() as u8
    }
}

/// 由结果目录与分段序号推导视频地址的规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLayout {
    fallback_base: String,
    index_base: IndexBase,
}

impl MediaLayout {
    pub const EXTENSION: &'static str = "mp4";

    pub fn new(fallback_base: impl Into<String>, index_base: IndexBase) -> Self {
        Self {
            fallback_base: fallback_base.into(),
            index_base,
        }
    }

    /// 在快照未给出结果目录时，使用 `{media_base_url}/jobs/{job_id}`
    pub fn for_job(media_base_url: &str, job_id: &JobId, index_base: IndexBase) -> Self {
        Self::new(join_url(media_base_url, &format!("jobs/{job_id}")), index_base)
    }

    pub fn segment_url(&self, result_base: Option<&str>, index: usize) -> String {
        let base = trim_base(result_base.unwrap_or(&self.fallback_base));
        format!(
            "{base}/{}.{}",
            index + self.index_base.offset(),
            Self::EXTENSION
        )
    }
}

/// 面向界面的合并结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewModel {
    pub status: PipelineStatus,
    /// 可以按顺序播放的视频地址，中间不允许有空缺
    pub ready_media: Vec<String>,
    pub all_complete: bool,
}

/// 把一次新快照合并进之前的视图。纯函数，不做任何 I/O。
pub fn reconcile(
    previous: &ViewModel,
    incoming: &PipelineStatus,
    layout: &MediaLayout,
) -> ViewModel {
    let status = merge_status(&previous.status, incoming);
    let ready_media = ready_media(&status, layout);
    let all_complete = all_complete(&status);
    ViewModel {
        status,
        ready_media,
        all_complete,
    }
}

fn merge_status(prev: &PipelineStatus, incoming: &PipelineStatus) -> PipelineStatus {
    // 分段按索引对齐合并；新快照更短时保留尾部，更长时直接追加
    let mut units = prev.steps_avatar_generation.clone();
    for (i, unit) in incoming.steps_avatar_generation.iter().enumerate() {
        match units.get_mut(i) {
            Some(slot) => *slot = slot.merge(*unit),
            None => units.push(*unit),
        }
    }

    let mut merged = PipelineStatus {
        step_understanding: prev.step_understanding.merge(incoming.step_understanding),
        step_lookup: prev.step_lookup.merge(incoming.step_lookup),
        step_lecture_script_generation: prev
            .step_lecture_script_generation
            .merge(incoming.step_lecture_script_generation),
        step_slide_structure_generation: prev
            .step_slide_structure_generation
            .merge(incoming.step_slide_structure_generation),
        step_slide_generation: prev
            .step_slide_generation
            .max(incoming.step_slide_generation),
        step_slide_postprocessing: prev
            .step_slide_postprocessing
            .merge(incoming.step_slide_postprocessing),
        steps_avatar_generation: units,
        lecture_summary: incoming
            .lecture_summary
            .clone()
            .or_else(|| prev.lecture_summary.clone()),
        slide_structure: incoming
            .slide_structure
            .clone()
            .or_else(|| prev.slide_structure.clone()),
        result_base_url: incoming
            .result_base_url
            .clone()
            .or_else(|| prev.result_base_url.clone()),
    };
    merged.pad_avatar_units();
    merged
}

/// 从第 0 个分段开始扫描，遇到第一个视频未完成的分段即停止
pub fn ready_media(status: &PipelineStatus, layout: &MediaLayout) -> Vec<String> {
    let base = status.result_base_url.as_deref();
    status
        .steps_avatar_generation
        .iter()
        .take_while(|unit| unit.video == StepStatus::Done)
        .enumerate()
        .map(|(i, _)| layout.segment_url(base, i))
        .collect()
}

pub fn all_complete(status: &PipelineStatus) -> bool {
    status.step_slide_postprocessing == StepStatus::Done
        && status
            .steps_avatar_generation
            .iter()
            .all(|unit| unit.video == StepStatus::Done)
}

/// 已有步骤失败，并且不会再有任何进展：
/// 上游步骤（理解到幻灯片结构）失败，或者后处理与所有分段都已终止
pub fn settled_with_failure(status: &PipelineStatus) -> bool {
    let upstream = [
        status.step_understanding,
        status.step_lookup,
        status.step_lecture_script_generation,
        status.step_slide_structure_generation,
    ];
    if upstream.contains(&StepStatus::Failed) {
        return true;
    }

    let units = &status.steps_avatar_generation;
    let downstream_failed = status.step_slide_postprocessing == StepStatus::Failed
        || units
            .iter()
            .any(|u| u.video == StepStatus::Failed || u.audio == StepStatus::Failed);

    downstream_failed
        && status.step_slide_postprocessing.is_terminal()
        && units
            .iter()
            .all(|u| u.video.is_terminal() && u.audio.is_terminal())
}

/// 某个订阅独占的视图状态
#[derive(Debug, Clone)]
pub struct Reconciler {
    job_id: JobId,
    layout: MediaLayout,
    view: ViewModel,
}

impl Reconciler {
    pub fn new(job_id: JobId, layout: MediaLayout) -> Self {
        Self::with_view(job_id, layout, ViewModel::default())
    }

    /// 从已有视图继续（例如推送失败后切换到轮询）
    pub fn with_view(job_id: JobId, layout: MediaLayout, view: ViewModel) -> Self {
        Self {
            job_id,
            layout,
            view,
        }
    }

    /// 返回视图是否发生了变化
    pub fn apply(&mut self, incoming: &PipelineStatus) -> bool {
        let next = reconcile(&self.view, incoming, &self.layout);
        if next == self.view {
            return false;
        }
        self.view = next;
        true
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn view(&self) -> &ViewModel {
        &self.view
    }

    pub fn into_parts(self) -> (JobId, MediaLayout, ViewModel) {
        (self.job_id, self.layout, self.view)
    }
}
