use crate::reconciler::ViewModel;
use orpheus_common::{PipelineStatus, StepStatus};
use std::fmt;

pub const NO_SUMMARY: &str = "No summary available.";

/// 一个可显示的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    Understanding,
    Lookup,
    Script,
    SlideStructure,
    SlidePostprocessing,
    AvatarVideo(usize),
    AvatarAudio(usize),
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepId::Understanding => f.write_str("Understanding"),
            StepId::Lookup => f.write_str("Lecture Lookup"),
            StepId::Script => f.write_str("Generate Script"),
            StepId::SlideStructure => f.write_str("Slide Structure Generation"),
            StepId::SlidePostprocessing => f.write_str("Slide Post Processing"),
            StepId::AvatarVideo(i) => write!(f, "Avatar {} - Video", i + 1),
            StepId::AvatarAudio(i) => write!(f, "Avatar {} - Audio", i + 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Hidden,
    Spinner,
    Check,
    Cross,
}

impl From<StepStatus> for Indicator {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::NotStarted => Indicator::Hidden,
            StepStatus::InProgress => Indicator::Spinner,
            StepStatus::Done => Indicator::Check,
            StepStatus::Failed => Indicator::Cross,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLine {
    pub id: StepId,
    pub indicator: Indicator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvatarLine {
    pub index: usize,
    pub video: Indicator,
    pub audio: Indicator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlideProgress {
    pub generated: u32,
    pub total: usize,
}

/// 渲染层直接使用的扁平结构
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayState {
    pub steps: Vec<StepLine>,
    pub slides: SlideProgress,
    pub avatar: Vec<AvatarLine>,
    pub summary: String,
    pub outline: Vec<String>,
    pub playlist: Vec<String>,
    pub media_ready: bool,
    pub all_complete: bool,
    pub failed: Vec<StepId>,
}

impl DisplayState {
    pub fn is_failed(&self, id: StepId) -> bool {
        self.failed.contains(&id)
    }
}

fn scalar_steps(status: &PipelineStatus) -> [(StepId, StepStatus); 5] {
    [
        (StepId::Understanding, status.step_understanding),
        (StepId::Lookup, status.step_lookup),
        (StepId::Script, status.step_lecture_script_generation),
        (StepId::SlideStructure, status.step_slide_structure_generation),
        (StepId::SlidePostprocessing, status.step_slide_postprocessing),
    ]
}

pub fn project(view: &ViewModel) -> DisplayState {
    let status = &view.status;
    let mut failed = Vec::new();

    let steps = scalar_steps(status)
        .into_iter()
        .map(|(id, step)| {
            if step == StepStatus::Failed {
                failed.push(id);
            }
            StepLine {
                id,
                indicator: step.into(),
            }
        })
        .collect();

    let avatar = status
        .steps_avatar_generation
        .iter()
        .enumerate()
        .map(|(index, unit)| {
            if unit.video == StepStatus::Failed {
                failed.push(StepId::AvatarVideo(index));
            }
            if unit.audio == StepStatus::Failed {
                failed.push(StepId::AvatarAudio(index));
            }
            AvatarLine {
                index,
                video: unit.video.into(),
                audio: unit.audio.into(),
            }
        })
        .collect();

    let outline = status
        .slide_structure
        .as_ref()
        .map(|s| s.pages.iter().map(|p| p.content.clone()).collect())
        .unwrap_or_default();

    DisplayState {
        steps,
        slides: SlideProgress {
            generated: status.step_slide_generation,
            total: status.total_slides(),
        },
        avatar,
        summary: status
            .lecture_summary
            .clone()
            .unwrap_or_else(|| NO_SUMMARY.to_string()),
        outline,
        playlist: view.ready_media.clone(),
        media_ready: status.step_slide_postprocessing == StepStatus::Done
            && !view.ready_media.is_empty(),
        all_complete: view.all_complete,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{IndexBase, MediaLayout, reconcile};
    use orpheus_common::{AvatarUnit, JobId, SlideStructure};

    fn layout() -> MediaLayout {
        MediaLayout::for_job("http://media", &JobId::from("j"), IndexBase::One)
    }

    #[test]
    fn empty_view_projects_cleanly() {
        let state = project(&ViewModel::default());
        assert_eq!(state.steps.len(), 5);
        assert!(state.steps.iter().all(|s| s.indicator == Indicator::Hidden));
        assert!(state.avatar.is_empty());
        assert_eq!(state.summary, NO_SUMMARY);
        assert_eq!(state.slides, SlideProgress::default());
        assert!(!state.media_ready);
        assert!(!state.all_complete);
        assert!(state.failed.is_empty());
    }

    #[test]
    fn only_understanding_done() {
        let incoming = PipelineStatus {
            step_understanding: StepStatus::Done,
            ..Default::default()
        };
        let view = reconcile(&ViewModel::default(), &incoming, &layout());
        let state = project(&view);

        let checked: Vec<StepId> = state
            .steps
            .iter()
            .filter(|s| s.indicator == Indicator::Check)
            .map(|s| s.id)
            .collect();
        assert_eq!(checked, vec![StepId::Understanding]);
        assert!(state.playlist.is_empty());
        assert!(!state.all_complete);
    }

    #[test]
    fn failures_and_media_are_reported() {
        let incoming = PipelineStatus {
            step_slide_postprocessing: StepStatus::Done,
            step_slide_generation: 1,
            lecture_summary: Some("Loops in Rust".into()),
            slide_structure: Some(SlideStructure::from_contents(["Intro", "for loops"])),
            steps_avatar_generation: vec![
                AvatarUnit::uniform(StepStatus::Done),
                AvatarUnit::new(StepStatus::InProgress, StepStatus::Failed),
            ],
            ..Default::default()
        };
        let view = reconcile(&ViewModel::default(), &incoming, &layout());
        let state = project(&view);

        assert_eq!(state.summary, "Loops in Rust");
        assert_eq!(state.outline, vec!["Intro", "for loops"]);
        assert_eq!(state.slides, SlideProgress { generated: 1, total: 2 });
        assert_eq!(state.playlist, vec!["http://media/jobs/j/1.mp4"]);
        assert!(state.media_ready);
        assert_eq!(state.failed, vec![StepId::AvatarAudio(1)]);
        assert_eq!(state.avatar[1].video, Indicator::Spinner);
        assert_eq!(state.avatar[1].audio, Indicator::Cross);
    }

    #[test]
    fn labels() {
        assert_eq!(StepId::Lookup.to_string(), "Lecture Lookup");
        assert_eq!(StepId::AvatarVideo(0).to_string(), "Avatar 1 - Video");
        assert_eq!(StepId::AvatarAudio(2).to_string(), "Avatar 3 - Audio");
    }
}
