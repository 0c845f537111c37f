pub mod config;
pub mod error;
pub mod feed;
pub mod http;
pub mod polling;
pub mod projector;
pub mod reconciler;
pub mod submit;

pub use orpheus_common::{AvatarUnit, JobId, PipelineStatus, StepStatus};
