pub mod handler;
pub mod manager;

pub use manager::{DEFAULT_MAX_JOBS, StatusManager};

use axum::{
    Router,
    routing::{get, patch},
};
use tower_http::trace::TraceLayer;

/// | Method | Path | Description |
/// |--------|------|-------------|
/// | GET | `/` | 健康检查 |
/// | GET | `/status/{job_id}` | 当前状态快照 |
/// | PATCH | `/status/{job_id}/update` | 应用状态补丁 |
/// | GET | `/status/{job_id}/live` | SSE 推送，先发当前快照 |
pub fn router(manager: StatusManager) -> Router {
    Router::new()
        .route("/", get(handler::healthy))
        .route("/status/{job_id}", get(handler::get_status))
        .route("/status/{job_id}/update", patch(handler::update_status))
        .route("/status/{job_id}/live", get(handler::live))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}
