use crate::manager::StatusManager;
use async_stream::stream;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::Stream;
use orpheus_common::{JobId, PipelineStatus, StatusPatch};
use std::convert::Infallible;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

#[instrument]
pub async fn healthy() -> impl IntoResponse {
    info!("健康检查请求");
    StatusCode::OK
}

#[instrument(skip(manager))]
pub async fn get_status(
    State(manager): State<StatusManager>,
    Path(job_id): Path<JobId>,
) -> Json<PipelineStatus> {
    Json(manager.get_status(&job_id))
}

/// 请求体手动解析，格式错误统一返回 400
#[instrument(skip(manager, body))]
pub async fn update_status(
    State(manager): State<StatusManager>,
    Path(job_id): Path<JobId>,
    body: String,
) -> Result<StatusCode, Response> {
    let patch: StatusPatch = serde_json::from_str(&body).map_err(|e| {
        warn!(error = %e, "无法解析状态补丁");
        (StatusCode::BAD_REQUEST, format!("无效的状态补丁: {e}")).into_response()
    })?;

    manager.update_status(&job_id, &patch);
    info!("状态已更新");
    Ok(StatusCode::NO_CONTENT)
}

fn to_event(status: &PipelineStatus) -> Option<Event> {
    match status.to_json() {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            error!(error = %e, "无法序列化状态快照");
            None
        }
    }
}

/// curl -N -H "Accept: text/event-stream" http://127.0.0.1:19910/status/{job_id}/live
#[instrument(skip(manager))]
pub async fn live(
    State(manager): State<StatusManager>,
    Path(job_id): Path<JobId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (current, mut rx) = manager.subscribe(&job_id);

    let event_stream = stream! {
        // 先发送当前快照
        if let Some(event) = to_event(&current) {
            yield Ok::<Event, Infallible>(event);
        }

        loop {
            match rx.recv().await {
                Ok(status) => {
                    if let Some(event) = to_event(&status) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // 每一帧都是完整快照，跳过即可
                    warn!(%job_id, count = n, "SSE 客户端接收滞后，跳过了 {} 个快照", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(%job_id, "广播通道已关闭，SSE 流正常结束");
                    break;
                }
            }
        }
    };

    Sse::new(event_stream).keep_alive(KeepAlive::default())
}
