use crate::error::{ParseError, TransportError};
use crate::reconciler::{Reconciler, ViewModel, settled_with_failure};
use futures_util::{Stream, StreamExt};
use orpheus_common::utils::join_url;
use orpheus_common::{JobId, PipelineStatus};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource, retry::Never};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 推送通道：逐条产出文本帧，并且可以被显式关闭
pub trait StatusChannel: Stream<Item = Result<String, TransportError>> + Unpin + Send {
    fn close(&mut self);
}

/// 基于 SSE 的推送通道，不做自动重连
pub struct SseChannel {
    url: String,
    source: EventSource,
}

impl SseChannel {
    pub fn connect(client: &Client, url: &str) -> Result<Self, TransportError> {
        let request = client.get(url).header("Accept", "text/event-stream");
        let mut source = EventSource::new(request)
            .map_err(|e| TransportError::Channel(format!("无法创建 SSE 请求: {e}")))?;
        source.set_retry_policy(Box::new(Never));
        Ok(Self {
            url: url.to_string(),
            source,
        })
    }
}

impl Stream for SseChannel {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let event = ready!(self.source.poll_next_unpin(cx));
            let item = match event {
                Some(Ok(Event::Open)) => {
                    debug!(url = %self.url, "推送通道已连接");
                    continue;
                }
                Some(Ok(Event::Message(message))) => Some(Ok(message.data)),
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => None,
                Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, _))) => {
                    Some(Err(TransportError::Status {
                        url: self.url.clone(),
                        status: status.as_u16(),
                        body: String::new(),
                    }))
                }
                Some(Err(e)) => Some(Err(TransportError::Channel(e.to_string()))),
            };
            return Poll::Ready(item);
        }
    }
}

impl StatusChannel for SseChannel {
    fn close(&mut self) {
        self.source.close();
    }
}

/// 订阅产生的事件
#[derive(Debug)]
pub enum FeedEvent {
    Snapshot(PipelineStatus),
    /// 在设定的时间内没有收到任何帧，通道仍然保持打开
    Idle(Duration),
    /// 通道出错，订阅随之关闭，是否重连由调用方决定
    Error(TransportError),
}

pub fn parse_frame(raw: &str) -> Result<PipelineStatus, ParseError> {
    PipelineStatus::from_json(raw).map_err(|e| ParseError::new(raw, e))
}

/// 对单个 JobId 的一次订阅
pub struct Subscription<C: StatusChannel> {
    job_id: JobId,
    channel: Option<C>,
    idle_timeout: Option<Duration>,
}

impl<C: StatusChannel> Subscription<C> {
    pub fn new(job_id: JobId, channel: C) -> Self {
        Self {
            job_id,
            channel: Some(channel),
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// 等待下一个事件；订阅关闭后始终返回 `None`。
    ///
    /// 无法解析的帧会被记录并丢弃，不会结束订阅。
    pub async fn next(&mut self) -> Option<FeedEvent> {
        loop {
            let idle_timeout = self.idle_timeout;
            let channel = self.channel.as_mut()?;
            let frame = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, channel.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        warn!(job_id = %self.job_id, ?limit, "推送通道长时间没有新消息");
                        return Some(FeedEvent::Idle(limit));
                    }
                },
                None => channel.next().await,
            };

            match frame {
                Some(Ok(raw)) => match parse_frame(&raw) {
                    Ok(status) => return Some(FeedEvent::Snapshot(status)),
                    Err(e) => {
                        warn!(job_id = %self.job_id, error = %e, raw = %e.raw, "丢弃无法解析的状态报文");
                        continue;
                    }
                },
                Some(Err(e)) => {
                    error!(job_id = %self.job_id, error = %e, "推送通道出错，订阅已关闭");
                    self.unsubscribe();
                    return Some(FeedEvent::Error(e));
                }
                None => {
                    info!(job_id = %self.job_id, "推送通道已被远端关闭");
                    self.unsubscribe();
                    return None;
                }
            }
        }
    }

    /// 关闭底层通道。可重复调用，通道只会被关闭一次。
    pub fn unsubscribe(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            debug!(job_id = %self.job_id, "已取消订阅");
        }
    }
}

impl<C: StatusChannel> Drop for Subscription<C> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// 打开 `{status_url}/status/{job_id}/live`
pub fn subscribe(
    client: &Client,
    status_url: &str,
    job_id: &JobId,
) -> Result<Subscription<SseChannel>, TransportError> {
    let url = join_url(status_url, &format!("status/{job_id}/live"));
    info!(%url, "正在订阅生成状态");
    let channel = SseChannel::connect(client, &url)?;
    Ok(Subscription::new(job_id.clone(), channel))
}

/// 推送跟踪结束的原因
#[derive(Debug)]
pub enum FollowEnd {
    Complete,
    /// 有步骤失败且不会再有进展
    Settled,
    Closed,
    Failed(TransportError),
}

/// 把订阅中的快照依次合并进 `reconciler`，每次视图变化时回调。
///
/// 全部完成，或者失败后再无进展时，主动取消订阅。
pub async fn follow<C, F>(
    subscription: &mut Subscription<C>,
    reconciler: &mut Reconciler,
    mut on_update: F,
) -> FollowEnd
where
    C: StatusChannel,
    F: FnMut(&ViewModel),
{
    while let Some(event) = subscription.next().await {
        match event {
            FeedEvent::Snapshot(status) => {
                if reconciler.apply(&status) {
                    on_update(reconciler.view());
                }
                if reconciler.view().all_complete {
                    subscription.unsubscribe();
                    return FollowEnd::Complete;
                }
                if settled_with_failure(&reconciler.view().status) {
                    warn!(job_id = %subscription.job_id(), "有步骤失败，停止跟踪");
                    subscription.unsubscribe();
                    return FollowEnd::Settled;
                }
            }
            FeedEvent::Idle(_) => {}
            FeedEvent::Error(e) => return FollowEnd::Failed(e),
        }
    }
    FollowEnd::Closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{IndexBase, MediaLayout};
    use orpheus_common::{AvatarUnit, StepStatus};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubChannel {
        frames: VecDeque<Result<String, TransportError>>,
        closes: Arc<AtomicUsize>,
        hang_when_empty: bool,
    }

    impl StubChannel {
        fn new(frames: Vec<Result<String, TransportError>>) -> (Self, Arc<AtomicUsize>) {
            let closes = Arc::new(AtomicUsize::new(0));
            let channel = Self {
                frames: frames.into(),
                closes: closes.clone(),
                hang_when_empty: false,
            };
            (channel, closes)
        }
    }

    impl Stream for StubChannel {
        type Item = Result<String, TransportError>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.frames.pop_front() {
                Some(frame) => Poll::Ready(Some(frame)),
                None if self.hang_when_empty => Poll::Pending,
                None => Poll::Ready(None),
            }
        }
    }

    impl StatusChannel for StubChannel {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(status: &PipelineStatus) -> Result<String, TransportError> {
        Ok(status.to_json().unwrap())
    }

    fn understanding_done() -> PipelineStatus {
        PipelineStatus {
            step_understanding: StepStatus::Done,
            ..Default::default()
        }
    }

    fn reconciler() -> Reconciler {
        let job = JobId::from("job-1");
        let layout = MediaLayout::for_job("http://media.local", &job, IndexBase::One);
        Reconciler::new(job, layout)
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let (channel, _) = StubChannel::new(vec![
            Ok("{\"stepUnderstanding\": 42}".into()),
            Ok("garbage".into()),
            frame(&understanding_done()),
        ]);
        let mut sub = Subscription::new(JobId::from("job-1"), channel);

        match sub.next().await {
            Some(FeedEvent::Snapshot(status)) => assert_eq!(status, understanding_done()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sub.is_open());
    }

    #[tokio::test]
    async fn transport_error_surfaces_once_and_closes() {
        let (channel, closes) = StubChannel::new(vec![
            Err(TransportError::Channel("connection reset".into())),
            frame(&understanding_done()),
        ]);
        let mut sub = Subscription::new(JobId::from("job-1"), channel);

        assert!(matches!(sub.next().await, Some(FeedEvent::Error(_))));
        assert!(!sub.is_open());
        assert!(sub.next().await.is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn message_after_unsubscribe_is_discarded() {
        let (channel, closes) = StubChannel::new(vec![frame(&understanding_done())]);
        let mut sub = Subscription::new(JobId::from("job-1"), channel);
        let mut reconciler = reconciler();

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let end = follow(&mut sub, &mut reconciler, |_| panic!("view must not change")).await;
        assert!(matches!(end, FollowEnd::Closed));
        assert_eq!(reconciler.view(), &ViewModel::default());

        drop(sub);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_keeps_subscription_open() {
        let (mut channel, closes) = StubChannel::new(vec![]);
        channel.hang_when_empty = true;
        let mut sub = Subscription::new(JobId::from("job-1"), channel)
            .with_idle_timeout(Some(Duration::from_secs(30)));

        assert!(matches!(sub.next().await, Some(FeedEvent::Idle(d)) if d == Duration::from_secs(30)));
        assert!(sub.is_open());
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn follow_stops_when_everything_is_done() {
        let mut done = understanding_done();
        done.step_slide_postprocessing = StepStatus::Done;
        done.steps_avatar_generation = vec![AvatarUnit::uniform(StepStatus::Done)];

        let (channel, closes) = StubChannel::new(vec![
            frame(&understanding_done()),
            frame(&understanding_done()),
            frame(&done),
            frame(&PipelineStatus::default()),
        ]);
        let mut sub = Subscription::new(JobId::from("job-1"), channel);
        let mut reconciler = reconciler();
        let mut updates = 0;

        let end = follow(&mut sub, &mut reconciler, |_| updates += 1).await;
        assert!(matches!(end, FollowEnd::Complete));
        // 重复的快照不会触发回调
        assert_eq!(updates, 2);
        assert_eq!(reconciler.view().ready_media.len(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn follow_stops_once_a_failure_settles() {
        let mut settled = understanding_done();
        settled.step_slide_postprocessing = StepStatus::Done;
        settled.steps_avatar_generation = vec![
            AvatarUnit::uniform(StepStatus::Done),
            AvatarUnit::new(StepStatus::Failed, StepStatus::Done),
        ];

        let (mut channel, closes) = StubChannel::new(vec![frame(&settled)]);
        // 远端不会主动关闭
        channel.hang_when_empty = true;
        let mut sub = Subscription::new(JobId::from("job-1"), channel);
        let mut reconciler = reconciler();

        let end = follow(&mut sub, &mut reconciler, |_| {}).await;
        assert!(matches!(end, FollowEnd::Settled));
        assert!(!reconciler.view().all_complete);
        assert!(!sub.is_open());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
