use crate::error::{ParseError, TransportError};
use crate::reconciler::{MediaLayout, Reconciler, ViewModel, reconcile};
use async_trait::async_trait;
use orpheus_common::{
    AvatarStatusResponse, AvatarUnit, JobId, PipelineStatus, SlidesStatusResponse, StepStatus,
};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 连续出错时退避间隔的上限
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Avatar,
    Slides,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Avatar => f.write_str("avatar"),
            Service::Slides => f.write_str("slides"),
        }
    }
}

/// 某个服务返回的局部状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Avatar(AvatarStatusResponse),
    Slides(SlidesStatusResponse),
}

impl ServiceStatus {
    pub fn step(&self) -> StepStatus {
        match self {
            ServiceStatus::Avatar(resp) => resp.status,
            ServiceStatus::Slides(resp) => resp.status,
        }
    }

    /// 服务端给出的剩余时间估计，只有数字人服务提供
    pub fn eta(&self) -> Option<Duration> {
        match self {
            ServiceStatus::Avatar(resp) => resp.estimated_seconds_remaining.map(Duration::from_secs),
            ServiceStatus::Slides(_) => None,
        }
    }

    /// 没有分段明细的数字人终止状态，对之后出现的分段同样成立
    pub fn uniform_avatar(&self) -> Option<StepStatus> {
        match self {
            ServiceStatus::Avatar(resp) if resp.segments.is_none() && resp.status.is_terminal() => {
                Some(resp.status)
            }
            _ => None,
        }
    }

    /// 转换成与推送快照相同的形状，未涉及的字段保持 NOT_STARTED / 缺省，
    /// 单调合并时不会产生影响。
    pub fn to_snapshot(&self, known_units: usize) -> PipelineStatus {
        match self {
            ServiceStatus::Avatar(resp) => PipelineStatus {
                steps_avatar_generation: match &resp.segments {
                    Some(segments) => segments.clone(),
                    None => vec![AvatarUnit::uniform(resp.status); known_units],
                },
                result_base_url: resp.result_url.clone(),
                ..Default::default()
            },
            ServiceStatus::Slides(resp) => PipelineStatus {
                step_slide_postprocessing: resp.status,
                step_slide_generation: resp.generated_slides.unwrap_or(0),
                slide_structure: resp.slide_structure.clone(),
                ..Default::default()
            },
        }
    }
}

/// 一次轮询请求的结果（传输错误除外）
#[derive(Debug)]
pub enum PollReply {
    /// 404: 资源尚未创建，即 "还没开始"
    NotFound,
    Malformed(ParseError),
    Status(ServiceStatus),
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    fn service(&self) -> Service;

    async fn fetch(&self, job_id: &JobId) -> Result<PollReply, TransportError>;
}

/// 重试耗尽时合成的终止状态
pub fn synthetic_failure(service: Service, known_units: usize) -> PipelineStatus {
    match service {
        Service::Slides => PipelineStatus {
            step_slide_postprocessing: StepStatus::Failed,
            ..Default::default()
        },
        Service::Avatar => PipelineStatus {
            steps_avatar_generation: vec![AvatarUnit::uniform(StepStatus::Failed); known_units],
            ..Default::default()
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling { attempt: u32 },
    Done,
    Failed,
    /// 连续出错超过上限
    Exhausted,
    Cancelled,
}

impl LoopState {
    pub fn is_finished(self) -> bool {
        !matches!(self, LoopState::Idle | LoopState::Polling { .. })
    }
}

/// 轮询间隔策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    Fixed(Duration),
    /// 优先使用服务端的剩余时间估计（不低于 `min`），否则用 `fallback`
    Hinted { fallback: Duration, min: Duration },
}

impl Pace {
    pub fn delay(&self, hint: Option<Duration>) -> Duration {
        match *self {
            Pace::Fixed(delay) => delay,
            Pace::Hinted { fallback, min } => hint.map_or(fallback, |h| h.max(min)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotFound,
    Malformed,
    Progress {
        step: StepStatus,
        hint: Option<Duration>,
    },
    TransportError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Sleep(Duration),
    Stop,
}

/// 单个轮询循环的状态机: Idle -> Polling -> Done / Failed / Exhausted
#[derive(Debug, Clone)]
pub struct PollMachine {
    pace: Pace,
    max_retries: u32,
    consecutive_errors: u32,
    attempts: u32,
    state: LoopState,
}

impl PollMachine {
    pub fn new(pace: Pace, max_retries: u32) -> Self {
        Self {
            pace,
            max_retries,
            consecutive_errors: 0,
            attempts: 0,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.state = LoopState::Polling {
            attempt: self.attempts,
        };
        self.attempts
    }

    pub fn cancel(&mut self) {
        if !self.state.is_finished() {
            self.state = LoopState::Cancelled;
        }
    }

    pub fn record(&mut self, outcome: Outcome) -> Next {
        match outcome {
            Outcome::NotFound => {
                self.consecutive_errors = 0;
                Next::Sleep(self.pace.delay(None))
            }
            Outcome::Malformed => Next::Sleep(self.pace.delay(None)),
            Outcome::Progress { step, hint } => {
                self.consecutive_errors = 0;
                match step {
                    StepStatus::Done => {
                        self.state = LoopState::Done;
                        Next::Stop
                    }
                    StepStatus::Failed => {
                        self.state = LoopState::Failed;
                        Next::Stop
                    }
                    StepStatus::NotStarted | StepStatus::InProgress => {
                        Next::Sleep(self.pace.delay(hint))
                    }
                }
            }
            Outcome::TransportError => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > self.max_retries {
                    self.state = LoopState::Exhausted;
                    return Next::Stop;
                }
                let factor = 1u32 << self.consecutive_errors.saturating_sub(1).min(4);
                let delay = self
                    .pace
                    .delay(None)
                    .checked_mul(factor)
                    .unwrap_or(MAX_BACKOFF);
                Next::Sleep(delay.min(MAX_BACKOFF))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub slides_interval: Duration,
    pub avatar_fallback: Duration,
    pub min_delay: Duration,
    pub max_retries: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            slides_interval: Duration::from_secs(3),
            avatar_fallback: Duration::from_secs(5),
            min_delay: Duration::from_millis(500),
            max_retries: 5,
        }
    }
}

impl PollSettings {
    fn machine_for(&self, service: Service) -> PollMachine {
        let pace = match service {
            Service::Slides => Pace::Fixed(self.slides_interval),
            Service::Avatar => Pace::Hinted {
                fallback: self.avatar_fallback,
                min: self.min_delay,
            },
        };
        PollMachine::new(pace, self.max_retries)
    }
}

#[derive(Clone)]
pub struct PollSources {
    pub avatar: Arc<dyn StatusSource>,
    pub slides: Arc<dyn StatusSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub service: Service,
    pub state: LoopState,
    pub attempts: u32,
}

/// 两个轮询循环共享的视图
#[derive(Clone)]
struct Shared {
    job_id: JobId,
    layout: Arc<MediaLayout>,
    view: Arc<watch::Sender<ViewModel>>,
    token: CancellationToken,
    /// 数字人服务给出的整体终止状态，之后每次合并都套用到全部分段上
    avatar_fill: Arc<Mutex<Option<StepStatus>>>,
}

impl Shared {
    fn hold_avatar_fill(&self, status: StepStatus) {
        let mut fill = self.avatar_fill.lock().unwrap_or_else(PoisonError::into_inner);
        *fill = Some(fill.map_or(status, |prev| prev.merge(status)));
    }

    /// 合并在 watch 的写锁内完成，并在锁内检查取消标记
    fn merge(&self, build: impl FnOnce(usize) -> PipelineStatus) -> bool {
        self.view.send_if_modified(|view| {
            if self.token.is_cancelled() {
                return false;
            }
            let incoming = build(view.status.steps_avatar_generation.len());
            let mut next = reconcile(view, &incoming, &self.layout);
            let fill = *self.avatar_fill.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(fill) = fill {
                // 页数可能在这次合并中才确定，补齐后再套一次
                let units = next.status.steps_avatar_generation.len();
                let filled = PipelineStatus {
                    steps_avatar_generation: vec![AvatarUnit::uniform(fill); units],
                    ..Default::default()
                };
                next = reconcile(&next, &filled, &self.layout);
            }
            if next == *view {
                return false;
            }
            *view = next;
            true
        })
    }
}

/// 轮询的句柄；调用 `cancel` 或 drop 之后不会再有任何合并发生
pub struct PollHandle {
    job_id: JobId,
    token: CancellationToken,
    view: Arc<watch::Sender<ViewModel>>,
    tasks: Vec<JoinHandle<LoopReport>>,
}

impl PollHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        // 取得一次写锁，确保正在进行的合并已经结束
        self.view.send_if_modified(|_| false);
        for task in &self.tasks {
            task.abort();
        }
        info!(job_id = %self.job_id, "轮询已取消");
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 两个循环是否都已结束
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }

    pub fn view(&self) -> ViewModel {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewModel> {
        self.view.subscribe()
    }

    /// 等待两个循环结束并取回各自的结果
    pub async fn join(mut self) -> Vec<LoopReport> {
        let mut reports = Vec::new();
        for task in std::mem::take(&mut self.tasks) {
            match task.await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_cancelled() => debug!("轮询任务已被中止"),
                Err(e) => error!(error = ?e, "轮询任务异常退出"),
            }
        }
        reports
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// 启动数字人与幻灯片两个独立的轮询循环，从 `reconciler` 当前的视图继续
pub fn start(
    reconciler: Reconciler,
    sources: PollSources,
    settings: &PollSettings,
) -> (PollHandle, watch::Receiver<ViewModel>) {
    let (job_id, layout, view) = reconciler.into_parts();
    let (view_tx, view_rx) = watch::channel(view);
    let shared = Shared {
        job_id: job_id.clone(),
        layout: Arc::new(layout),
        view: Arc::new(view_tx),
        token: CancellationToken::new(),
        avatar_fill: Arc::default(),
    };

    info!(%job_id, "开始轮询生成状态");

    let tasks = [sources.avatar, sources.slides]
        .into_iter()
        .map(|source| {
            let machine = settings.machine_for(source.service());
            tokio::spawn(run_loop(source, machine, shared.clone()))
        })
        .collect();

    let handle = PollHandle {
        job_id,
        token: shared.token.clone(),
        view: shared.view.clone(),
        tasks,
    };
    (handle, view_rx)
}

async fn run_loop(
    source: Arc<dyn StatusSource>,
    mut machine: PollMachine,
    shared: Shared,
) -> LoopReport {
    let service = source.service();

    loop {
        let attempt = machine.begin_attempt();

        let reply = tokio::select! {
            _ = shared.token.cancelled() => break,
            reply = source.fetch(&shared.job_id) => reply,
        };

        let outcome = match reply {
            Ok(PollReply::NotFound) => {
                debug!(%service, attempt, "资源尚未创建");
                Outcome::NotFound
            }
            Ok(PollReply::Malformed(e)) => {
                warn!(%service, attempt, error = %e, "丢弃无法解析的轮询结果");
                Outcome::Malformed
            }
            Ok(PollReply::Status(status)) => {
                if let Some(fill) = status.uniform_avatar() {
                    shared.hold_avatar_fill(fill);
                }
                shared.merge(|known| status.to_snapshot(known));
                debug!(%service, attempt, step = %status.step(), "收到轮询结果");
                Outcome::Progress {
                    step: status.step(),
                    hint: status.eta(),
                }
            }
            Err(e) => {
                warn!(%service, attempt, error = %e, "轮询请求失败");
                Outcome::TransportError
            }
        };

        match machine.record(outcome) {
            Next::Sleep(delay) => {
                tokio::select! {
                    _ = shared.token.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
            Next::Stop => {
                if machine.state() == LoopState::Exhausted {
                    error!(
                        %service,
                        attempts = machine.attempts(),
                        "连续失败次数超过上限，停止轮询并标记为失败"
                    );
                    if service == Service::Avatar {
                        shared.hold_avatar_fill(StepStatus::Failed);
                    }
                    shared.merge(|known| synthetic_failure(service, known));
                } else {
                    info!(%service, state = ?machine.state(), "轮询结束");
                }
                return LoopReport {
                    service,
                    state: machine.state(),
                    attempts: machine.attempts(),
                };
            }
        }
    }

    machine.cancel();
    LoopReport {
        service,
        state: machine.state(),
        attempts: machine.attempts(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn progress(step: StepStatus) -> Outcome {
        Outcome::Progress { step, hint: None }
    }

    #[test]
    fn not_found_then_done() {
        let mut m = PollMachine::new(Pace::Fixed(secs(3)), 2);
        assert_eq!(m.state(), LoopState::Idle);

        assert_eq!(m.begin_attempt(), 1);
        assert_eq!(m.record(Outcome::NotFound), Next::Sleep(secs(3)));
        assert_eq!(m.consecutive_errors(), 0);
        assert_eq!(m.state(), LoopState::Polling { attempt: 1 });

        m.begin_attempt();
        assert_eq!(m.record(progress(StepStatus::Done)), Next::Stop);
        assert_eq!(m.state(), LoopState::Done);
    }

    #[test]
    fn errors_beyond_budget_exhaust_the_loop() {
        let mut m = PollMachine::new(Pace::Fixed(secs(2)), 2);
        m.begin_attempt();
        assert_eq!(m.record(Outcome::TransportError), Next::Sleep(secs(2)));
        m.begin_attempt();
        assert_eq!(m.record(Outcome::TransportError), Next::Sleep(secs(4)));
        m.begin_attempt();
        assert_eq!(m.record(Outcome::TransportError), Next::Stop);
        assert_eq!(m.state(), LoopState::Exhausted);
        assert_eq!(m.attempts(), 3);
    }

    #[test]
    fn success_resets_error_counter() {
        let mut m = PollMachine::new(Pace::Fixed(secs(1)), 1);
        m.record(Outcome::TransportError);
        m.record(progress(StepStatus::InProgress));
        assert_eq!(m.consecutive_errors(), 0);
        assert_eq!(m.record(Outcome::TransportError), Next::Sleep(secs(1)));

        // 解析失败不计入也不清零
        m.record(Outcome::Malformed);
        assert_eq!(m.consecutive_errors(), 1);
        assert_eq!(m.record(Outcome::TransportError), Next::Stop);
    }

    #[test]
    fn backoff_is_capped() {
        let mut m = PollMachine::new(Pace::Fixed(secs(10)), 100);
        let mut last = Duration::ZERO;
        for _ in 0..8 {
            if let Next::Sleep(d) = m.record(Outcome::TransportError) {
                last = d;
            }
        }
        assert_eq!(last, MAX_BACKOFF);
    }

    #[test]
    fn hinted_pace_follows_server_estimate() {
        let pace = Pace::Hinted {
            fallback: secs(5),
            min: Duration::from_millis(500),
        };
        assert_eq!(pace.delay(Some(secs(42))), secs(42));
        assert_eq!(pace.delay(Some(Duration::ZERO)), Duration::from_millis(500));
        assert_eq!(pace.delay(None), secs(5));

        let mut m = PollMachine::new(pace, 3);
        let next = m.record(Outcome::Progress {
            step: StepStatus::InProgress,
            hint: Some(secs(20)),
        });
        assert_eq!(next, Next::Sleep(secs(20)));
    }

    #[test]
    fn failed_status_ends_loop() {
        let mut m = PollMachine::new(Pace::Fixed(secs(1)), 3);
        assert_eq!(m.record(progress(StepStatus::Failed)), Next::Stop);
        assert_eq!(m.state(), LoopState::Failed);
        m.cancel();
        assert_eq!(m.state(), LoopState::Failed);
    }

    #[test]
    fn avatar_status_without_segments_covers_known_units() {
        let status = ServiceStatus::Avatar(AvatarStatusResponse {
            lecture_id: JobId::from("job-1"),
            status: StepStatus::Done,
            last_updated: None,
            result_url: Some("http://cdn/jobs/job-1".into()),
            error: None,
            estimated_seconds_remaining: None,
            segments: None,
        });
        let snapshot = status.to_snapshot(3);
        assert_eq!(
            snapshot.steps_avatar_generation,
            vec![AvatarUnit::uniform(StepStatus::Done); 3]
        );
        assert_eq!(snapshot.result_base_url.as_deref(), Some("http://cdn/jobs/job-1"));
        assert_eq!(snapshot.step_slide_postprocessing, StepStatus::NotStarted);
    }

    #[test]
    fn synthetic_failure_targets_service_steps() {
        let slides = synthetic_failure(Service::Slides, 2);
        assert_eq!(slides.step_slide_postprocessing, StepStatus::Failed);
        assert!(slides.steps_avatar_generation.is_empty());

        let avatar = synthetic_failure(Service::Avatar, 2);
        assert_eq!(avatar.step_slide_postprocessing, StepStatus::NotStarted);
        assert_eq!(
            avatar.steps_avatar_generation,
            vec![AvatarUnit::uniform(StepStatus::Failed); 2]
        );
    }

    #[test]
    fn huge_interval_backoff_saturates() {
        let mut m = PollMachine::new(Pace::Fixed(Duration::MAX), 10);
        for _ in 0..6 {
            assert_eq!(m.record(Outcome::TransportError), Next::Sleep(MAX_BACKOFF));
        }
        assert_eq!(m.consecutive_errors(), 6);
    }

    #[test]
    fn only_terminal_avatar_without_segments_fills() {
        let avatar = |status, segments| {
            ServiceStatus::Avatar(AvatarStatusResponse {
                lecture_id: JobId::from("job-1"),
                status,
                last_updated: None,
                result_url: None,
                error: None,
                estimated_seconds_remaining: None,
                segments,
            })
        };
        assert_eq!(avatar(StepStatus::Done, None).uniform_avatar(), Some(StepStatus::Done));
        assert_eq!(avatar(StepStatus::Failed, None).uniform_avatar(), Some(StepStatus::Failed));
        assert_eq!(avatar(StepStatus::InProgress, None).uniform_avatar(), None);
        assert_eq!(avatar(StepStatus::Done, Some(Vec::new())).uniform_avatar(), None);
    }
}
