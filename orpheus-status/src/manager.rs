use orpheus_common::{JobId, PipelineStatus, StatusPatch};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 每个订阅者最多缓存的快照数，落后更多时会跳过旧快照
const CHANNEL_CAPACITY: usize = 64;

/// 默认最多保留的任务数
pub const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug)]
struct Jobs {
    statuses: HashMap<JobId, PipelineStatus>,
    channels: HashMap<JobId, broadcast::Sender<PipelineStatus>>,
    /// 任务首次写入的先后顺序
    order: VecDeque<JobId>,
    max_jobs: usize,
}

impl Jobs {
    fn status(&self, job_id: &JobId) -> PipelineStatus {
        self.statuses.get(job_id).cloned().unwrap_or_default()
    }

    fn has_subscribers(&self, job_id: &JobId) -> bool {
        self.channels
            .get(job_id)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    /// 超出上限时从最早的任务开始淘汰，仍有订阅者的任务跳过
    fn evict_overflow(&mut self) {
        while self.statuses.len() > self.max_jobs {
            let Some(pos) = self.order.iter().position(|id| !self.has_subscribers(id)) else {
                warn!(jobs = self.statuses.len(), "所有任务都有订阅者，暂不淘汰");
                return;
            };
            let Some(job_id) = self.order.remove(pos) else {
                return;
            };
            self.statuses.remove(&job_id);
            self.channels.remove(&job_id);
            info!(%job_id, "任务数超过上限，淘汰最早的任务");
        }
    }
}

/// 保存每个任务的状态，并把更新后的完整快照广播给订阅者
#[derive(Clone)]
pub struct StatusManager(Arc<Mutex<Jobs>>);

impl Default for StatusManager {
    fn default() -> Self {
        Self::with_max_jobs(DEFAULT_MAX_JOBS)
    }
}

impl StatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_jobs(max_jobs: usize) -> Self {
        Self(Arc::new(Mutex::new(Jobs {
            statuses: HashMap::new(),
            channels: HashMap::new(),
            order: VecDeque::new(),
            max_jobs: max_jobs.max(1),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 未知任务返回全部为 NOT_STARTED 的空状态
    pub fn get_status(&self, job_id: &JobId) -> PipelineStatus {
        self.lock().status(job_id)
    }

    /// 应用补丁并把新的快照推送给所有订阅者
    pub fn update_status(&self, job_id: &JobId, patch: &StatusPatch) -> PipelineStatus {
        let mut jobs = self.lock();
        let mut status = jobs.status(job_id);
        status.apply_patch(patch);
        if jobs.statuses.insert(job_id.clone(), status.clone()).is_none() {
            jobs.order.push_back(job_id.clone());
            jobs.evict_overflow();
        }

        let delivered = jobs.channels.get(job_id).map(|tx| tx.send(status.clone()));
        match delivered {
            Some(Ok(n)) => debug!(%job_id, subscribers = n, "已推送状态更新"),
            Some(Err(_)) => {
                // 所有订阅者都已断开
                jobs.channels.remove(job_id);
                debug!(%job_id, "没有订阅者，移除广播通道");
            }
            None => {}
        }
        status
    }

    /// 返回当前快照以及之后的更新，两者在同一把锁内取得，不会漏掉中间的更新
    pub fn subscribe(&self, job_id: &JobId) -> (PipelineStatus, broadcast::Receiver<PipelineStatus>) {
        let mut jobs = self.lock();
        let current = jobs.status(job_id);
        let rx = match jobs.channels.get(job_id) {
            Some(tx) => tx.subscribe(),
            None => {
                // 顺便清理订阅者已全部断开的通道
                jobs.channels.retain(|_, tx| tx.receiver_count() > 0);
                let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
                jobs.channels.insert(job_id.clone(), tx);
                rx
            }
        };
        info!(%job_id, "新的订阅者");
        (current, rx)
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.lock()
            .channels
            .get(job_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// 关闭所有广播通道，订阅流随之结束
    pub fn close_all(&self) {
        let closed = std::mem::take(&mut self.lock().channels);
        info!(count = closed.len(), "已关闭所有订阅通道");
    }
}
