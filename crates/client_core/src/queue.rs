//! Default job queue: two priority lanes drained by one worker each.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use shared::error::ApiError;
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::RemoteApi,
    error::JobError,
    jobs::{Job, JobNotifier, JobResult, Lane},
};

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job, notifier: JobNotifier);
    fn login(&self, api: Arc<dyn RemoteApi>);
    fn logout(&self);
    fn resume(&self);
    /// Fires after the queue pauses itself because the server timed out.
    fn subscribe_paused(&self) -> broadcast::Receiver<()>;
}

/// Performs the network and crypto work behind a job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, api: Arc<dyn RemoteApi>, job: &Job) -> JobResult;
}

pub struct MissingJobRunner;

#[async_trait]
impl JobRunner for MissingJobRunner {
    async fn run(&self, _api: Arc<dyn RemoteApi>, job: &Job) -> JobResult {
        Err(JobError::Api(ApiError::unreachable(format!(
            "no job runner available for {}",
            job.kind.name()
        ))))
    }
}

struct QueuedJob {
    priority: u8,
    order: u64,
    job: Job,
    notifier: JobNotifier,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.order).cmp(&(other.priority, other.order))
    }
}

#[derive(Default)]
struct LaneState {
    pending: BinaryHeap<Reverse<QueuedJob>>,
    next_order: u64,
    paused: bool,
    api: Option<Arc<dyn RemoteApi>>,
}

struct LaneQueue {
    name: &'static str,
    state: Mutex<LaneState>,
    ready: Notify,
}

impl LaneQueue {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LaneState::default()),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // A worker never panics while holding the lock; recover the data anyway.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, job: Job, notifier: JobNotifier) {
        let mut state = self.lock();
        if state.api.is_none() {
            drop(state);
            debug!(lane = self.name, job_id = %job.id, "rejecting job while logged out");
            notifier.notify(Err(JobError::NotAuthenticated));
            return;
        }
        let order = state.next_order;
        state.next_order += 1;
        state.pending.push(Reverse(QueuedJob {
            priority: job.kind.priority(),
            order,
            job,
            notifier,
        }));
        drop(state);
        self.ready.notify_one();
    }

    fn requeue(&self, queued: QueuedJob) {
        self.lock().pending.push(Reverse(queued));
    }

    fn take_next(&self) -> Option<(QueuedJob, Option<Arc<dyn RemoteApi>>)> {
        let mut state = self.lock();
        if state.paused {
            return None;
        }
        let Reverse(queued) = state.pending.pop()?;
        Some((queued, state.api.clone()))
    }

    fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
        if !paused {
            self.ready.notify_one();
        }
    }

    fn set_api(&self, api: Option<Arc<dyn RemoteApi>>) {
        self.lock().api = api;
    }
}

struct QueueShared {
    main: LaneQueue,
    files: LaneQueue,
    runner: Arc<dyn JobRunner>,
    paused_tx: broadcast::Sender<()>,
}

impl QueueShared {
    fn lane(&self, lane: Lane) -> &LaneQueue {
        match lane {
            Lane::Main => &self.main,
            Lane::FileDownload => &self.files,
        }
    }

    fn pause_all(&self) {
        self.main.set_paused(true);
        self.files.set_paused(true);
        let _ = self.paused_tx.send(());
    }
}

pub struct ApiJobQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ApiJobQueue {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        let (paused_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(QueueShared {
                main: LaneQueue::new("main"),
                files: LaneQueue::new("file_download"),
                runner,
                paused_tx,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self, lane: Lane) -> usize {
        self.shared.lane(lane).lock().pending.len()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.main.lock().paused && self.shared.files.lock().paused
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() {
            return;
        }
        for lane in [Lane::Main, Lane::FileDownload] {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(run_lane(shared, lane)));
        }
        info!("job queue: workers started");
    }
}

impl JobQueue for ApiJobQueue {
    fn enqueue(&self, job: Job, notifier: JobNotifier) {
        let lane = job.kind.lane();
        debug!(job_id = %job.id, job = job.kind.name(), ?lane, "enqueue job");
        self.shared.lane(lane).push(job, notifier);
    }

    fn login(&self, api: Arc<dyn RemoteApi>) {
        self.shared.main.set_api(Some(Arc::clone(&api)));
        self.shared.files.set_api(Some(api));
        self.start_workers();
    }

    fn logout(&self) {
        self.shared.main.set_api(None);
        self.shared.files.set_api(None);
    }

    fn resume(&self) {
        debug!("job queue: resuming lanes");
        self.shared.main.set_paused(false);
        self.shared.files.set_paused(false);
    }

    fn subscribe_paused(&self) -> broadcast::Receiver<()> {
        self.shared.paused_tx.subscribe()
    }
}

impl Drop for ApiJobQueue {
    fn drop(&mut self) {
        let workers = self.workers.get_mut().unwrap_or_else(|p| p.into_inner());
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

async fn run_lane(shared: Arc<QueueShared>, lane: Lane) {
    loop {
        let queue = shared.lane(lane);
        let Some((queued, api)) = queue.take_next() else {
            queue.ready.notified().await;
            continue;
        };

        let Some(api) = api else {
            debug!(lane = queue.name, job_id = %queued.job.id, "api handle gone before job ran");
            queued.notifier.notify(Err(JobError::NotAuthenticated));
            continue;
        };

        debug!(lane = queue.name, job_id = %queued.job.id, job = queued.job.kind.name(), "running job");
        let result = shared.runner.run(api, &queued.job).await;
        match result {
            Err(JobError::Api(err)) if err.is_timeout() => {
                warn!(
                    lane = queue.name,
                    job_id = %queued.job.id,
                    "server timed out, pausing job queue: {err}"
                );
                queue.requeue(queued);
                shared.pause_all();
            }
            result => queued.notifier.notify(result),
        }
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
