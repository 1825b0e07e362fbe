//! Hand-written fakes for the controller's collaborators.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{UserId, UserProfile},
    error::ApiError,
};
use storage::Storage;
use tokio::sync::broadcast;

use crate::{
    api::{ApiConnector, Credentials, RemoteApi},
    config::ClientSettings,
    controller::Controller,
    error::JobError,
    events::ClientEvent,
    jobs::{Job, JobKind, JobNotifier, JobOutput, JobResult},
    queue::{JobQueue, JobRunner},
};

pub fn profile(username: &str) -> UserProfile {
    UserProfile {
        uuid: UserId::from(format!("{username}-uuid")),
        username: username.to_string(),
        first_name: None,
        last_name: None,
    }
}

pub struct FakeApi {
    token: AtomicBool,
    authenticate_result: Result<UserProfile, ApiError>,
    logout_result: Result<(), ApiError>,
    pub logout_calls: AtomicUsize,
}

impl FakeApi {
    pub fn accepting(profile: UserProfile) -> Arc<Self> {
        Arc::new(Self {
            token: AtomicBool::new(false),
            authenticate_result: Ok(profile),
            logout_result: Ok(()),
            logout_calls: AtomicUsize::new(0),
        })
    }

    pub fn rejecting(err: ApiError) -> Arc<Self> {
        Arc::new(Self {
            token: AtomicBool::new(false),
            authenticate_result: Err(err),
            logout_result: Ok(()),
            logout_calls: AtomicUsize::new(0),
        })
    }

    /// Already holds a token, as if authenticate had run earlier.
    pub fn signed_in() -> Arc<Self> {
        let api = Self::accepting(profile("journalist"));
        api.token.store(true, Ordering::SeqCst);
        api
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn authenticate(&self) -> Result<UserProfile, ApiError> {
        let result = self.authenticate_result.clone();
        if result.is_ok() {
            self.token.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.token.store(false, Ordering::SeqCst);
        self.logout_result.clone()
    }

    fn has_token(&self) -> bool {
        self.token.load(Ordering::SeqCst)
    }
}

/// Hands out the scripted apis in order; the last one is reused.
pub struct FakeConnector {
    apis: Mutex<VecDeque<Arc<FakeApi>>>,
    pub connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(apis: Vec<Arc<FakeApi>>) -> Arc<Self> {
        Arc::new(Self {
            apis: Mutex::new(apis.into()),
            connects: Mutex::new(Vec::new()),
        })
    }
}

impl ApiConnector for FakeConnector {
    fn connect(&self, credentials: Credentials) -> Arc<dyn RemoteApi> {
        self.connects
            .lock()
            .expect("lock")
            .push(credentials.username.clone());
        let mut apis = self.apis.lock().expect("lock");
        let api = if apis.len() > 1 {
            apis.pop_front().expect("scripted api")
        } else {
            Arc::clone(apis.front().expect("scripted api"))
        };
        api
    }
}

/// Records every call; enqueued jobs are held until a test completes them.
#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<(Job, JobNotifier)>>,
    pub logins: AtomicUsize,
    pub logouts: AtomicUsize,
    pub resumes: AtomicUsize,
    paused_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        let (paused_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            paused_tx: Mutex::new(Some(paused_tx)),
            ..Self::default()
        })
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.jobs
            .lock()
            .expect("lock")
            .iter()
            .map(|(job, _)| job.kind.clone())
            .collect()
    }

    /// Removes the oldest job matching `pred` and returns it with its notifier.
    pub fn take(&self, pred: impl Fn(&JobKind) -> bool) -> (Job, JobNotifier) {
        let mut jobs = self.jobs.lock().expect("lock");
        let index = jobs
            .iter()
            .position(|(job, _)| pred(&job.kind))
            .expect("matching job was enqueued");
        jobs.remove(index)
    }

    pub fn complete(&self, pred: impl Fn(&JobKind) -> bool, result: JobResult) -> Job {
        let (job, notifier) = self.take(pred);
        notifier.notify(result);
        job
    }

    pub fn fire_paused(&self) {
        if let Some(tx) = self.paused_tx.lock().expect("lock").as_ref() {
            let _ = tx.send(());
        }
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: Job, notifier: JobNotifier) {
        self.jobs.lock().expect("lock").push((job, notifier));
    }

    fn login(&self, _api: Arc<dyn RemoteApi>) {
        self.logins.fetch_add(1, Ordering::SeqCst);
    }

    fn logout(&self) {
        self.logouts.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe_paused(&self) -> broadcast::Receiver<()> {
        let mut guard = self.paused_tx.lock().expect("lock");
        guard
            .get_or_insert_with(|| broadcast::channel(4).0)
            .subscribe()
    }
}

/// Runs jobs instantly; the first `timeouts` runs fail with a timeout.
pub struct ScriptedRunner {
    timeouts: AtomicUsize,
    pub ran: Mutex<Vec<JobKind>>,
}

impl ScriptedRunner {
    pub fn new(timeouts: usize) -> Arc<Self> {
        Arc::new(Self {
            timeouts: AtomicUsize::new(timeouts),
            ran: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(&self, _api: Arc<dyn RemoteApi>, job: &Job) -> JobResult {
        self.ran.lock().expect("lock").push(job.kind.clone());
        let timed_out = self
            .timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if timed_out {
            return Err(JobError::Api(ApiError::timeout("read timed out")));
        }
        Ok(match &job.kind {
            JobKind::MetadataSync => JobOutput::Synced,
            JobKind::DownloadMessage { uuid }
            | JobKind::DownloadReply { uuid }
            | JobKind::DownloadFile { uuid } => JobOutput::Downloaded(uuid.clone()),
            JobKind::SendReply { reply_uuid, .. } => JobOutput::ReplySent(reply_uuid.clone()),
            JobKind::UpdateStar { source, .. } => JobOutput::StarUpdated(source.clone()),
            JobKind::DeleteSource { source } => JobOutput::SourceDeleted(source.clone()),
        })
    }
}

/// A controller over an in-memory store, a recording queue and a private
/// home directory.
pub struct Harness {
    pub controller: Controller,
    pub store: Arc<Storage>,
    pub queue: Arc<RecordingQueue>,
    pub connector: Arc<FakeConnector>,
    pub events: broadcast::Receiver<ClientEvent>,
    pub settings: ClientSettings,
    pub home: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with(vec![FakeApi::accepting(profile("journalist"))], |_| {}).await
}

pub async fn harness_with(
    apis: Vec<Arc<FakeApi>>,
    configure: impl FnOnce(&mut ClientSettings),
) -> Harness {
    let home = tempfile::tempdir().expect("tempdir");
    let mut settings = ClientSettings {
        home_dir: home.path().join("home"),
        database_url: Some("sqlite::memory:".into()),
        ..ClientSettings::default()
    };
    configure(&mut settings);
    settings.ensure_home_dir().expect("home dir");

    let store = Arc::new(
        Storage::new(&settings.database_url())
            .await
            .expect("db"),
    );
    let queue = RecordingQueue::new();
    let connector = FakeConnector::new(apis);
    let controller = Controller::new(
        &settings,
        store.clone(),
        connector.clone(),
        queue.clone(),
    );
    let events = controller.subscribe_events();
    Harness {
        controller,
        store,
        queue,
        connector,
        events,
        settings,
        home,
    }
}

impl Harness {
    /// Handles exactly one inbox message.
    pub async fn pump(&mut self) {
        let running = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            self.controller.step(),
        )
        .await
        .expect("controller message in time");
        assert!(running, "controller stopped unexpectedly");
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Logs in with the connector's next api and handles the authenticate
    /// completion.
    pub async fn sign_in(&mut self) {
        self.controller
            .login(Credentials::new("journalist", "correct horse", "123456"))
            .await;
        self.pump().await;
    }
}
