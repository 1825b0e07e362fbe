//! Session coordinator. One task owns the session state; commands, call
//! completions, job outcomes and queue-paused notifications all arrive
//! through its inbox and are handled one at a time.

use std::{collections::HashMap, future::Future, path::PathBuf, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use shared::error::ApiError;
use storage::{LocalStore, StoredUser};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    api::{ApiConnector, CallValue, Credentials, RemoteApi},
    bridge::{CallBridge, CallId, CallResult},
    config::ClientSettings,
    downloads::RetryPolicy,
    error::{CallError, ControllerError, JobError},
    events::{
        ClientEvent, ErrorStatus, LOGIN_FAILED_MESSAGE, LOGIN_REQUIRED_MESSAGE,
        SERVER_UNREACHABLE_MESSAGE,
    },
    handle::{ControllerCommand, ControllerHandle},
    jobs::{Job, JobId, JobKind, JobNotifier, JobOutput, JobResult},
    queue::JobQueue,
    sync::SyncMarker,
};

const EVENT_CAPACITY: usize = 1024;

pub(crate) enum Inbox {
    Command(ControllerCommand),
    CallDone {
        id: CallId,
        result: CallResult<CallValue>,
    },
    JobDone {
        id: JobId,
        result: JobResult,
    },
}

/// Extra data a with-context continuation receives alongside the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallContext {
    Session { generation: u64 },
}

pub type PlainContinuation<A> = for<'a> fn(&'a mut Controller, A) -> BoxFuture<'a, ()>;
pub type ContextContinuation<A> =
    for<'a> fn(&'a mut Controller, A, Option<CallContext>) -> BoxFuture<'a, ()>;

pub enum Continuation<A> {
    Plain(PlainContinuation<A>),
    WithContext(ContextContinuation<A>),
}

impl<A> Clone for Continuation<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Continuation<A> {}

impl<A> Continuation<A> {
    fn invoke(
        self,
        controller: &mut Controller,
        arg: A,
        context: Option<CallContext>,
    ) -> BoxFuture<'_, ()> {
        match self {
            Continuation::Plain(f) => f(controller, arg),
            Continuation::WithContext(f) => f(controller, arg, context),
        }
    }
}

struct InFlightCall {
    worker: Option<JoinHandle<()>>,
    on_success: Continuation<CallValue>,
    on_failure: Continuation<CallError>,
    context: Option<CallContext>,
}

pub type JobSuccess = for<'a> fn(&'a mut Controller, Job, JobOutput) -> BoxFuture<'a, ()>;
pub type JobFailure = for<'a> fn(&'a mut Controller, Job, JobError) -> BoxFuture<'a, ()>;
/// Caller-supplied callback run after a job's success handler.
pub type FollowUp = Box<dyn FnOnce() + Send>;

struct JobRoute {
    job: Job,
    on_success: JobSuccess,
    on_failure: JobFailure,
    follow_up: Option<FollowUp>,
}

enum Wake {
    Inbox(Option<Inbox>),
    Paused(Result<(), RecvError>),
}

pub struct Controller {
    pub(crate) store: Arc<dyn LocalStore>,
    connector: Arc<dyn ApiConnector>,
    pub(crate) queue: Arc<dyn JobQueue>,
    bridge: CallBridge,
    pub(crate) api: Option<Arc<dyn RemoteApi>>,
    is_authenticated: bool,
    pub(crate) current_user: Option<StoredUser>,
    session_generation: u64,
    in_flight: HashMap<CallId, InFlightCall>,
    pending_jobs: HashMap<JobId, JobRoute>,
    pub(crate) retries: RetryPolicy,
    pub(crate) sync_marker: SyncMarker,
    pub(crate) data_dir: PathBuf,
    status_duration: Duration,
    error_duration: Duration,
    events: broadcast::Sender<ClientEvent>,
    pub(crate) inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox_rx: mpsc::UnboundedReceiver<Inbox>,
    paused_rx: Option<broadcast::Receiver<()>>,
}

impl Controller {
    pub fn new(
        settings: &ClientSettings,
        store: Arc<dyn LocalStore>,
        connector: Arc<dyn ApiConnector>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let paused_rx = Some(queue.subscribe_paused());
        Self {
            store,
            connector,
            queue,
            bridge: CallBridge::new(settings.max_concurrent_calls, settings.max_queued_calls),
            api: None,
            is_authenticated: false,
            current_user: None,
            session_generation: 0,
            in_flight: HashMap::new(),
            pending_jobs: HashMap::new(),
            retries: RetryPolicy::new(
                settings.checksum_retry_limit,
                settings.checksum_retry_delay(),
            ),
            sync_marker: SyncMarker::new(settings.sync_flag_path()),
            data_dir: settings.data_dir(),
            status_duration: settings.status_duration(),
            error_duration: settings.error_duration(),
            events,
            inbox_tx,
            inbox_rx,
            paused_rx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.inbox_tx.clone())
    }

    /// Moves the controller onto its own task.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    pub async fn run(mut self) {
        info!("controller: started");
        while self.step().await {}
        info!("controller: stopped");
    }

    /// Waits for and handles one inbox message or queue-paused notification.
    /// Returns false once the controller has been asked to shut down.
    pub async fn step(&mut self) -> bool {
        let wake = {
            let Self {
                inbox_rx,
                paused_rx,
                ..
            } = self;
            tokio::select! {
                biased;
                message = inbox_rx.recv() => Wake::Inbox(message),
                paused = recv_paused(paused_rx) => Wake::Paused(paused),
            }
        };

        match wake {
            Wake::Inbox(None) => false,
            Wake::Inbox(Some(message)) => self.handle_inbox(message).await,
            Wake::Paused(Ok(())) | Wake::Paused(Err(RecvError::Lagged(_))) => {
                self.on_queue_paused();
                true
            }
            Wake::Paused(Err(RecvError::Closed)) => {
                debug!("controller: queue paused channel closed");
                self.paused_rx = None;
                true
            }
        }
    }

    async fn handle_inbox(&mut self, message: Inbox) -> bool {
        match message {
            Inbox::Command(command) => return self.handle_command(command).await,
            Inbox::CallDone { id, result } => self.complete_call(id, result).await,
            Inbox::JobDone { id, result } => self.complete_job(id, result).await,
        }
        true
    }

    async fn handle_command(&mut self, command: ControllerCommand) -> bool {
        let name = command.name();
        let outcome = match command {
            ControllerCommand::Login(credentials) => {
                self.login(credentials).await;
                Ok(())
            }
            ControllerCommand::LoginOffline => self.login_offline().await,
            ControllerCommand::Logout => {
                self.logout().await;
                Ok(())
            }
            ControllerCommand::Sync => {
                self.sync();
                Ok(())
            }
            ControllerCommand::RefreshSyncDisplay => {
                self.refresh_sync_display();
                Ok(())
            }
            ControllerCommand::SendReply {
                source,
                reply_uuid,
                plaintext,
            } => self.send_reply(&source, reply_uuid, plaintext).await,
            ControllerCommand::UpdateStar { source, follow_up } => {
                self.update_star(&source, follow_up).await
            }
            ControllerCommand::DeleteSource { source } => {
                self.delete_source(source);
                Ok(())
            }
            ControllerCommand::DownloadSubmission { kind, uuid } => {
                self.on_submission_download(kind, uuid);
                Ok(())
            }
            ControllerCommand::CheckFileExists { uuid, reply } => {
                let outcome = self.downloaded_file_exists(&uuid).await;
                let _ = reply.send(matches!(outcome, Ok(true)));
                outcome.map(|_| ())
            }
            ControllerCommand::ResumeQueues => {
                self.resume_queues();
                Ok(())
            }
            ControllerCommand::ResubmitDownload { kind, uuid } => {
                self.submit_download(kind, uuid);
                Ok(())
            }
            ControllerCommand::Shutdown => return false,
        };
        if let Err(err) = outcome {
            warn!(command = name, "controller command failed: {err:#}");
        }
        true
    }

    /// True iff an API handle is present and holds a session token.
    pub fn authenticated(&self) -> bool {
        self.api.as_ref().is_some_and(|api| api.has_token())
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn current_user(&self) -> Option<&StoredUser> {
        self.current_user.as_ref()
    }

    pub fn in_flight_calls(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending_jobs.len()
    }

    fn set_authenticated(&mut self, authenticated: bool) {
        if self.is_authenticated == authenticated {
            return;
        }
        self.is_authenticated = authenticated;
        self.emit(ClientEvent::AuthenticationChanged(authenticated));
    }

    pub async fn login(&mut self, credentials: Credentials) {
        self.sweep_pending_drafts().await;
        self.session_generation += 1;
        let generation = self.session_generation;
        info!(username = %credentials.username, generation, "session: logging in");

        let api = self.connector.connect(credentials);
        self.api = Some(Arc::clone(&api));
        self.dispatch(
            move || async move { api.authenticate().await.map(CallValue::Authenticated) },
            Continuation::WithContext(on_authenticate_success),
            Continuation::WithContext(on_authenticate_failure),
            Some(CallContext::Session { generation }),
        );
    }

    pub async fn login_offline(&mut self) -> Result<(), ControllerError> {
        info!("session: entering offline mode");
        self.api = None;
        self.current_user = None;
        self.session_generation += 1;
        self.sweep_pending_drafts().await;
        self.set_authenticated(false);
        self.update_sources().await
    }

    pub async fn logout(&mut self) {
        if let Some(api) = self.api.take() {
            self.dispatch(
                move || async move { api.logout().await.map(|()| CallValue::LoggedOut) },
                Continuation::Plain(on_logout_success),
                Continuation::Plain(on_logout_failure),
                None,
            );
        }
        info!("session: logged out");
        self.session_generation += 1;
        self.current_user = None;
        self.queue.logout();
        self.sweep_pending_drafts().await;
        self.set_authenticated(false);
    }

    async fn handle_authenticate_success(&mut self, value: CallValue, context: Option<CallContext>) {
        if !self.is_current_session(context) {
            debug!(?context, "session: ignoring authenticate result from superseded login");
            return;
        }
        let CallValue::Authenticated(profile) = value else {
            warn!("session: authenticate returned an unexpected value");
            return;
        };
        let Some(api) = self.api.clone() else {
            return;
        };

        match self.store.update_and_get_user(&profile).await {
            Ok(user) => {
                info!(user = %user.uuid, "session: signed in");
                self.current_user = Some(user.clone());
                self.emit(ClientEvent::SignedIn(user));
            }
            Err(err) => error!("session: failed to record signed-in user: {err:#}"),
        }
        self.set_authenticated(true);
        self.queue.login(api);
        self.sync();
        self.queue.resume();
    }

    async fn handle_authenticate_failure(&mut self, err: CallError, context: Option<CallContext>) {
        if !self.is_current_session(context) {
            debug!(?context, "session: ignoring authenticate failure from superseded login");
            return;
        }
        warn!("session: authentication failed: {err}");
        self.api = None;
        self.current_user = None;
        self.queue.logout();
        self.set_authenticated(false);
        self.emit(ClientEvent::LoginFailed(LOGIN_FAILED_MESSAGE.to_string()));
    }

    fn is_current_session(&self, context: Option<CallContext>) -> bool {
        match context {
            Some(CallContext::Session { generation }) => generation == self.session_generation,
            None => true,
        }
    }

    async fn sweep_pending_drafts(&mut self) {
        match self.store.mark_all_pending_drafts_as_failed().await {
            Ok(0) => {}
            Ok(count) => info!(count, "marked pending drafts as failed"),
            Err(err) => error!("failed to mark pending drafts as failed: {err:#}"),
        }
    }

    /// Runs `call` through the bridge and records the continuations that
    /// handle its outcome.
    pub(crate) fn dispatch<F, Fut>(
        &mut self,
        call: F,
        on_success: Continuation<CallValue>,
        on_failure: Continuation<CallError>,
        context: Option<CallContext>,
    ) -> CallId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CallValue, ApiError>> + Send + 'static,
    {
        let inbox = self.inbox_tx.clone();
        let handle = self.bridge.invoke(call, move |id, result| {
            let _ = inbox.send(Inbox::CallDone { id, result });
        });
        debug!(id = %handle.id, "dispatched remote call");
        self.in_flight.insert(
            handle.id,
            InFlightCall {
                worker: handle.worker,
                on_success,
                on_failure,
                context,
            },
        );
        handle.id
    }

    async fn complete_call(&mut self, id: CallId, result: CallResult<CallValue>) {
        let Some(call) = self.in_flight.get(&id) else {
            warn!(%id, "completion for unknown call dropped");
            return;
        };
        let (on_success, on_failure, context) = (call.on_success, call.on_failure, call.context);
        match result {
            Ok(value) => on_success.invoke(self, value, context).await,
            Err(err) => on_failure.invoke(self, err, context).await,
        }
        if let Some(call) = self.in_flight.remove(&id) {
            drop(call.worker);
        }
    }

    /// Enqueues a job and routes its single outcome to the given handlers.
    pub(crate) fn submit_job(
        &mut self,
        kind: JobKind,
        on_success: JobSuccess,
        on_failure: JobFailure,
        follow_up: Option<FollowUp>,
    ) -> JobId {
        let job = Job::new(kind);
        let id = job.id;
        let inbox = self.inbox_tx.clone();
        let notifier = JobNotifier::new(id, move |id, result| {
            let _ = inbox.send(Inbox::JobDone { id, result });
        });
        debug!(job_id = %id, job = job.kind.name(), "submitting job");
        self.pending_jobs.insert(
            id,
            JobRoute {
                job: job.clone(),
                on_success,
                on_failure,
                follow_up,
            },
        );
        self.queue.enqueue(job, notifier);
        id
    }

    async fn complete_job(&mut self, id: JobId, result: JobResult) {
        let Some(route) = self.pending_jobs.remove(&id) else {
            warn!(job_id = %id, "outcome for unknown job dropped");
            return;
        };
        let JobRoute {
            job,
            on_success,
            on_failure,
            follow_up,
        } = route;
        match result {
            Ok(output) => {
                on_success(self, job, output).await;
                if let Some(follow_up) = follow_up {
                    follow_up();
                }
            }
            Err(err) => on_failure(self, job, err).await,
        }
    }

    /// True while a metadata sync is queued or running.
    pub(crate) fn sync_pending(&self) -> bool {
        self.pending_jobs
            .values()
            .any(|route| route.job.kind == JobKind::MetadataSync)
    }

    pub fn resume_queues(&mut self) {
        info!("job queue: resume requested");
        self.queue.resume();
    }

    pub fn on_queue_paused(&mut self) {
        if self.api.is_none() {
            self.show_error(SERVER_UNREACHABLE_MESSAGE, Some(self.error_duration), false);
        } else {
            self.show_error(SERVER_UNREACHABLE_MESSAGE, None, true);
        }
    }

    pub fn on_action_requiring_login(&mut self) {
        self.show_error(LOGIN_REQUIRED_MESSAGE, Some(self.error_duration), false);
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn show_error(&self, message: &str, duration: Option<Duration>, retry: bool) {
        self.emit(ClientEvent::ErrorStatus(ErrorStatus {
            message: message.to_string(),
            duration,
            retry,
        }));
    }

    pub(crate) fn transient_error(&self, message: &str) {
        self.show_error(message, Some(self.error_duration), false);
    }

    pub(crate) fn clear_error(&self) {
        self.emit(ClientEvent::ErrorCleared);
    }

    pub(crate) fn show_activity(&self, message: &str) {
        self.emit(ClientEvent::ActivityStatus {
            message: message.to_string(),
            duration: self.status_duration,
        });
    }
}

async fn recv_paused(rx: &mut Option<broadcast::Receiver<()>>) -> Result<(), RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn on_authenticate_success(
    controller: &mut Controller,
    value: CallValue,
    context: Option<CallContext>,
) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_authenticate_success(value, context))
}

fn on_authenticate_failure(
    controller: &mut Controller,
    err: CallError,
    context: Option<CallContext>,
) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_authenticate_failure(err, context))
}

fn on_logout_success(controller: &mut Controller, _value: CallValue) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        info!("session: server logout succeeded");
        controller.clear_error();
    })
}

fn on_logout_failure(_controller: &mut Controller, err: CallError) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        warn!("session: server logout failed: {err}");
    })
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
