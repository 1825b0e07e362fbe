//! Outgoing work on sources: replies, stars and deletion.

use chrono::Utc;
use futures::future::BoxFuture;
use shared::domain::{ItemId, SendStatus, SourceId};
use storage::NewDraftReply;
use tracing::{debug, error, info, warn};

use crate::{
    controller::{Controller, FollowUp},
    error::{ControllerError, JobError},
    events::{ClientEvent, DELETE_SOURCE_FAILED_MESSAGE, STAR_UPDATE_FAILED_MESSAGE},
    jobs::{Job, JobKind, JobOutput},
};

impl Controller {
    /// Stores a pending draft for the reply, then submits it for sending.
    pub async fn send_reply(
        &mut self,
        source: &SourceId,
        reply_uuid: ItemId,
        plaintext: String,
    ) -> Result<(), ControllerError> {
        let Some(author) = self.current_user.as_ref().map(|user| user.uuid.clone()) else {
            self.on_action_requiring_login();
            return Ok(());
        };
        let Some(stored_source) = self.store.get_source(source).await? else {
            self.emit(ClientEvent::ReplyFailed(reply_uuid));
            return Err(ControllerError::UnknownSource(source.clone()));
        };

        self.store
            .insert_draft_reply(&NewDraftReply {
                uuid: reply_uuid.clone(),
                source_uuid: source.clone(),
                author_uuid: author,
                file_counter: stored_source.interaction_count,
                content: plaintext.clone(),
                timestamp: Utc::now(),
                send_status: SendStatus::Pending,
            })
            .await?;
        debug!(reply = %reply_uuid, source = %source, "replies: draft stored");

        self.submit_job(
            JobKind::SendReply {
                source: source.clone(),
                reply_uuid,
                plaintext,
            },
            on_reply_success,
            on_reply_failure,
            None,
        );
        Ok(())
    }

    /// Toggles the star on the server using the source's stored flag.
    /// `follow_up` runs after a successful update.
    pub async fn update_star(
        &mut self,
        source: &SourceId,
        follow_up: Option<FollowUp>,
    ) -> Result<(), ControllerError> {
        if !self.authenticated() {
            self.on_action_requiring_login();
            return Ok(());
        }
        let stored = self
            .store
            .get_source(source)
            .await?
            .ok_or_else(|| ControllerError::UnknownSource(source.clone()))?;
        self.submit_job(
            JobKind::UpdateStar {
                source: source.clone(),
                is_starred: stored.is_starred,
            },
            on_star_success,
            on_star_failure,
            follow_up,
        );
        Ok(())
    }

    pub fn delete_source(&mut self, source: SourceId) {
        if !self.authenticated() {
            self.on_action_requiring_login();
            return;
        }
        self.submit_job(
            JobKind::DeleteSource { source },
            on_delete_success,
            on_delete_failure,
            None,
        );
    }

    async fn handle_reply_success(&mut self, job: Job) {
        let JobKind::SendReply { reply_uuid, .. } = job.kind else {
            return;
        };
        info!(reply = %reply_uuid, "replies: sent");
        self.clear_error();
        self.emit(ClientEvent::ReplySucceeded(reply_uuid));
        self.sync();
    }

    async fn handle_reply_failure(&mut self, job: Job, err: JobError) {
        let JobKind::SendReply { reply_uuid, .. } = job.kind else {
            return;
        };
        warn!(reply = %reply_uuid, "replies: failed to send: {err}");
        match self
            .store
            .set_draft_reply_status(&reply_uuid, SendStatus::Failed)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(reply = %reply_uuid, "replies: no draft left to mark failed"),
            Err(err) => error!(reply = %reply_uuid, "replies: failed to mark draft failed: {err:#}"),
        }
        self.emit(ClientEvent::ReplyFailed(reply_uuid));
    }

    async fn handle_delete_success(&mut self, job: Job) {
        let JobKind::DeleteSource { source } = job.kind else {
            return;
        };
        info!(%source, "replies: source deleted at server");
        if let Err(err) = self.store.delete_source(&source).await {
            error!(%source, "replies: failed to delete local source: {err:#}");
        }
        self.clear_error();
        if let Err(err) = self.update_sources().await {
            error!("replies: failed to refresh sources: {err:#}");
        }
    }
}

fn on_reply_success(controller: &mut Controller, job: Job, _output: JobOutput) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_reply_success(job))
}

fn on_reply_failure(controller: &mut Controller, job: Job, err: JobError) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_reply_failure(job, err))
}

fn on_star_success(controller: &mut Controller, _job: Job, _output: JobOutput) -> BoxFuture<'_, ()> {
    Box::pin(async move { controller.clear_error() })
}

fn on_star_failure(controller: &mut Controller, job: Job, err: JobError) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        warn!(job_id = %job.id, "replies: failed to update star: {err}");
        controller.transient_error(STAR_UPDATE_FAILED_MESSAGE);
    })
}

fn on_delete_success(controller: &mut Controller, job: Job, _output: JobOutput) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_delete_success(job))
}

fn on_delete_failure(controller: &mut Controller, job: Job, err: JobError) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        warn!(job_id = %job.id, "replies: failed to delete source at server: {err}");
        controller.transient_error(DELETE_SOURCE_FAILED_MESSAGE);
    })
}
