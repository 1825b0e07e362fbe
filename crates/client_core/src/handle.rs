//! Commands queued into the controller task from timers and front ends.

use shared::domain::{ItemId, ItemKind, SourceId};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    api::Credentials,
    controller::{FollowUp, Inbox},
    error::ControllerError,
};

pub enum ControllerCommand {
    Login(Credentials),
    LoginOffline,
    Logout,
    Sync,
    RefreshSyncDisplay,
    SendReply {
        source: SourceId,
        reply_uuid: ItemId,
        plaintext: String,
    },
    UpdateStar {
        source: SourceId,
        follow_up: Option<FollowUp>,
    },
    DeleteSource {
        source: SourceId,
    },
    DownloadSubmission {
        kind: ItemKind,
        uuid: ItemId,
    },
    CheckFileExists {
        uuid: ItemId,
        reply: oneshot::Sender<bool>,
    },
    ResubmitDownload {
        kind: ItemKind,
        uuid: ItemId,
    },
    ResumeQueues,
    Shutdown,
}

impl ControllerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerCommand::Login(_) => "login",
            ControllerCommand::LoginOffline => "login_offline",
            ControllerCommand::Logout => "logout",
            ControllerCommand::Sync => "sync",
            ControllerCommand::RefreshSyncDisplay => "refresh_sync_display",
            ControllerCommand::SendReply { .. } => "send_reply",
            ControllerCommand::UpdateStar { .. } => "update_star",
            ControllerCommand::DeleteSource { .. } => "delete_source",
            ControllerCommand::DownloadSubmission { .. } => "download_submission",
            ControllerCommand::CheckFileExists { .. } => "check_file_exists",
            ControllerCommand::ResubmitDownload { .. } => "resubmit_download",
            ControllerCommand::ResumeQueues => "resume_queues",
            ControllerCommand::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl ControllerHandle {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<Inbox>) -> Self {
        Self { inbox }
    }

    pub fn send(&self, command: ControllerCommand) -> Result<(), ControllerError> {
        let name = command.name();
        self.inbox
            .send(Inbox::Command(command))
            .map_err(|_| ControllerError::Stopped)?;
        debug!(command = name, "queued controller command");
        Ok(())
    }

    pub fn login(&self, credentials: Credentials) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Login(credentials))
    }

    pub fn login_offline(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::LoginOffline)
    }

    pub fn logout(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Logout)
    }

    pub fn sync(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Sync)
    }

    pub fn refresh_sync_display(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::RefreshSyncDisplay)
    }

    pub fn send_reply(
        &self,
        source: SourceId,
        reply_uuid: ItemId,
        plaintext: impl Into<String>,
    ) -> Result<(), ControllerError> {
        self.send(ControllerCommand::SendReply {
            source,
            reply_uuid,
            plaintext: plaintext.into(),
        })
    }

    pub fn update_star(
        &self,
        source: SourceId,
        follow_up: Option<FollowUp>,
    ) -> Result<(), ControllerError> {
        self.send(ControllerCommand::UpdateStar { source, follow_up })
    }

    pub fn delete_source(&self, source: SourceId) -> Result<(), ControllerError> {
        self.send(ControllerCommand::DeleteSource { source })
    }

    pub fn download(&self, kind: ItemKind, uuid: ItemId) -> Result<(), ControllerError> {
        self.send(ControllerCommand::DownloadSubmission { kind, uuid })
    }

    pub async fn downloaded_file_exists(&self, uuid: ItemId) -> Result<bool, ControllerError> {
        let (reply, answer) = oneshot::channel();
        self.send(ControllerCommand::CheckFileExists { uuid, reply })?;
        answer.await.map_err(|_| ControllerError::Stopped)
    }

    /// Unpauses the job queue after the server timed out.
    pub fn resume_queues(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::ResumeQueues)
    }

    pub fn shutdown(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Shutdown)
    }
}
