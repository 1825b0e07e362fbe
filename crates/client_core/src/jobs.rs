//! Typed units of work handed to the job queue.

use std::fmt;

use shared::domain::{ItemId, ItemKind, SourceId};
use uuid::Uuid;

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    MetadataSync,
    DownloadMessage { uuid: ItemId },
    DownloadReply { uuid: ItemId },
    DownloadFile { uuid: ItemId },
    SendReply {
        source: SourceId,
        reply_uuid: ItemId,
        plaintext: String,
    },
    UpdateStar { source: SourceId, is_starred: bool },
    DeleteSource { source: SourceId },
}

impl JobKind {
    pub fn download(kind: ItemKind, uuid: ItemId) -> Self {
        match kind {
            ItemKind::Message => JobKind::DownloadMessage { uuid },
            ItemKind::Reply => JobKind::DownloadReply { uuid },
            ItemKind::File => JobKind::DownloadFile { uuid },
        }
    }

    /// The item a download job fetches, if this is a download.
    pub fn download_target(&self) -> Option<(ItemKind, &ItemId)> {
        match self {
            JobKind::DownloadMessage { uuid } => Some((ItemKind::Message, uuid)),
            JobKind::DownloadReply { uuid } => Some((ItemKind::Reply, uuid)),
            JobKind::DownloadFile { uuid } => Some((ItemKind::File, uuid)),
            _ => None,
        }
    }

    /// Lower runs first.
    pub fn priority(&self) -> u8 {
        match self {
            JobKind::MetadataSync => 12,
            JobKind::DownloadMessage { .. }
            | JobKind::DownloadReply { .. }
            | JobKind::DownloadFile { .. } => 13,
            JobKind::DeleteSource { .. } => 14,
            JobKind::SendReply { .. } => 15,
            JobKind::UpdateStar { .. } => 16,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            JobKind::DownloadFile { .. } => Lane::FileDownload,
            _ => Lane::Main,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::MetadataSync => "metadata_sync",
            JobKind::DownloadMessage { .. } => "download_message",
            JobKind::DownloadReply { .. } => "download_reply",
            JobKind::DownloadFile { .. } => "download_file",
            JobKind::SendReply { .. } => "send_reply",
            JobKind::UpdateStar { .. } => "update_star",
            JobKind::DeleteSource { .. } => "delete_source",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Main,
    FileDownload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: JobId::new(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Synced,
    Downloaded(ItemId),
    ReplySent(ItemId),
    StarUpdated(SourceId),
    SourceDeleted(SourceId),
}

pub type JobResult = Result<JobOutput, JobError>;

type Deliver = Box<dyn FnOnce(JobId, JobResult) + Send>;

/// Carries a job's outcome back to whoever submitted it.
///
/// Consuming [`JobNotifier::notify`] reports the outcome. A notifier dropped
/// without reporting delivers [`JobError::Dropped`] instead, so every
/// submission yields exactly one outcome.
pub struct JobNotifier {
    job_id: JobId,
    deliver: Option<Deliver>,
}

impl JobNotifier {
    pub fn new(job_id: JobId, deliver: impl FnOnce(JobId, JobResult) + Send + 'static) -> Self {
        Self {
            job_id,
            deliver: Some(Box::new(deliver)),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn notify(mut self, result: JobResult) {
        if let Some(deliver) = self.deliver.take() {
            deliver(self.job_id, result);
        }
    }
}

impl Drop for JobNotifier {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            deliver(self.job_id, Err(JobError::Dropped));
        }
    }
}

impl fmt::Debug for JobNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobNotifier")
            .field("job_id", &self.job_id)
            .field("pending", &self.deliver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn downloads_share_priority_and_file_downloads_get_their_own_lane() {
        let file = JobKind::download(ItemKind::File, ItemId::from("f1"));
        let message = JobKind::download(ItemKind::Message, ItemId::from("m1"));
        assert_eq!(file.priority(), message.priority());
        assert_eq!(file.lane(), Lane::FileDownload);
        assert_eq!(message.lane(), Lane::Main);
        assert!(JobKind::MetadataSync.priority() < message.priority());
        assert_eq!(
            file.download_target(),
            Some((ItemKind::File, &ItemId::from("f1")))
        );
    }

    #[test]
    fn notifier_reports_dropped_when_never_notified() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = JobId::new();
        drop(JobNotifier::new(id, move |job_id, result| {
            sink.lock().expect("lock").push((job_id, result));
        }));
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![(id, Err(JobError::Dropped))]
        );
    }

    #[test]
    fn notify_delivers_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let notifier = JobNotifier::new(JobId::new(), move |_, result| {
            sink.lock().expect("lock").push(result);
        });
        notifier.notify(Ok(JobOutput::Synced));
        assert_eq!(*seen.lock().expect("lock"), vec![Ok(JobOutput::Synced)]);
    }
}
