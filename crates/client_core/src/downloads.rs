//! Download pipeline: submit, verify, resubmit on integrity failure.

use std::{collections::HashMap, time::Duration};

use futures::future::BoxFuture;
use shared::domain::{ItemId, ItemKind};
use tracing::{debug, error, warn};

use crate::{
    controller::{Controller, Inbox},
    error::{ControllerError, JobError},
    events::{ClientEvent, DOWNLOADING_FILE_ACTIVITY, FILE_DOWNLOAD_FAILED_MESSAGE},
    handle::ControllerCommand,
    jobs::{Job, JobKind, JobOutput},
};

/// Bounds how often a download that fails its integrity check is resubmitted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    limit: Option<u32>,
    delay: Duration,
    attempts: HashMap<(ItemKind, ItemId), u32>,
}

impl RetryPolicy {
    pub fn new(limit: Option<u32>, delay: Duration) -> Self {
        Self {
            limit,
            delay,
            attempts: HashMap::new(),
        }
    }

    /// Counts a failed attempt. Returns false once the item has used up its
    /// resubmissions; the counter is then cleared so a later sync starts over.
    pub fn record_failure(&mut self, kind: ItemKind, uuid: &ItemId) -> bool {
        let key = (kind, uuid.clone());
        let attempts = self.attempts.entry(key.clone()).or_insert(0);
        *attempts += 1;
        match self.limit {
            Some(limit) if *attempts > limit => {
                self.attempts.remove(&key);
                false
            }
            _ => true,
        }
    }

    pub fn reset(&mut self, kind: ItemKind, uuid: &ItemId) {
        self.attempts.remove(&(kind, uuid.clone()));
    }

    pub fn attempts(&self, kind: ItemKind, uuid: &ItemId) -> u32 {
        self.attempts
            .get(&(kind, uuid.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Controller {
    pub(crate) fn submit_download(&mut self, kind: ItemKind, uuid: ItemId) {
        self.submit_job(
            JobKind::download(kind, uuid),
            on_download_success,
            on_download_failure,
            None,
        );
    }

    /// User-initiated download of a single item.
    pub fn on_submission_download(&mut self, kind: ItemKind, uuid: ItemId) {
        if self.api.is_none() {
            self.on_action_requiring_login();
            return;
        }
        self.submit_download(kind, uuid);
        self.show_activity(DOWNLOADING_FILE_ACTIVITY);
    }

    /// Checks that a downloaded file's decrypted copy is still on disk. When
    /// it is gone the store is rescanned and `FileMissing` is published.
    pub async fn downloaded_file_exists(&mut self, uuid: &ItemId) -> Result<bool, ControllerError> {
        let Some(file) = self.store.get_file(uuid).await? else {
            warn!(file = %uuid, "downloads: unknown file");
            return Ok(false);
        };
        let path = file.decrypted_path(&self.data_dir);
        if path.exists() {
            return Ok(true);
        }
        debug!(file = %uuid, path = %path.display(), "downloads: decrypted file does not exist");
        self.store.update_missing_files(&self.data_dir).await?;
        self.emit(ClientEvent::FileMissing(uuid.clone()));
        Ok(false)
    }

    async fn handle_download_success(&mut self, job: Job) {
        let Some((kind, uuid)) = job.kind.download_target().map(|(k, u)| (k, u.clone())) else {
            return;
        };
        self.clear_error();
        self.retries.reset(kind, &uuid);

        match kind {
            ItemKind::Message => match self.store.get_message(&uuid).await {
                Ok(Some(message)) => self.emit(ClientEvent::MessageReady {
                    uuid,
                    content: message.content.unwrap_or_default(),
                }),
                Ok(None) => warn!(message = %uuid, "downloads: message vanished after download"),
                Err(err) => error!(message = %uuid, "downloads: failed to load message: {err:#}"),
            },
            ItemKind::Reply => match self.store.get_reply(&uuid).await {
                Ok(Some(reply)) => self.emit(ClientEvent::ReplyReady {
                    uuid,
                    content: reply.content.unwrap_or_default(),
                }),
                Ok(None) => warn!(reply = %uuid, "downloads: reply vanished after download"),
                Err(err) => error!(reply = %uuid, "downloads: failed to load reply: {err:#}"),
            },
            ItemKind::File => self.emit(ClientEvent::FileReady(uuid)),
        }
    }

    async fn handle_download_failure(&mut self, job: Job, err: JobError) {
        let Some((kind, uuid)) = job.kind.download_target().map(|(k, u)| (k, u.clone())) else {
            return;
        };

        if err != JobError::ChecksumMismatch {
            if kind == ItemKind::File {
                error!(file = %uuid, "downloads: file download failed: {err}");
                self.transient_error(FILE_DOWNLOAD_FAILED_MESSAGE);
            } else {
                warn!(%kind, item = %uuid, "downloads: download failed: {err}");
            }
            return;
        }

        if !self.retries.record_failure(kind, &uuid) {
            warn!(%kind, item = %uuid, "downloads: giving up after repeated checksum mismatches");
            if kind == ItemKind::File {
                self.transient_error(FILE_DOWNLOAD_FAILED_MESSAGE);
            }
            return;
        }

        let delay = self.retries.delay();
        warn!(%kind, item = %uuid, ?delay, "downloads: checksum mismatch, resubmitting");
        if delay.is_zero() {
            self.submit_download(kind, uuid);
            return;
        }
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Inbox::Command(ControllerCommand::ResubmitDownload { kind, uuid }));
        });
    }
}

fn on_download_success(controller: &mut Controller, job: Job, _output: JobOutput) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_download_success(job))
}

fn on_download_failure(controller: &mut Controller, job: Job, err: JobError) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_download_failure(job, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_policy_always_allows_resubmission() {
        let mut policy = RetryPolicy::new(None, Duration::ZERO);
        let uuid = ItemId::from("f1");
        for _ in 0..50 {
            assert!(policy.record_failure(ItemKind::File, &uuid));
        }
        assert_eq!(policy.attempts(ItemKind::File, &uuid), 50);
    }

    #[test]
    fn limited_policy_gives_up_and_starts_over() {
        let mut policy = RetryPolicy::new(Some(2), Duration::ZERO);
        let uuid = ItemId::from("m1");
        assert!(policy.record_failure(ItemKind::Message, &uuid));
        assert!(policy.record_failure(ItemKind::Message, &uuid));
        assert!(!policy.record_failure(ItemKind::Message, &uuid));
        assert_eq!(policy.attempts(ItemKind::Message, &uuid), 0);
        assert!(policy.record_failure(ItemKind::Message, &uuid));
    }

    #[test]
    fn attempts_are_tracked_per_kind_and_item() {
        let mut policy = RetryPolicy::new(Some(1), Duration::ZERO);
        let uuid = ItemId::from("x");
        assert!(policy.record_failure(ItemKind::Message, &uuid));
        assert!(policy.record_failure(ItemKind::Reply, &uuid));
        policy.reset(ItemKind::Message, &uuid);
        assert_eq!(policy.attempts(ItemKind::Message, &uuid), 0);
        assert_eq!(policy.attempts(ItemKind::Reply, &uuid), 1);
    }
}
