use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use shared::domain::ItemKind;
use tracing::{debug, error, info, warn};

use crate::{
    controller::Controller,
    error::{ControllerError, JobError},
    events::{
        ClientEvent, SyncStatus, DOWNLOADING_MESSAGES_ACTIVITY, SERVER_UNREACHABLE_MESSAGE,
    },
    jobs::{Job, JobKind, JobOutput},
};

/// Time of the last successful sync, persisted as RFC 3339 text.
#[derive(Debug, Clone)]
pub struct SyncMarker {
    path: PathBuf,
}

impl SyncMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the file is missing or unreadable.
    pub fn read(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Never moves the marker backwards.
    pub fn record(&self, at: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let latest = self.read().map_or(at, |previous| previous.max(at));
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        fs::write(&self.path, latest.to_rfc3339())
            .with_context(|| format!("failed to write sync marker '{}'", self.path.display()))?;
        Ok(latest)
    }
}

impl Controller {
    /// Requests a metadata sync. Does nothing while unauthenticated. When a
    /// sync is already queued the job queue is resumed instead, so a queue
    /// paused by a server timeout retries it.
    pub fn sync(&mut self) {
        if !self.authenticated() {
            debug!("sync: skipped, not authenticated");
            return;
        }
        if self.sync_pending() {
            debug!("sync: already queued, resuming job queue");
            self.queue.resume();
            return;
        }
        self.emit(ClientEvent::Sync(SyncStatus::Syncing));
        self.submit_job(JobKind::MetadataSync, on_sync_success, on_sync_failure, None);
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.sync_marker.read()
    }

    /// Publishes the last sync time without touching the network.
    pub fn refresh_sync_display(&self) {
        self.emit(ClientEvent::LastSync(self.last_sync()));
    }

    /// Publishes the locally stored sources, most recently updated first.
    pub async fn update_sources(&mut self) -> Result<(), ControllerError> {
        let mut sources = self.store.get_sources().await?;
        sources.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        debug!(count = sources.len(), "sync: publishing sources");
        self.emit(ClientEvent::SourcesUpdated(sources));
        self.refresh_sync_display();
        Ok(())
    }

    async fn handle_sync_success(&mut self) {
        info!("sync: metadata sync succeeded");
        self.clear_error();
        if let Err(err) = self.sync_marker.record(Utc::now()) {
            error!("sync: {err:#}");
        }
        match self.store.update_missing_files(&self.data_dir).await {
            Ok(missing) if !missing.is_empty() => {
                info!(count = missing.len(), "sync: marked missing files as not downloaded")
            }
            Ok(_) => {}
            Err(err) => error!("sync: failed to scan for missing files: {err:#}"),
        }
        if let Err(err) = self.update_sources().await {
            error!("sync: failed to refresh sources: {err:#}");
        }
        if let Err(err) = self.download_new_messages().await {
            error!("sync: failed to find new messages: {err:#}");
        }
        if let Err(err) = self.download_new_replies().await {
            error!("sync: failed to find new replies: {err:#}");
        }
        self.emit(ClientEvent::Sync(SyncStatus::Synced));
        self.queue.resume();
    }

    async fn handle_sync_failure(&mut self, err: JobError) {
        warn!("sync: metadata sync failed: {err}");
        self.show_error(SERVER_UNREACHABLE_MESSAGE, None, true);
        self.queue.resume();
    }

    async fn download_new_messages(&mut self) -> Result<(), ControllerError> {
        let messages = self.store.find_new_messages().await?;
        if !messages.is_empty() && self.api.is_some() {
            self.show_activity(DOWNLOADING_MESSAGES_ACTIVITY);
        }
        for message in messages {
            self.submit_download(ItemKind::Message, message.uuid);
        }
        Ok(())
    }

    async fn download_new_replies(&mut self) -> Result<(), ControllerError> {
        let replies = self.store.find_new_replies().await?;
        for reply in replies {
            self.submit_download(ItemKind::Reply, reply.uuid);
        }
        Ok(())
    }
}

fn on_sync_success(controller: &mut Controller, _job: Job, _output: JobOutput) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_sync_success())
}

fn on_sync_failure(controller: &mut Controller, _job: Job, err: JobError) -> BoxFuture<'_, ()> {
    Box::pin(controller.handle_sync_failure(err))
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
