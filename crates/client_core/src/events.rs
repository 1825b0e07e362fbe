use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::domain::ItemId;
use storage::{StoredSource, StoredUser};

pub const LOGIN_FAILED_MESSAGE: &str =
    "There was a problem signing in. Please verify your credentials and try again.";
pub const LOGIN_REQUIRED_MESSAGE: &str = "You must sign in to perform this action.";
pub const SERVER_UNREACHABLE_MESSAGE: &str = "The server cannot be reached.";
pub const FILE_DOWNLOAD_FAILED_MESSAGE: &str = "The file download failed. Please try again.";
pub const STAR_UPDATE_FAILED_MESSAGE: &str = "Failed to update star.";
pub const DELETE_SOURCE_FAILED_MESSAGE: &str = "Failed to delete source at server";
pub const DOWNLOADING_MESSAGES_ACTIVITY: &str = "Downloading new messages";
pub const DOWNLOADING_FILE_ACTIVITY: &str = "Downloading file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Syncing,
    Synced,
}

/// `duration: None` keeps the message up until it is cleared. `retry` asks the
/// presentation layer to offer a retry affordance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStatus {
    pub message: String,
    pub duration: Option<Duration>,
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    AuthenticationChanged(bool),
    Sync(SyncStatus),
    LastSync(Option<DateTime<Utc>>),
    SourcesUpdated(Vec<StoredSource>),
    MessageReady { uuid: ItemId, content: String },
    ReplyReady { uuid: ItemId, content: String },
    FileReady(ItemId),
    FileMissing(ItemId),
    ReplySucceeded(ItemId),
    ReplyFailed(ItemId),
    ErrorStatus(ErrorStatus),
    ErrorCleared,
    ActivityStatus { message: String, duration: Duration },
    SignedIn(StoredUser),
    LoginFailed(String),
}
