//! Client-side session coordination for the secure inbox: authentication,
//! metadata sync, downloads, replies and the background job queue that
//! carries them to the server.

pub mod api;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod downloads;
pub mod error;
pub mod events;
pub mod handle;
pub mod jobs;
pub mod queue;
mod replies;
pub mod scheduler;
pub mod sync;

pub use api::{
    ApiConnector, CallValue, Credentials, MissingApiConnector, MissingRemoteApi, RemoteApi,
};
pub use config::ClientSettings;
pub use controller::{CallContext, Controller, FollowUp};
pub use error::{CallError, ControllerError, JobError};
pub use events::{ClientEvent, ErrorStatus, SyncStatus};
pub use handle::{ControllerCommand, ControllerHandle};
pub use jobs::{Job, JobId, JobKind, JobNotifier, JobOutput, JobResult, Lane};
pub use queue::{ApiJobQueue, JobQueue, JobRunner, MissingJobRunner};
pub use scheduler::{ScheduledTask, SyncTimers};
pub use sync::SyncMarker;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
