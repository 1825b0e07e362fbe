//! Periodic sync timers.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::ClientSettings, handle::ControllerHandle};

/// A repeating task that fires every `period` and on [`ScheduledTask::trigger_now`].
/// The first tick comes one full period after start.
pub struct ScheduledTask {
    name: &'static str,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let child_token = cancel.clone();
        let manual = Arc::clone(&trigger);

        let worker = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child_token.cancelled() => {
                        debug!(timer = name, "timer cancelled");
                        break;
                    }
                    _ = ticker.tick() => tick(),
                    _ = manual.notified() => tick(),
                }
            }
        });

        Self {
            name,
            cancel,
            trigger,
            worker,
        }
    }

    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        debug!(timer = self.name, "stopping timer");
        self.cancel.cancel();
    }
}

/// The display-refresh and network-sync timers, both feeding the controller.
pub struct SyncTimers {
    pub display: ScheduledTask,
    pub network: ScheduledTask,
}

impl SyncTimers {
    pub fn start(handle: ControllerHandle, settings: &ClientSettings) -> Self {
        let display_handle = handle.clone();
        let display = ScheduledTask::spawn("sync_display", settings.sync_display_interval(), move || {
            if let Err(err) = display_handle.refresh_sync_display() {
                warn!("sync display timer: {err}");
            }
        });
        let network = ScheduledTask::spawn("sync_network", settings.sync_interval(), move || {
            if let Err(err) = handle.sync() {
                warn!("sync timer: {err}");
            }
        });
        info!(
            display_secs = settings.sync_display_interval().as_secs(),
            network_secs = settings.sync_interval().as_secs(),
            "sync timers started"
        );
        Self { display, network }
    }

    pub fn stop(&self) {
        self.display.cancel();
        self.network.cancel();
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
