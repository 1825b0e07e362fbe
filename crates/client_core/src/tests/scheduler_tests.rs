use super::*;
use crate::{events::ClientEvent, test_support::harness};
use std::sync::atomic::{AtomicUsize, Ordering};

fn counting_task(period: Duration) -> (ScheduledTask, Arc<AtomicUsize>) {
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let task = ScheduledTask::spawn("test", period, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (task, ticks)
}

#[tokio::test(start_paused = true)]
async fn first_tick_waits_a_full_period() {
    let (_task, ticks) = counting_task(Duration::from_secs(30));

    time::sleep(Duration::from_secs(29)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);

    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn trigger_now_fires_between_ticks() {
    let (task, ticks) = counting_task(Duration::from_secs(60));

    task.trigger_now();
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_task_stops_ticking() {
    let (task, ticks) = counting_task(Duration::from_secs(10));

    time::sleep(Duration::from_secs(11)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    task.cancel();
    time::sleep(Duration::from_secs(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(task.is_finished());
}

#[tokio::test]
async fn display_timer_publishes_last_sync() {
    let mut h = harness().await;
    time::pause();
    let _timers = SyncTimers::start(h.controller.handle(), &h.settings);

    assert!(h.controller.step().await);
    let events = h.drain_events();
    assert_eq!(events, vec![ClientEvent::LastSync(None)]);
}
