use super::*;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

fn explode() -> Result<(), ApiError> {
    panic!("transport blew up")
}

fn collector<T: Send + 'static>() -> (
    mpsc::UnboundedSender<(CallId, CallResult<T>)>,
    mpsc::UnboundedReceiver<(CallId, CallResult<T>)>,
) {
    mpsc::unbounded_channel()
}

#[tokio::test]
async fn delivers_success_once() {
    let bridge = CallBridge::new(2, 2);
    let (tx, mut rx) = collector::<u32>();
    let handle = bridge.invoke(
        || async { Ok(7) },
        move |id, result| {
            let _ = tx.send((id, result));
        },
    );

    let (id, result) = rx.recv().await.expect("outcome");
    assert_eq!(id, handle.id);
    assert_eq!(result, Ok(7));
    assert!(rx.recv().await.is_none(), "deliver must run exactly once");
}

#[tokio::test]
async fn timeout_errors_are_classified() {
    let bridge = CallBridge::new(1, 0);
    let (tx, mut rx) = collector::<()>();
    bridge.invoke(
        || async { Err(ApiError::timeout("read timed out")) },
        move |id, result| {
            let _ = tx.send((id, result));
        },
    );

    let (_, result) = rx.recv().await.expect("outcome");
    let err = result.expect_err("timeout is a failure");
    assert!(err.is_timeout());
}

#[tokio::test]
async fn generic_errors_are_failures() {
    let bridge = CallBridge::new(1, 0);
    let (tx, mut rx) = collector::<()>();
    bridge.invoke(
        || async { Err(ApiError::unauthorized("bad passphrase")) },
        move |id, result| {
            let _ = tx.send((id, result));
        },
    );

    let (_, result) = rx.recv().await.expect("outcome");
    assert_eq!(
        result,
        Err(CallError::Failed(ApiError::unauthorized("bad passphrase")))
    );
}

#[tokio::test]
async fn panicking_call_is_reported_as_aborted() {
    let bridge = CallBridge::new(1, 0);
    let (tx, mut rx) = collector::<()>();
    bridge.invoke(
        || async { explode() },
        move |id, result| {
            let _ = tx.send((id, result));
        },
    );

    let (_, result) = rx.recv().await.expect("outcome");
    assert!(matches!(result, Err(CallError::Aborted(_))));
}

#[tokio::test]
async fn rejects_calls_beyond_the_wait_queue() {
    let bridge = CallBridge::new(1, 1);
    let (tx, mut rx) = collector::<&'static str>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let first_tx = tx.clone();
    let first = bridge.invoke(
        move || async move {
            let _ = release_rx.await;
            Ok("first")
        },
        move |id, result| {
            let _ = first_tx.send((id, result));
        },
    );
    let second_tx = tx.clone();
    let second = bridge.invoke(
        || async { Ok("second") },
        move |id, result| {
            let _ = second_tx.send((id, result));
        },
    );
    assert_eq!(bridge.waiting(), 1);

    let third = bridge.invoke(
        || async { Ok("third") },
        move |id, result| {
            let _ = tx.send((id, result));
        },
    );
    assert!(third.worker.is_none());
    let (id, result) = rx.try_recv().expect("rejection is delivered immediately");
    assert_eq!(id, third.id);
    assert_eq!(result, Err(CallError::Saturated));

    release_tx.send(()).expect("release first call");
    let mut completed = Vec::new();
    for _ in 0..2 {
        let (id, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no hang")
            .expect("outcome");
        completed.push((id, result.expect("success")));
    }
    assert_eq!(completed, vec![(first.id, "first"), (second.id, "second")]);
    assert_eq!(bridge.waiting(), 0);
}
