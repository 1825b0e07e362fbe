use super::*;
use chrono::TimeZone;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 2, hour, 0, 0).single().expect("time")
}

#[test]
fn missing_marker_reads_as_never_synced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = SyncMarker::new(dir.path().join("sync_flag"));
    assert_eq!(marker.read(), None);
}

#[test]
fn garbage_marker_reads_as_never_synced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sync_flag");
    fs::write(&path, "yesterday-ish").expect("write");
    assert_eq!(SyncMarker::new(path).read(), None);
}

#[test]
fn record_creates_parent_and_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = SyncMarker::new(dir.path().join("nested").join("sync_flag"));

    let written = marker.record(at(9)).expect("record");
    assert_eq!(written, at(9));
    assert_eq!(marker.read(), Some(at(9)));
}

#[test]
fn marker_never_moves_backwards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = SyncMarker::new(dir.path().join("sync_flag"));

    marker.record(at(12)).expect("record");
    let kept = marker.record(at(8)).expect("record");
    assert_eq!(kept, at(12));
    assert_eq!(marker.read(), Some(at(12)));

    marker.record(at(15)).expect("record");
    assert_eq!(marker.read(), Some(at(15)));
}
