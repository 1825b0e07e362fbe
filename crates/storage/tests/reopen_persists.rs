use chrono::Utc;
use shared::domain::{ItemId, SendStatus, SourceId, UserId};
use storage::{LocalStore, NewDraftReply, Storage};

#[tokio::test]
async fn drafts_and_sources_survive_reopening_the_database() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("svs.sqlite");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage
            .upsert_source(&SourceId::from("s1"), "brave otter", true, Utc::now(), 1)
            .await
            .expect("source");
        storage
            .insert_draft_reply(&NewDraftReply {
                uuid: ItemId::from("d1"),
                source_uuid: SourceId::from("s1"),
                author_uuid: UserId::from("u1"),
                file_counter: 1,
                content: "we received your documents".to_string(),
                timestamp: Utc::now(),
                send_status: SendStatus::Pending,
            })
            .await
            .expect("draft");
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let sources = reopened.get_sources().await.expect("sources");
    assert_eq!(sources.len(), 1);
    assert!(sources[0].is_starred);

    // A previous session that crashed mid-send leaves PENDING rows behind.
    assert_eq!(
        reopened
            .mark_all_pending_drafts_as_failed()
            .await
            .expect("sweep"),
        1
    );
    let draft = reopened
        .get_draft_reply(&ItemId::from("d1"))
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(draft.send_status, SendStatus::Failed);
}
