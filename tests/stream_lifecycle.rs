//! Integration tests for the life of a stream: optimistic appends, idempotent resends,
//! metadata and retention, deletion with tombstones, and recreation.

use std::sync::Arc;

use streamstore::{
    CancellationToken, Error, ExpectedVersion, ManualClock, NewStreamMessage, PageReadStatus,
    Position, SetStreamMetadata, StoreConfig, StreamStore, StreamVersion, Tombstone,
};

fn message(message_type: &str) -> NewStreamMessage {
    NewStreamMessage::new(uuid::Uuid::new_v4(), message_type, bytes::Bytes::from_static(b"{}"))
}

fn batch(n: usize) -> Vec<NewStreamMessage> {
    (0..n).map(|_| message("Evt")).collect()
}

/// Every tombstone currently in `$deleted`, oldest first.
async fn tombstones(store: &StreamStore) -> Vec<Tombstone> {
    let page = store
        .read_stream_forwards("$deleted", StreamVersion::Start, 1000, &CancellationToken::new())
        .await
        .expect("read should succeed");
    page.messages
        .iter()
        .map(|m| Tombstone::decode(m).expect("tombstone should decode"))
        .collect()
}

#[tokio::test]
async fn optimistic_appends_chain_through_exact_versions() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();

    let first = store
        .append_to_stream("orders-1", ExpectedVersion::NoStream, batch(2), &cancel)
        .await
        .expect("first append should succeed");
    assert_eq!(first.current_version, 1);
    assert_eq!(first.current_position, 1);

    let second = store
        .append_to_stream("orders-1", ExpectedVersion::Exact(1), batch(1), &cancel)
        .await
        .expect("second append should succeed");
    assert_eq!(second.current_version, 2);
    assert_eq!(second.current_position, 2);

    let err = store
        .append_to_stream("orders-1", ExpectedVersion::Exact(1), batch(1), &cancel)
        .await
        .expect_err("stale expected version should conflict");
    assert!(err.is_conflict(), "expected a conflict, got: {err}");

    let err = store
        .append_to_stream("orders-1", ExpectedVersion::NoStream, batch(1), &cancel)
        .await
        .expect_err("NoStream on an existing stream should conflict");
    assert!(err.is_conflict());

    assert_eq!(
        store
            .get_stream_message_count("orders-1", &cancel)
            .await
            .expect("count"),
        3,
        "rejected appends must not write anything"
    );
}

#[tokio::test]
async fn resending_the_last_batch_returns_the_original_result() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    let messages = batch(3);

    let original = store
        .append_to_stream("s", ExpectedVersion::NoStream, messages.clone(), &cancel)
        .await
        .expect("append should succeed");
    let resent = store
        .append_to_stream("s", ExpectedVersion::NoStream, messages, &cancel)
        .await
        .expect("resend should succeed");

    assert_eq!(resent, original);
    assert_eq!(
        store.get_stream_message_count("s", &cancel).await.expect("count"),
        3
    );
}

#[tokio::test]
async fn invalid_appends_are_rejected() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();

    let cases = [
        ("", batch(1)),
        ("s", Vec::new()),
        ("s", vec![message("")]),
        ("s", vec![message(&"x".repeat(257))]),
    ];
    for (stream_id, messages) in cases {
        let err = store
            .append_to_stream(stream_id, ExpectedVersion::Any, messages, &cancel)
            .await
            .expect_err("invalid append should be rejected");
        assert!(
            matches!(err, Error::InvalidArgument(_)),
            "expected InvalidArgument, got: {err:?}"
        );
    }
    assert_eq!(
        store.read_head_checkpoint(&cancel).await.expect("head"),
        None
    );
}

#[tokio::test]
async fn metadata_round_trips_and_versions_its_own_stream() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();

    let unset = store
        .get_stream_metadata("s", &cancel)
        .await
        .expect("metadata read should succeed");
    assert_eq!(unset.metadata_stream_version, None);
    assert_eq!(unset.max_count, None);
    assert_eq!(unset.max_age, None);
    assert_eq!(unset.custom_metadata, None);

    store
        .set_stream_metadata(
            "s",
            ExpectedVersion::NoStream,
            SetStreamMetadata {
                max_age: Some(60),
                max_count: None,
                custom_metadata: Some(r#"{"owner":"billing"}"#.to_string()),
            },
            &cancel,
        )
        .await
        .expect("metadata write should succeed");
    store
        .set_stream_metadata(
            "s",
            ExpectedVersion::Exact(0),
            SetStreamMetadata {
                max_age: None,
                max_count: Some(10),
                custom_metadata: None,
            },
            &cancel,
        )
        .await
        .expect("second metadata write should succeed");

    let current = store
        .get_stream_metadata("s", &cancel)
        .await
        .expect("metadata read should succeed");
    assert_eq!(current.stream_id, "s");
    assert_eq!(current.metadata_stream_version, Some(1));
    assert_eq!(current.max_count, Some(10));
    assert_eq!(current.max_age, None, "the latest message replaces the whole policy");

    let err = store
        .set_stream_metadata("s", ExpectedVersion::Exact(0), SetStreamMetadata::default(), &cancel)
        .await
        .expect_err("stale metadata version should conflict");
    assert!(err.is_conflict());
}

#[tokio::test]
async fn max_count_truncates_the_oldest_messages_with_tombstones() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    let messages = batch(5);
    let ids: Vec<uuid::Uuid> = messages.iter().map(|m| m.message_id).collect();
    store
        .append_to_stream("s", ExpectedVersion::NoStream, messages, &cancel)
        .await
        .expect("append should succeed");

    store
        .set_stream_metadata(
            "s",
            ExpectedVersion::Any,
            SetStreamMetadata {
                max_count: Some(2),
                ..SetStreamMetadata::default()
            },
            &cancel,
        )
        .await
        .expect("metadata write should succeed");

    let page = store
        .read_stream_forwards("s", StreamVersion::Start, 10, &cancel)
        .await
        .expect("read should succeed");
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![3, 4]);

    let deleted: Vec<uuid::Uuid> = tombstones(&store)
        .await
        .into_iter()
        .map(|t| match t {
            Tombstone::MessageDeleted {
                stream_id,
                message_id,
            } => {
                assert_eq!(stream_id, "s");
                message_id
            }
            other => panic!("expected a message tombstone, got: {other:?}"),
        })
        .collect();
    assert_eq!(deleted, ids[..3].to_vec());

    // Later appends keep the stream at two messages.
    store
        .append_to_stream("s", ExpectedVersion::Exact(4), batch(1), &cancel)
        .await
        .expect("append should succeed");
    let page = store
        .read_stream_forwards("s", StreamVersion::Start, 10, &cancel)
        .await
        .expect("read should succeed");
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![4, 5]);
}

#[tokio::test]
async fn max_age_purge_removes_only_expired_messages() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = StreamStore::with_clock(StoreConfig::default(), clock.clone());
    let cancel = CancellationToken::new();

    store
        .append_to_stream("old", ExpectedVersion::NoStream, batch(2), &cancel)
        .await
        .expect("append should succeed");
    store
        .set_stream_metadata(
            "old",
            ExpectedVersion::NoStream,
            SetStreamMetadata {
                max_age: Some(30),
                ..SetStreamMetadata::default()
            },
            &cancel,
        )
        .await
        .expect("metadata write should succeed");

    clock.advance(20_000);
    store
        .append_to_stream("old", ExpectedVersion::Exact(1), batch(1), &cancel)
        .await
        .expect("append should succeed");

    assert_eq!(store.purge_expired(&cancel).await.expect("purge"), 0);

    clock.advance(10_000);
    assert_eq!(store.purge_expired(&cancel).await.expect("purge"), 2);

    let page = store
        .read_stream_forwards("old", StreamVersion::Start, 10, &cancel)
        .await
        .expect("read should succeed");
    let versions: Vec<u64> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![2]);
}

#[tokio::test]
async fn deleting_a_message_is_idempotent() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    let messages = batch(2);
    let target = messages[0].message_id;
    store
        .append_to_stream("s", ExpectedVersion::NoStream, messages, &cancel)
        .await
        .expect("append should succeed");

    store
        .delete_message("s", target, &cancel)
        .await
        .expect("delete should succeed");
    store
        .delete_message("s", target, &cancel)
        .await
        .expect("second delete should be a no-op");
    store
        .delete_message("ghost", target, &cancel)
        .await
        .expect("unknown stream should be a no-op");

    assert_eq!(
        tombstones(&store).await,
        vec![Tombstone::MessageDeleted {
            stream_id: "s".to_string(),
            message_id: target,
        }]
    );
    assert_eq!(store.get_stream_message_count("s", &cancel).await.expect("count"), 1);
}

#[tokio::test]
async fn deleted_stream_is_gone_and_can_be_recreated() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    store
        .append_to_stream("s", ExpectedVersion::NoStream, batch(3), &cancel)
        .await
        .expect("append should succeed");
    store
        .set_stream_metadata(
            "s",
            ExpectedVersion::NoStream,
            SetStreamMetadata {
                max_count: Some(100),
                ..SetStreamMetadata::default()
            },
            &cancel,
        )
        .await
        .expect("metadata write should succeed");

    let err = store
        .delete_stream("s", ExpectedVersion::Exact(0), &cancel)
        .await
        .expect_err("wrong expected version should conflict");
    assert!(err.is_conflict());

    store
        .delete_stream("s", ExpectedVersion::Exact(2), &cancel)
        .await
        .expect("delete should succeed");

    let page = store
        .read_stream_forwards("s", StreamVersion::Start, 10, &cancel)
        .await
        .expect("read should succeed");
    assert_eq!(page.status, PageReadStatus::StreamNotFound);
    let metadata = store
        .get_stream_metadata("s", &cancel)
        .await
        .expect("metadata read should succeed");
    assert_eq!(metadata.metadata_stream_version, None);
    assert_eq!(metadata.max_count, None);

    assert!(
        tombstones(&store)
            .await
            .contains(&Tombstone::StreamDeleted {
                stream_id: "s".to_string()
            })
    );

    // Deleting again is a no-op; naming a version on a missing stream is not.
    store
        .delete_stream("s", ExpectedVersion::Any, &cancel)
        .await
        .expect("delete of a missing stream should be a no-op");
    let err = store
        .delete_stream("s", ExpectedVersion::Exact(2), &cancel)
        .await
        .expect_err("exact version on a missing stream should conflict");
    assert!(err.is_conflict());

    let recreated = store
        .append_to_stream("s", ExpectedVersion::NoStream, batch(1), &cancel)
        .await
        .expect("recreation should succeed");
    assert_eq!(recreated.current_version, 0);

    let head = store
        .read_head_checkpoint(&cancel)
        .await
        .expect("head")
        .expect("store should not be empty");
    assert_eq!(recreated.current_position, head);
    let page = store
        .read_all_forwards(Position::Start, 100, &cancel)
        .await
        .expect("read should succeed");
    assert!(page.messages.windows(2).all(|w| w[0].checkpoint < w[1].checkpoint));
}

#[tokio::test]
async fn disposed_store_rejects_every_call() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    store
        .append_to_stream("s", ExpectedVersion::Any, batch(1), &cancel)
        .await
        .expect("append should succeed");

    store.dispose().await;
    store.dispose().await;
    assert!(store.is_disposed());

    let err = store
        .append_to_stream("s", ExpectedVersion::Any, batch(1), &cancel)
        .await
        .expect_err("append after dispose should fail");
    assert!(matches!(err, Error::Disposed));
    let err = store
        .read_all_forwards(Position::Start, 10, &cancel)
        .await
        .expect_err("read after dispose should fail");
    assert!(matches!(err, Error::Disposed));
    let err = store
        .get_stream_metadata("s", &cancel)
        .await
        .expect_err("metadata read after dispose should fail");
    assert!(matches!(err, Error::Disposed));
}

#[tokio::test]
async fn emptied_stream_cannot_be_deleted_under_an_exact_version() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    let messages = batch(1);
    let only = messages[0].message_id;
    store
        .append_to_stream("s", ExpectedVersion::NoStream, messages, &cancel)
        .await
        .expect("append should succeed");
    store
        .delete_message("s", only, &cancel)
        .await
        .expect("delete should succeed");
    assert_eq!(store.get_stream_message_count("s", &cancel).await.expect("count"), 0);

    let err = store
        .delete_stream("s", ExpectedVersion::Exact(0), &cancel)
        .await
        .expect_err("exact version on an emptied stream should conflict");
    assert!(err.is_conflict(), "expected a conflict, got: {err}");

    store
        .delete_stream("s", ExpectedVersion::Any, &cancel)
        .await
        .expect("any should delete the emptied stream");
    assert!(
        tombstones(&store)
            .await
            .contains(&Tombstone::StreamDeleted {
                stream_id: "s".to_string()
            })
    );
}

#[tokio::test]
async fn appends_to_reserved_streams_are_rejected() {
    let store = StreamStore::new();
    let cancel = CancellationToken::new();
    store
        .append_to_stream("s", ExpectedVersion::NoStream, batch(1), &cancel)
        .await
        .expect("append should succeed");

    for stream_id in ["$$s", "$deleted"] {
        let err = store
            .append_to_stream(stream_id, ExpectedVersion::Any, batch(1), &cancel)
            .await
            .expect_err("reserved stream id should be rejected");
        assert!(
            matches!(err, Error::InvalidArgument(_)),
            "expected InvalidArgument for {stream_id}, got: {err:?}"
        );
    }

    // The store's own metadata writes are unaffected.
    store
        .set_stream_metadata("s", ExpectedVersion::NoStream, SetStreamMetadata::default(), &cancel)
        .await
        .expect("metadata write should succeed");
    assert!(tombstones(&store).await.is_empty());
}
