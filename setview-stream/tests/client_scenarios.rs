//! Client scenarios against a scripted change-stream server: document
//! enumeration, rollback, partition-version fallthrough, stream teardown,
//! stats, and failover logs.

mod support;

use std::time::Duration;

use setview_stream::{
    AddStreamOutcome, DocChange, EnumOutcome, PartVersion, StreamClient, StreamError, StreamEvent,
};

use support::FakeServer;

const V0: PartVersion = PartVersion {
    uuid: 0xabcd,
    seq: 0,
};

async fn connect(server: FakeServer) -> StreamClient {
    let config = server.spawn().await;
    StreamClient::connect("indexer:test", "default", "", config)
        .await
        .expect("connect")
}

/// Fold that records `kind:key` per change.
fn record(change: DocChange, mut acc: Vec<String>) -> Vec<String> {
    match change {
        DocChange::Mutation(m) => {
            acc.push(format!("doc:{}", String::from_utf8_lossy(&m.key)));
        }
        DocChange::Deletion(d) => {
            acc.push(format!("del:{}", String::from_utf8_lossy(&d.key)));
        }
    }
    acc
}

#[tokio::test]
async fn test_enum_docs_since_happy_path() {
    let client = connect(FakeServer::default()).await;

    let outcome = client
        .enum_docs_since(0, &[V0], 4, 10, Vec::new(), record)
        .await
        .unwrap();

    match outcome {
        EnumOutcome::Done { acc, failover_log } => {
            assert_eq!(
                acc,
                vec!["doc:doc5", "doc:doc6", "doc:doc7", "doc:doc8", "doc:doc9", "doc:doc10"]
            );
            assert_eq!(failover_log, vec![V0]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_enum_docs_since_rollback() {
    let client = connect(FakeServer {
        rollback_to: 250,
        ..FakeServer::default()
    })
    .await;

    let outcome = client
        .enum_docs_since(0, &[V0], 400, 450, Vec::new(), record)
        .await
        .unwrap();

    assert_eq!(outcome, EnumOutcome::Rollback(250));
}

#[tokio::test]
async fn test_enum_docs_since_folds_removals() {
    let client = connect(FakeServer {
        num_docs: 3,
        delete_seqs: vec![2],
        ..FakeServer::default()
    })
    .await;

    let outcome = client
        .enum_docs_since(0, &[V0], 0, 3, Vec::new(), record)
        .await
        .unwrap();

    match outcome {
        EnumOutcome::Done { acc, .. } => {
            assert_eq!(acc, vec!["doc:doc1", "del:doc2", "doc:doc3"]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_version_fallthrough() {
    let client = connect(FakeServer {
        accepted_uuid: Some(0xabcd),
        num_docs: 2,
        ..FakeServer::default()
    })
    .await;

    let stale = PartVersion {
        uuid: 0x1111,
        seq: 0,
    };
    let outcome = client
        .enum_docs_since(0, &[stale, V0], 0, 2, Vec::new(), record)
        .await
        .unwrap();

    match outcome {
        EnumOutcome::Done { acc, .. } => assert_eq!(acc.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_all_versions_rejected_means_rebuild() {
    let client = connect(FakeServer {
        accepted_uuid: Some(0xabcd),
        ..FakeServer::default()
    })
    .await;

    let stale_a = PartVersion { uuid: 1, seq: 0 };
    let stale_b = PartVersion { uuid: 2, seq: 0 };
    let outcome = client
        .enum_docs_since(0, &[stale_a, stale_b], 0, 5, Vec::new(), record)
        .await
        .unwrap();

    assert_eq!(outcome, EnumOutcome::Rollback(0));
}

#[tokio::test]
async fn test_too_large_failover_log() {
    let mut config = FakeServer {
        failover_log: vec![(1, 0), (2, 0), (3, 0)],
        ..FakeServer::default()
    }
    .spawn()
    .await;
    config.max_failover_log_size = 2;

    let client = StreamClient::connect("indexer:test", "default", "", config)
        .await
        .unwrap();

    let version = PartVersion { uuid: 1, seq: 0 };
    match client
        .enum_docs_since(0, &[version], 0, 5, Vec::<String>::new(), record)
        .await
    {
        Err(StreamError::TooLargeFailoverLog(3)) => {}
        other => panic!("unexpected {:?}", other),
    }

    // The oversized stream was closed, not leaked: nothing stays active
    // and the partition can be opened again.
    assert!(client.list_streams().await.unwrap().is_empty());
    let (_, outcome) = client.add_stream(0, version, 0, 5).await.unwrap();
    assert!(matches!(outcome, AddStreamOutcome::FailoverLog(_)));
}

#[tokio::test]
async fn test_sasl_failure() {
    let config = FakeServer {
        sasl_fail: true,
        ..FakeServer::default()
    }
    .spawn()
    .await;

    match StreamClient::connect("indexer:test", "default", "bad", config).await {
        Err(StreamError::SaslAuthFailed) => {}
        Ok(_) => panic!("connect should have failed"),
        Err(other) => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_teardown_wakes_waiters() {
    // One held-open stream with a single document.
    let client = connect(FakeServer {
        num_docs: 1,
        hold_stream: true,
        ..FakeServer::default()
    })
    .await;

    let (opaque, outcome) = client.add_stream(2, V0, 0, 100).await.unwrap();
    assert!(matches!(outcome, AddStreamOutcome::FailoverLog(_)));
    assert_eq!(client.list_streams().await.unwrap(), vec![2]);

    // Drain the snapshot marker and the one mutation.
    assert!(matches!(
        client.get_stream_event(opaque).await.unwrap(),
        StreamEvent::SnapshotMarker { .. }
    ));
    assert!(matches!(
        client.get_stream_event(opaque).await.unwrap(),
        StreamEvent::Mutation(_)
    ));

    // Park a waiter on the now-empty queue.
    let waiter_client = client.clone();
    let waiter =
        tokio::spawn(async move { waiter_client.get_stream_event(opaque).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    // Closing the stream hands the parked caller the end of the stream.
    client.remove_stream(2).await.unwrap();
    assert!(matches!(
        waiter.await.unwrap().unwrap(),
        StreamEvent::StreamEnd
    ));

    // The stream is gone for any later consumer.
    assert!(matches!(
        client.get_stream_event(opaque).await,
        Err(StreamError::VbucketStreamNotFound)
    ));
    assert!(client.list_streams().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_stream_discards_queued_events() {
    // Held-open stream whose events are never drained.
    let client = connect(FakeServer {
        num_docs: 2,
        hold_stream: true,
        ..FakeServer::default()
    })
    .await;

    let (opaque, _) = client.add_stream(4, V0, 0, 100).await.unwrap();

    // Let the snapshot marker and both mutations land in the stream's
    // queue before anything consumes them.
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.remove_stream(4).await.unwrap();

    // The undelivered events went with the queue; nothing is handed out
    // late or out of order.
    assert!(matches!(
        client.get_stream_event(opaque).await,
        Err(StreamError::VbucketStreamNotFound)
    ));
    assert!(client.list_streams().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_end_removes_queue() {
    let client = connect(FakeServer {
        num_docs: 1,
        ..FakeServer::default()
    })
    .await;

    let (opaque, _) = client.add_stream(0, V0, 0, 1).await.unwrap();

    let mut saw_end = false;
    loop {
        match client.get_stream_event(opaque).await {
            Ok(StreamEvent::StreamEnd) => {
                saw_end = true;
                break;
            }
            Ok(_) => {}
            Err(e) => panic!("stream failed early: {e}"),
        }
    }
    assert!(saw_end);

    assert!(matches!(
        client.get_stream_event(opaque).await,
        Err(StreamError::VbucketStreamNotFound)
    ));
}

#[tokio::test]
async fn test_remove_stream_without_stream() {
    let client = connect(FakeServer::default()).await;
    assert!(matches!(
        client.remove_stream(9).await,
        Err(StreamError::VbucketStreamNotFound)
    ));
}

#[tokio::test]
async fn test_get_sequence_number() {
    let client = connect(FakeServer {
        high_seqno: 42,
        ..FakeServer::default()
    })
    .await;

    assert_eq!(client.get_sequence_number(3).await.unwrap(), 42);
}

#[tokio::test]
async fn test_get_sequence_number_not_my_vbucket() {
    let client = connect(FakeServer {
        stats_status: Some(setview_stream::frame::STATUS_NOT_MY_VBUCKET),
        ..FakeServer::default()
    })
    .await;

    assert!(matches!(
        client.get_sequence_number(3).await,
        Err(StreamError::NotMyVbucket)
    ));
}

#[tokio::test]
async fn test_get_failover_log() {
    let client = connect(FakeServer {
        failover_log: vec![(7, 3), (5, 1)],
        ..FakeServer::default()
    })
    .await;

    let log = client.get_failover_log(0).await.unwrap();
    assert_eq!(
        log,
        vec![
            PartVersion { uuid: 7, seq: 3 },
            PartVersion { uuid: 5, seq: 1 }
        ]
    );
}

#[tokio::test]
async fn test_empty_failover_log() {
    let client = connect(FakeServer {
        failover_log: Vec::new(),
        ..FakeServer::default()
    })
    .await;

    assert!(matches!(
        client.get_failover_log(0).await,
        Err(StreamError::NoFailoverLogFound)
    ));
}

#[tokio::test]
async fn test_unknown_opcode_stops_client() {
    let client = connect(FakeServer {
        garbage_response: true,
        ..FakeServer::default()
    })
    .await;

    // The receive worker dies on the unknown opcode, failing the pending
    // request and the client with it.
    match client.add_stream(0, V0, 0, 5).await {
        Err(StreamError::Closed(_)) => {}
        other => panic!("unexpected {:?}", other),
    }

    // Every later call reports the dead connection.
    assert!(client.list_streams().await.is_err());
}
