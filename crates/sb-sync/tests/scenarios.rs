//! End-to-end scenarios for the mapping, batching and flush policy, with the
//! indexer faked by wiremock.

use std::sync::Arc;

use bson::{doc, Bson, Timestamp};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sb_common::{Op, OpKind, OpSource, ResumeStrategy};
use sb_config::EngineConfig;
use sb_index::{IndexerClient, IndexerConfig};
use sb_source::{chain_filters, inserts_and_updates_only, not_self_writes};
use sb_sync::{
    build_registry, DbClients, FnMapper, Mapper, MapperInput, MapperOutput, MapperRegistry,
    SyncManager, SyncSettings,
};

async fn db_clients() -> DbClients {
    let client = mongodb::Client::with_uri_str("mongodb://127.0.0.1:27017")
        .await
        .unwrap();
    DbClients {
        core: client.clone(),
        learn: client.clone(),
        engagement: client.clone(),
        test: client,
    }
}

async fn build_manager(
    server: &MockServer,
    flush_buffer_size: usize,
    mapper: Option<Arc<dyn Mapper>>,
) -> Arc<SyncManager> {
    let mut mappers = MapperRegistry::new();
    let function_name = match mapper {
        Some(m) => {
            mappers.register("test_mapper", m);
            "test_mapper".to_string()
        }
        None => String::new(),
    };

    let engines = vec![EngineConfig {
        name: "products".to_string(),
        namespace: "db1.coll".to_string(),
        function_name,
        ..EngineConfig::default()
    }];
    let registry = build_registry(&engines, &mappers).unwrap();

    let indexer = Arc::new(
        IndexerClient::new(IndexerConfig {
            base_url: server.uri(),
            ..IndexerConfig::default()
        })
        .unwrap(),
    );

    let settings = SyncSettings {
        flush_buffer_size,
        resume: false,
        resume_strategy: ResumeStrategy::Timestamp,
        verbose: false,
    };
    Arc::new(SyncManager::new(
        registry,
        indexer,
        db_clients().await,
        None,
        settings,
        true,
    ))
}

fn insert_op(namespace: &str, id: i32) -> Op {
    Op {
        id: Bson::Int32(id),
        namespace: namespace.to_string(),
        kind: OpKind::Insert,
        doc: Some(doc! { "_id": id, "title": format!("doc-{}", id) }),
        change: None,
        timestamp: Timestamp {
            time: 1_700_000_000,
            increment: id as u32,
        },
        source: OpSource::Oplog,
        resume_token: None,
    }
}

async fn mount_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/as/v1/engines/products/documents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

fn posted_ids(body: &[u8]) -> Vec<i64> {
    let value: serde_json::Value = serde_json::from_slice(body).unwrap();
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|doc| doc["_id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn size_triggered_flush_posts_one_batch_in_order() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let manager = build_manager(&server, 3, None).await;
    for id in 1..=3 {
        manager.add_document(insert_op("db1.coll", id)).await.unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(posted_ids(&requests[0].body), vec![1, 2, 3]);
    // a successful flush leaves the buffer empty
    assert_eq!(manager.pending("db1.coll").await, 0);
}

#[tokio::test]
async fn tick_triggered_flush_sends_partial_batch() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let manager = build_manager(&server, 10, None).await;
    let flusher = manager.spawn_flusher(Duration::from_secs(1));

    manager.add_document(insert_op("db1.coll", 1)).await.unwrap();
    manager.add_document(insert_op("db1.coll", 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    flusher.abort();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(posted_ids(&requests[0].body).len(), 2);

    let stats = manager.stats_snapshot().await;
    assert_eq!(stats.processed, 2);
}

#[tokio::test]
async fn mapper_skip_drops_document_but_advances_resume() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let mapper: Arc<dyn Mapper> = Arc::new(FnMapper(|input: MapperInput<'_>| {
        if input.id == &Bson::Int32(7) {
            Ok(MapperOutput::skipped())
        } else {
            Ok(MapperOutput::passthrough())
        }
    }));
    let manager = build_manager(&server, 2, Some(mapper)).await;

    for id in [6, 7, 8] {
        manager.add_document(insert_op("db1.coll", id)).await.unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(posted_ids(&requests[0].body), vec![6, 8]);

    // the skipped op still advanced lastTs
    let last = manager.last_ts().await;
    assert_eq!((last.time, last.increment), (1_700_000_000, 8));
}

#[tokio::test]
async fn mapper_rewrite_replaces_document() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let mapper: Arc<dyn Mapper> = Arc::new(FnMapper(|input: MapperInput<'_>| {
        let mut doc = input.document.clone();
        doc.insert("mapped", true);
        Ok(MapperOutput::replaced(doc))
    }));
    let manager = build_manager(&server, 1, Some(mapper)).await;

    manager.add_document(insert_op("db1.coll", 1)).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(value[0]["mapped"], json!(true));
}

#[tokio::test]
async fn mapper_error_drops_op_and_surfaces_context() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let mapper: Arc<dyn Mapper> = Arc::new(FnMapper(|_input: MapperInput<'_>| {
        Err(anyhow::anyhow!("boom"))
    }));
    let manager = build_manager(&server, 1, Some(mapper)).await;

    let err = manager
        .add_document(insert_op("db1.coll", 5))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("db1.coll"));
    assert!(message.contains("5"));
    assert!(message.contains("boom"));

    assert_eq!(manager.pending("db1.coll").await, 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn self_writes_are_filtered_before_the_pipeline() {
    let filter = chain_filters(vec![
        not_self_writes("searchbridge"),
        inserts_and_updates_only(),
    ]);
    assert!(!filter(&insert_op("searchbridge.resume", 1)));
    assert!(filter(&insert_op("db1.coll", 1)));

    // and an op for an unregistered namespace is a silent no-op downstream
    let server = MockServer::start().await;
    let manager = build_manager(&server, 1, None).await;
    manager
        .add_document(insert_op("other.coll", 1))
        .await
        .unwrap();
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn indexer_failure_counts_batch_and_continues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let manager = build_manager(&server, 2, None).await;
    manager.add_document(insert_op("db1.coll", 1)).await.unwrap();
    let result = manager.add_document(insert_op("db1.coll", 2)).await;
    assert!(result.is_err());

    // the batch is dropped, not retried
    assert_eq!(manager.pending("db1.coll").await, 0);
    let stats = manager.stats_snapshot().await;
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.processed, 2);
    assert!(manager.is_tainted());

    // the pipeline keeps accepting work
    manager.add_document(insert_op("db1.coll", 3)).await.unwrap();
    assert_eq!(manager.pending("db1.coll").await, 1);
}

#[tokio::test]
async fn flush_buffer_size_zero_flushes_every_document() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let manager = build_manager(&server, 0, None).await;
    manager.add_document(insert_op("db1.coll", 1)).await.unwrap();
    manager.add_document(insert_op("db1.coll", 2)).await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn workers_flush_pending_work_when_stream_closes() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let manager = build_manager(&server, 10, None).await;
    let (tx, rx) = mpsc::channel(16);
    let workers = manager.spawn_workers(4, rx);

    tx.send(insert_op("db1.coll", 1)).await.unwrap();
    tx.send(insert_op("db1.coll", 2)).await.unwrap();
    drop(tx);

    for worker in workers {
        worker.await.unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(posted_ids(&requests[0].body).len(), 2);
    assert_eq!(manager.pending("db1.coll").await, 0);
}

#[tokio::test]
async fn last_ts_is_non_decreasing() {
    let server = MockServer::start().await;
    mount_ok(&server).await;

    let manager = build_manager(&server, 10, None).await;

    let mut late = insert_op("db1.coll", 1);
    late.timestamp = Timestamp {
        time: 1_700_000_100,
        increment: 1,
    };
    manager.add_document(late).await.unwrap();

    let mut early = insert_op("db1.coll", 2);
    early.timestamp = Timestamp {
        time: 1_700_000_000,
        increment: 9,
    };
    manager.add_document(early).await.unwrap();

    let last = manager.last_ts().await;
    assert_eq!((last.time, last.increment), (1_700_000_100, 1));
}
