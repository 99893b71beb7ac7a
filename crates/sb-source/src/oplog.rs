//! Oplog tailing for clusters where change streams are not in use.
//!
//! Update entries carry modifiers rather than full documents, so the tail
//! re-fetches the document by id before emitting; an op whose document has
//! since disappeared is dropped.

use futures::stream::StreamExt;
use mongodb::bson::{doc, Document, Timestamp};
use mongodb::options::CursorType;
use mongodb::Client;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use sb_common::{parse_namespace, Op, OpKind, OpSource, SyncError};

use crate::coalesce::Coalescer;
use crate::filters::OpFilter;
use crate::resume::{next_after, now_timestamp};
use crate::{forward, next_backoff, Tuning, INITIAL_BACKOFF_MS};

pub(crate) async fn run_oplog_tail(
    client: Client,
    oplog_db: String,
    oplog_coll: String,
    start: Option<Timestamp>,
    tuning: Tuning,
    filter: OpFilter,
    tx: mpsc::Sender<Op>,
    err_tx: mpsc::Sender<SyncError>,
    mut stop: broadcast::Receiver<()>,
) {
    let oplog = client
        .database(&oplog_db)
        .collection::<Document>(&oplog_coll);

    // position to read from; advanced past each processed entry
    let mut position = start.unwrap_or_else(now_timestamp);
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        let query = doc! {
            "ts": { "$gte": position },
            "op": { "$in": ["i", "u", "d"] },
            "fromMigrate": { "$exists": false },
        };

        let mut cursor = match oplog
            .find(query)
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(Duration::from_secs(1))
            .await
        {
            Ok(cursor) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                info!(
                    t = position.time,
                    i = position.increment,
                    "Tailing oplog {}.{}",
                    oplog_db,
                    oplog_coll
                );
                cursor
            }
            Err(e) => {
                let _ = err_tx.send(SyncError::source_err(&e)).await;
                tokio::select! {
                    _ = stop.recv() => return,
                    _ = sleep(Duration::from_millis(backoff_ms)) => {}
                }
                backoff_ms = next_backoff(backoff_ms);
                continue;
            }
        };

        let mut coalescer = Coalescer::new(tuning.buffer_size, tuning.ordering);
        let deadline = sleep(tuning.buffer_duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    forward(&tx, coalescer.drain()).await;
                    return;
                }
                _ = deadline.as_mut() => {
                    if !forward(&tx, coalescer.drain()).await {
                        return;
                    }
                    deadline.as_mut().reset(Instant::now() + tuning.buffer_duration);
                }
                next = cursor.next() => match next {
                    Some(Ok(entry)) => {
                        if let Ok(ts) = entry.get_timestamp("ts") {
                            position = next_after(ts);
                        }
                        match op_from_oplog_entry(&client, entry).await {
                            Ok(Some(op)) => {
                                if filter(&op) {
                                    if let Some(batch) = coalescer.push(op) {
                                        if !forward(&tx, batch).await {
                                            return;
                                        }
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                let _ = err_tx.send(e).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = err_tx.send(SyncError::source_err(&e)).await;
                        break;
                    }
                    None => break,
                }
            }
        }

        if !forward(&tx, coalescer.drain()).await {
            return;
        }
        warn!(backoff_ms, "Oplog cursor ended, reconnecting");
        tokio::select! {
            _ = stop.recv() => return,
            _ = sleep(Duration::from_millis(backoff_ms)) => {}
        }
        backoff_ms = next_backoff(backoff_ms);
    }
}

async fn op_from_oplog_entry(client: &Client, entry: Document) -> Result<Option<Op>, SyncError> {
    let ns = entry.get_str("ns").unwrap_or("");
    if !ns.contains('.') {
        return Ok(None);
    }
    let (db, col) = parse_namespace(ns)?;
    if matches!(db.as_str(), "admin" | "config" | "local") || col.starts_with("system.") {
        return Ok(None);
    }

    let ts = entry
        .get_timestamp("ts")
        .map_err(|e| SyncError::Source(format!("oplog entry without ts: {}", e)))?;

    let (id, kind, doc) = match entry.get_str("op").unwrap_or("") {
        "i" => {
            let payload = entry
                .get_document("o")
                .map_err(SyncError::source_err)?
                .clone();
            let id = match payload.get("_id").cloned() {
                Some(id) => id,
                None => return Ok(None),
            };
            (id, OpKind::Insert, Some(payload))
        }
        "u" => {
            let target = entry
                .get_document("o2")
                .map_err(SyncError::source_err)?
                .clone();
            let id = match target.get("_id").cloned() {
                Some(id) => id,
                None => return Ok(None),
            };
            // the entry holds update modifiers; fetch the current document
            let fetched = client
                .database(&db)
                .collection::<Document>(&col)
                .find_one(doc! { "_id": id.clone() })
                .await
                .map_err(|e| {
                    SyncError::Source(format!("fetch for oplog update in {} failed: {}", ns, e))
                })?;
            match fetched {
                Some(doc) => (id, OpKind::Update, Some(doc)),
                None => return Ok(None),
            }
        }
        "d" => {
            let target = entry
                .get_document("o")
                .map_err(SyncError::source_err)?
                .clone();
            let id = match target.get("_id").cloned() {
                Some(id) => id,
                None => return Ok(None),
            };
            (id, OpKind::Delete, None)
        }
        _ => return Ok(None),
    };

    Ok(Some(Op {
        id,
        namespace: ns.to_string(),
        kind,
        doc,
        change: None,
        timestamp: ts,
        source: OpSource::Oplog,
        resume_token: None,
    }))
}
