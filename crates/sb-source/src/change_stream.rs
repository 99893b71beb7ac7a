//! Change-stream consumption for one watched namespace.
//!
//! Wraps the stream in a reconnection loop with exponential backoff. A stale
//! resume token clears the stored position and restarts from the present,
//! which can skip events; that is logged loudly.

use futures::stream::StreamExt;
use mongodb::bson::{self, Bson, Document, Timestamp};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::FullDocumentType;
use mongodb::Client;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use sb_common::{parse_namespace, ChangeDescription, Op, OpKind, OpSource, StreamToken, SyncError};

use crate::coalesce::Coalescer;
use crate::filters::OpFilter;
use crate::resume::now_timestamp;
use crate::{forward, next_backoff, Tuning, INITIAL_BACKOFF_MS};

/// Starting position for one stream.
#[derive(Debug, Clone)]
pub(crate) enum StreamStart {
    Token(Bson),
    OpTime(Timestamp),
    Current,
}

pub(crate) async fn run_change_stream(
    client: Client,
    namespace: String,
    start: StreamStart,
    tuning: Tuning,
    filter: OpFilter,
    tx: mpsc::Sender<Op>,
    err_tx: mpsc::Sender<SyncError>,
    mut stop: broadcast::Receiver<()>,
) {
    let (db, col) = match parse_namespace(&namespace) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = err_tx.send(e).await;
            return;
        }
    };
    let collection = client.database(&db).collection::<Document>(&col);

    let mut resume_after: Option<ResumeToken> = match &start {
        StreamStart::Token(raw) => bson::from_bson(raw.clone()).ok(),
        _ => None,
    };
    let start_at = match &start {
        StreamStart::OpTime(ts) if ts.time > 0 => Some(*ts),
        _ => None,
    };

    let mut consecutive_failures = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        let mut watch = collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume_after.clone() {
            watch = watch.resume_after(token);
        } else if let Some(ts) = start_at {
            watch = watch.start_at_operation_time(ts);
        }

        let mut stream = match watch.await {
            Ok(stream) => {
                consecutive_failures = 0;
                backoff_ms = INITIAL_BACKOFF_MS;
                info!(namespace = %namespace, "Change stream opened");
                stream
            }
            Err(e) => {
                consecutive_failures += 1;
                if is_stale_resume_token_error(&e) {
                    error!(
                        namespace = %namespace,
                        "Resume token expired, restarting from the present; events may be missed"
                    );
                    resume_after = None;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    continue;
                }
                let _ = err_tx.send(SyncError::source_err(&e)).await;
                warn!(
                    namespace = %namespace,
                    attempt = consecutive_failures,
                    backoff_ms,
                    "Failed to open change stream, retrying"
                );
                tokio::select! {
                    _ = stop.recv() => return,
                    _ = sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                }
                backoff_ms = next_backoff(backoff_ms);
                continue;
            }
        };

        let mut coalescer = Coalescer::new(tuning.buffer_size, tuning.ordering);
        let deadline = sleep(tuning.buffer_duration);
        tokio::pin!(deadline);

        let stream_error = loop {
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
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        let token = stream.resume_token();
                        resume_after = token.clone();
                        if let Some(op) = op_from_event(&namespace, event, token) {
                            if filter(&op) {
                                if let Some(batch) = coalescer.push(op) {
                                    if !forward(&tx, batch).await {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => break Some(e),
                    None => break None,
                }
            }
        };

        if !forward(&tx, coalescer.drain()).await {
            return;
        }

        consecutive_failures += 1;
        match stream_error {
            Some(e) if is_stale_resume_token_error(&e) => {
                error!(
                    namespace = %namespace,
                    "Resume token expired, restarting from the present; events may be missed"
                );
                resume_after = None;
                backoff_ms = INITIAL_BACKOFF_MS;
                continue;
            }
            Some(e) => {
                let _ = err_tx.send(SyncError::source_err(&e)).await;
                warn!(
                    namespace = %namespace,
                    attempt = consecutive_failures,
                    backoff_ms,
                    "Change stream error, reconnecting"
                );
            }
            None => {
                warn!(namespace = %namespace, backoff_ms, "Change stream closed, reconnecting");
            }
        }

        tokio::select! {
            _ = stop.recv() => return,
            _ = sleep(std::time::Duration::from_millis(backoff_ms)) => {}
        }
        backoff_ms = next_backoff(backoff_ms);
    }
}

fn op_from_event(
    namespace: &str,
    event: ChangeStreamEvent<Document>,
    token: Option<ResumeToken>,
) -> Option<Op> {
    let kind = match event.operation_type {
        OperationType::Insert => OpKind::Insert,
        OperationType::Update => OpKind::Update,
        OperationType::Replace => OpKind::Replace,
        OperationType::Delete => OpKind::Delete,
        _ => return None,
    };

    let id = event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .cloned()
        .or_else(|| {
            event
                .full_document
                .as_ref()
                .and_then(|doc| doc.get("_id"))
                .cloned()
        })?;

    let change = event.update_description.map(|desc| ChangeDescription {
        updated: desc.updated_fields,
        removed: desc.removed_fields,
    });

    let resume_token = token
        .and_then(|t| bson::to_bson(&t).ok())
        .map(|raw| StreamToken {
            stream_id: namespace.to_string(),
            token: raw,
        });

    Some(Op {
        id,
        namespace: namespace.to_string(),
        kind,
        doc: event.full_document,
        change,
        timestamp: now_timestamp(),
        source: OpSource::ChangeStream,
        resume_token,
    })
}

/// Heuristic match for errors that mean the stored resume position has aged
/// out of the change history.
fn is_stale_resume_token_error<E: std::fmt::Display>(e: &E) -> bool {
    let text = e.to_string().to_lowercase();
    (text.contains("changestream") && text.contains("history"))
        || text.contains("resume token")
        || text.contains("oplog")
        || text.contains("invalidate")
}
