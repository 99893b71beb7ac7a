//! The supervisor: worker pool over the shared op stream, per-engine
//! batching, flush policy and resume checkpointing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::{doc, Bson, Document, Timestamp};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use sb_common::{parse_namespace, Op, OpSource, Result, ResumeStrategy, Stats, SyncError};
use sb_index::IndexerClient;
use sb_source::ResumeStore;

use crate::engine::{EngineBuffer, EngineDescriptor, EngineRegistry};
use crate::mapper::{DbClients, MapperInput};

/// The configuration slice the manager acts on.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub flush_buffer_size: usize,
    pub resume: bool,
    pub resume_strategy: ResumeStrategy,
    pub verbose: bool,
}

/// All mutable indexing state, guarded by one mutex. The mutex is held for
/// the whole of a flush so a drain can never interleave with an append from
/// another worker.
struct IndexState {
    buffers: HashMap<String, EngineBuffer>,
    last_ts: Timestamp,
    tokens: HashMap<String, Bson>,
    stats: Stats,
}

pub struct SyncManager {
    registry: EngineRegistry,
    state: Mutex<IndexState>,
    indexer: Arc<IndexerClient>,
    clients: DbClients,
    resume_store: Option<ResumeStore>,
    settings: SyncSettings,
    tainted: AtomicBool,
}

impl SyncManager {
    pub fn new(
        registry: EngineRegistry,
        indexer: Arc<IndexerClient>,
        clients: DbClients,
        resume_store: Option<ResumeStore>,
        settings: SyncSettings,
        stats_enabled: bool,
    ) -> Self {
        let buffers = registry
            .values()
            .map(|engine| {
                (
                    engine.namespace.clone(),
                    EngineBuffer::new(engine.name.clone()),
                )
            })
            .collect();

        Self {
            registry,
            state: Mutex::new(IndexState {
                buffers,
                last_ts: Timestamp {
                    time: 0,
                    increment: 0,
                },
                tokens: HashMap::new(),
                stats: Stats::new(stats_enabled),
            }),
            indexer,
            clients,
            resume_store,
            settings,
            tainted: AtomicBool::new(false),
        }
    }

    /// Any error observed during steady-state processing marks the eventual
    /// exit status unclean without stopping the pipeline.
    pub fn taint(&self) {
        self.tainted.store(true, Ordering::SeqCst);
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }

    pub async fn stats_snapshot(&self) -> Stats {
        self.state.lock().await.stats.clone()
    }

    pub async fn last_ts(&self) -> Timestamp {
        self.state.lock().await.last_ts
    }

    pub async fn pending(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .await
            .buffers
            .get(namespace)
            .map(|b| b.docs.len())
            .unwrap_or(0)
    }

    /// Runs one op through the mapping stage and into its engine buffer.
    ///
    /// Ops without a registered engine are dropped silently. Mapper work
    /// happens before the index mutex is taken; only the append and a
    /// possible size-triggered flush run inside the critical section.
    pub async fn add_document(&self, op: Op) -> Result<()> {
        let Some(engine) = self.registry.get(&op.namespace) else {
            return Ok(());
        };

        let op = if engine.direct_read_ns.is_some() && op.is_from_oplog() {
            self.lookup_in_view(op, engine).await?
        } else {
            op
        };

        let doc = {
            let payload = op.doc.clone().unwrap_or_else(|| doc! { "_id": op.id.clone() });
            match &engine.mapper {
                Some(mapper) => {
                    let input = MapperInput {
                        id: &op.id,
                        document: &payload,
                        database: op.database(),
                        collection: op.collection(),
                        namespace: &op.namespace,
                        operation: op.kind,
                        change: op.change.as_ref(),
                        clients: &self.clients,
                    };
                    let output = mapper.map(input).await.map_err(|e| SyncError::Mapper {
                        namespace: op.namespace.clone(),
                        id: op.id.to_string(),
                        message: e.to_string(),
                    })?;
                    if output.skip {
                        let mut state = self.state.lock().await;
                        self.advance_resume(&mut state, &op);
                        return Ok(());
                    }
                    output.document.unwrap_or(payload)
                }
                None => payload,
            }
        };

        let mut state = self.state.lock().await;
        if let Some(buffer) = state.buffers.get_mut(&engine.namespace) {
            buffer.docs.push(doc);
        }
        self.advance_resume(&mut state, &op);

        let full = state
            .buffers
            .get(&engine.namespace)
            .map(|b| b.docs.len() >= self.settings.flush_buffer_size)
            .unwrap_or(false);
        if full {
            self.flush_locked(&mut state).await?;
        }
        Ok(())
    }

    fn advance_resume(&self, state: &mut IndexState, op: &Op) {
        if !op.advances_resume() {
            return;
        }
        let ts = op.timestamp;
        if (ts.time, ts.increment) > (state.last_ts.time, state.last_ts.increment) {
            state.last_ts = ts;
        }
        if self.settings.resume_strategy == ResumeStrategy::Token {
            if let Some(token) = &op.resume_token {
                state
                    .tokens
                    .insert(token.stream_id.clone(), token.token.clone());
            }
        }
    }

    /// Re-fetches the document from the engine's materialised view and
    /// substitutes it into the op. The rebuilt op reads as a direct query,
    /// so it no longer advances resume state.
    async fn lookup_in_view(&self, op: Op, engine: &EngineDescriptor) -> Result<Op> {
        let view_ns = engine
            .direct_read_ns
            .as_deref()
            .unwrap_or(&engine.namespace);
        let (db, col) = parse_namespace(view_ns)?;

        let fetched = self
            .clients
            .core
            .database(&db)
            .collection::<Document>(&col)
            .find_one(doc! { "_id": op.id.clone() })
            .await
            .map_err(|e| SyncError::View {
                namespace: view_ns.to_string(),
                id: op.id.to_string(),
                message: e.to_string(),
            })?;

        let doc = fetched.ok_or_else(|| SyncError::View {
            namespace: view_ns.to_string(),
            id: op.id.to_string(),
            message: "document not found".to_string(),
        })?;

        Ok(Op {
            doc: Some(doc),
            source: OpSource::DirectRead,
            ..op
        })
    }

    /// Flushes every non-empty engine buffer. Must run with the state lock
    /// held. A failed submission drops its batch and counts it as failed;
    /// replay or resume is the recovery path.
    async fn flush_locked(&self, state: &mut IndexState) -> Result<()> {
        let IndexState {
            buffers,
            stats,
            last_ts,
            tokens,
        } = state;

        let mut docs = 0;
        let mut first_error = None;

        for buffer in buffers.values_mut() {
            if buffer.docs.is_empty() {
                continue;
            }
            let batch = std::mem::take(&mut buffer.docs);
            docs += batch.len();
            match self.indexer.index(&buffer.name, &batch).await {
                Ok(()) => {
                    stats.add_indexed(batch.len());
                    stats.add_succeeded(batch.len());
                }
                Err(e) => {
                    stats.add_failed(batch.len());
                    error!("{}", e);
                    self.taint();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            buffer.last_flush = Some(Utc::now());
        }

        stats.add_flushed(1);
        stats.add_processed(docs);
        if self.settings.verbose && docs > 0 {
            debug!("{} docs flushed", docs);
        }

        if first_error.is_none() {
            if let Err(e) = self.checkpoint(*last_ts, tokens).await {
                // resume state stays at its last durable value
                error!("{}", e);
                self.taint();
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Persists the resume position after a fully successful flush.
    async fn checkpoint(
        &self,
        last_ts: Timestamp,
        tokens: &mut HashMap<String, Bson>,
    ) -> Result<()> {
        let Some(store) = &self.resume_store else {
            return Ok(());
        };
        if !self.settings.resume || last_ts.time == 0 {
            return Ok(());
        }
        match self.settings.resume_strategy {
            ResumeStrategy::Token => {
                if !tokens.is_empty() {
                    store.save_tokens(tokens).await?;
                    tokens.clear();
                }
            }
            ResumeStrategy::Timestamp => store.save_timestamp(last_ts).await?,
        }
        Ok(())
    }

    /// Flushes all pending work now: the periodic, size-overflow and
    /// shutdown paths all end here.
    pub async fn batch_index(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    /// Starts `count` workers draining the shared op stream. Each worker
    /// exits after a final flush-and-checkpoint once the stream closes.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        ops: mpsc::Receiver<Op>,
    ) -> Vec<JoinHandle<()>> {
        let shared = Arc::new(Mutex::new(ops));
        (0..count.max(1))
            .map(|worker| {
                let manager = self.clone();
                let rx = shared.clone();
                tokio::spawn(async move {
                    loop {
                        let op = { rx.lock().await.recv().await };
                        match op {
                            Some(op) => {
                                if let Err(e) = manager.add_document(op).await {
                                    error!("{}", e);
                                    manager.taint();
                                }
                            }
                            None => {
                                info!(worker, "Op stream closed, flushing pending work");
                                if let Err(e) = manager.batch_index().await {
                                    error!("{}", e);
                                    manager.taint();
                                }
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Logs source errors and taints the exit status; never terminates the
    /// pipeline.
    pub fn spawn_error_consumer(
        self: &Arc<Self>,
        mut errors: mpsc::Receiver<SyncError>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                error!("{}", e);
                manager.taint();
            }
        })
    }

    /// Periodic flusher. The caller gates this on a positive interval.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("flushing from ticker");
                if let Err(e) = manager.batch_index().await {
                    error!("error in flusher: {}", e);
                    manager.taint();
                }
            }
        })
    }
}
