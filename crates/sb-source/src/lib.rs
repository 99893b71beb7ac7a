//! Op source adapter: multiplexes change streams, oplog tails and startup
//! bulk scans from any number of database clients into one bounded stream of
//! [`Op`] records, pre-filtered and positioned by a resume point.

mod change_stream;
mod coalesce;
mod direct_read;
mod filters;
mod oplog;
mod resume;

use std::time::Duration;

use mongodb::Client;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use sb_common::{Op, SyncError};

pub use coalesce::{Coalescer, Ordering};
pub use filters::{
    chain_filters, inserts_and_updates_only, not_self_writes, only_namespaces, OpFilter,
};
pub use resume::{next_after, now_timestamp, ResumePoint, ResumeSettings, ResumeStore};

use change_stream::{run_change_stream, StreamStart};
use direct_read::run_direct_reads;
use oplog::run_oplog_tail;

pub(crate) const INITIAL_BACKOFF_MS: u64 = 5_000;
pub(crate) const MAX_BACKOFF_MS: u64 = 60_000;
pub(crate) const BACKOFF_MULTIPLIER: f64 = 2.0;

pub(crate) fn next_backoff(current_ms: u64) -> u64 {
    ((current_ms as f64 * BACKOFF_MULTIPLIER) as u64).min(MAX_BACKOFF_MS)
}

/// Pushes a drained batch into the shared channel. Returns false once the
/// consumers are gone.
pub(crate) async fn forward(tx: &mpsc::Sender<Op>, batch: Vec<Op>) -> bool {
    for op in batch {
        if tx.send(op).await.is_err() {
            return false;
        }
    }
    true
}

/// Per-producer coalescing parameters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tuning {
    pub buffer_size: usize,
    pub buffer_duration: Duration,
    pub ordering: Ordering,
}

pub struct SourceOptions {
    /// Bound on the shared op channel.
    pub channel_size: usize,
    /// Max ops a producer coalesces before forced emission.
    pub buffer_size: usize,
    /// Max wall-clock delay before forced emission.
    pub buffer_duration: Duration,
    /// Concurrency bound for startup bulk scans.
    pub worker_count: usize,
    pub ordering: Ordering,
    pub direct_read_namespaces: Vec<String>,
    pub change_stream_namespaces: Vec<String>,
    /// Set when direct reads are configured to keep the oplog tail off.
    pub oplog_disabled: bool,
    pub oplog_database: String,
    pub oplog_collection: String,
    pub filter: Option<OpFilter>,
    pub resume: ResumePoint,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            channel_size: 512,
            buffer_size: 32,
            buffer_duration: Duration::from_millis(75),
            worker_count: 4,
            ordering: Ordering::Any,
            direct_read_namespaces: Vec::new(),
            change_stream_namespaces: Vec::new(),
            oplog_disabled: false,
            oplog_database: "local".to_string(),
            oplog_collection: "oplog.rs".to_string(),
            filter: None,
            resume: ResumePoint::Now,
        }
    }
}

/// Remote stop switch for a running source.
#[derive(Clone)]
pub struct StopHandle(broadcast::Sender<()>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(());
    }
}

/// A running source. Dropping the receivers (or calling [`stop`]) winds the
/// producers down; the op channel closes once every producer has drained.
///
/// [`stop`]: SourceHandle::stop
pub struct SourceHandle {
    pub ops: mpsc::Receiver<Op>,
    pub errors: mpsc::Receiver<SyncError>,
    stop_tx: broadcast::Sender<()>,
    /// Completes when all startup bulk scans are done; absent when none were
    /// configured.
    pub direct_reads: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }
}

/// Starts producers for every client and returns the multiplexed streams.
///
/// Within a single producer, ops keep source order; across producers no
/// order is promised. Backpressure flows from the bounded channel into the
/// producers, ultimately slowing stream consumption.
pub fn start_multi(clients: Vec<Client>, options: SourceOptions) -> SourceHandle {
    let (tx, ops_rx) = mpsc::channel::<Op>(options.channel_size.max(1));
    let (err_tx, err_rx) = mpsc::channel::<SyncError>(64);
    let (stop_tx, _) = broadcast::channel::<()>(8);

    let filter: OpFilter = options
        .filter
        .clone()
        .unwrap_or_else(|| std::sync::Arc::new(|_op: &Op| true));
    let tuning = Tuning {
        buffer_size: options.buffer_size,
        buffer_duration: options.buffer_duration,
        ordering: options.ordering,
    };

    let tail_oplog = !options.oplog_disabled && options.change_stream_namespaces.is_empty();

    for client in &clients {
        if tail_oplog {
            let start = match &options.resume {
                ResumePoint::Timestamp(ts) => Some(*ts),
                _ => None,
            };
            tokio::spawn(run_oplog_tail(
                client.clone(),
                options.oplog_database.clone(),
                options.oplog_collection.clone(),
                start,
                tuning,
                filter.clone(),
                tx.clone(),
                err_tx.clone(),
                stop_tx.subscribe(),
            ));
        }

        for namespace in &options.change_stream_namespaces {
            let start = match &options.resume {
                ResumePoint::Tokens(tokens) => tokens
                    .get(namespace)
                    .cloned()
                    .map(StreamStart::Token)
                    .unwrap_or(StreamStart::Current),
                ResumePoint::Timestamp(ts) => StreamStart::OpTime(*ts),
                ResumePoint::Now => StreamStart::Current,
            };
            tokio::spawn(run_change_stream(
                client.clone(),
                namespace.clone(),
                start,
                tuning,
                filter.clone(),
                tx.clone(),
                err_tx.clone(),
                stop_tx.subscribe(),
            ));
        }
    }

    let direct_reads = (!options.direct_read_namespaces.is_empty()).then(|| {
        tokio::spawn(run_direct_reads(
            clients.clone(),
            options.direct_read_namespaces.clone(),
            options.worker_count,
            filter.clone(),
            tx.clone(),
            err_tx.clone(),
        ))
    });

    SourceHandle {
        ops: ops_rx,
        errors: err_rx,
        stop_tx,
        direct_reads,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_backoff_caps() {
        assert_eq!(next_backoff(5_000), 10_000);
        assert_eq!(next_backoff(40_000), 60_000);
        assert_eq!(next_backoff(60_000), 60_000);
    }

    #[tokio::test]
    async fn test_empty_source_closes_channel() {
        // no producers at all: the channel closes as soon as the local
        // senders drop
        let mut handle = start_multi(Vec::new(), SourceOptions::default());
        assert!(handle.ops.recv().await.is_none());
    }
}
