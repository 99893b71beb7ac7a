//! Startup bulk scans of configured namespaces.

use futures::stream::{self, StreamExt, TryStreamExt};
use mongodb::bson::{doc, Document};
use mongodb::Client;
use tokio::sync::mpsc;
use tracing::info;

use sb_common::{parse_namespace, Op, OpKind, OpSource, SyncError};

use crate::filters::OpFilter;
use crate::resume::now_timestamp;

/// Scans every configured namespace on every client, bounded by
/// `worker_count` concurrent scans. Clients that do not host a namespace
/// simply yield nothing.
pub(crate) async fn run_direct_reads(
    clients: Vec<Client>,
    namespaces: Vec<String>,
    worker_count: usize,
    filter: OpFilter,
    tx: mpsc::Sender<Op>,
    err_tx: mpsc::Sender<SyncError>,
) {
    let scans: Vec<(Client, String)> = clients
        .iter()
        .flat_map(|client| {
            namespaces
                .iter()
                .map(move |ns| (client.clone(), ns.clone()))
        })
        .collect();

    stream::iter(scans)
        .for_each_concurrent(worker_count.max(1), |(client, ns)| {
            let filter = filter.clone();
            let tx = tx.clone();
            let err_tx = err_tx.clone();
            async move {
                if let Err(e) = scan_collection(client, &ns, &filter, &tx).await {
                    let _ = err_tx.send(e).await;
                }
            }
        })
        .await;

    info!("Direct reads completed");
}

async fn scan_collection(
    client: Client,
    namespace: &str,
    filter: &OpFilter,
    tx: &mpsc::Sender<Op>,
) -> Result<(), SyncError> {
    let (db, col) = parse_namespace(namespace)?;
    let mut cursor = client
        .database(&db)
        .collection::<Document>(&col)
        .find(doc! {})
        .await
        .map_err(SyncError::source_err)?;

    while let Some(doc) = cursor.try_next().await.map_err(SyncError::source_err)? {
        let id = match doc.get("_id").cloned() {
            Some(id) => id,
            None => continue,
        };
        let op = Op {
            id,
            namespace: namespace.to_string(),
            kind: OpKind::Insert,
            doc: Some(doc),
            change: None,
            timestamp: now_timestamp(),
            source: OpSource::DirectRead,
            resume_token: None,
        };
        if filter(&op) && tx.send(op).await.is_err() {
            // consumers are gone; abandon the scan quietly
            return Ok(());
        }
    }
    Ok(())
}
