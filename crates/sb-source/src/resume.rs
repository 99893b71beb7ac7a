//! Durable resume checkpoints.
//!
//! Two strategies exist: a single `(T, I)` timestamp per resume name, or one
//! opaque token per change stream. Exactly one is active for a deployment;
//! the loaded [`ResumePoint`] variant makes the choice explicit to the
//! source adapter.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bson::{doc, Bson, Document, Timestamp};
use futures::future;
use futures::stream::TryStreamExt;
use mongodb::Client;
use tracing::info;

use sb_common::{Result, ResumeStrategy, SyncError};

const RESUME_COLLECTION: &str = "resume";
const TOKENS_COLLECTION: &str = "tokens";

/// Where the source adapter begins emission.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePoint {
    /// Replay the change history from this `(T, I)` position.
    Timestamp(Timestamp),
    /// Resume each change stream from its stored token; streams without a
    /// binding begin at the present.
    Tokens(HashMap<String, Bson>),
    /// Begin at the present with no stored state.
    Now,
}

/// The settings that select a resume point.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeSettings {
    pub replay: bool,
    pub resume: bool,
    pub resume_from_timestamp: i64,
    pub strategy: ResumeStrategy,
}

/// Timestamp to restart from, given a stored checkpoint. The increment is
/// bumped so the op that produced the checkpoint is not replayed.
pub fn next_after(stored: Timestamp) -> Timestamp {
    Timestamp {
        time: stored.time,
        increment: stored.increment + 1,
    }
}

/// Wall-clock seconds as an oplog-style timestamp.
pub fn now_timestamp() -> Timestamp {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Timestamp {
        time: secs as u32,
        increment: 0,
    }
}

/// Reads and writes checkpoints in the pipeline's metadata database.
#[derive(Clone)]
pub struct ResumeStore {
    client: Client,
    database: String,
    resume_name: String,
}

impl ResumeStore {
    pub fn new(client: Client, database: impl Into<String>, resume_name: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            resume_name: resume_name.into(),
        }
    }

    /// Resolves the starting position for this run.
    pub async fn load(&self, settings: ResumeSettings) -> Result<ResumePoint> {
        match settings.strategy {
            ResumeStrategy::Timestamp => {
                if settings.replay {
                    return Ok(ResumePoint::Timestamp(Timestamp {
                        time: 0,
                        increment: 0,
                    }));
                }
                if settings.resume_from_timestamp != 0 {
                    return Ok(ResumePoint::Timestamp(Timestamp {
                        time: settings.resume_from_timestamp as u32,
                        increment: 1,
                    }));
                }
                if settings.resume {
                    let ts = match self.load_timestamp().await? {
                        Some(stored) => next_after(stored),
                        None => next_after(self.last_committed().await?),
                    };
                    info!(t = ts.time, i = ts.increment, "Resuming from timestamp");
                    return Ok(ResumePoint::Timestamp(ts));
                }
                Ok(ResumePoint::Now)
            }
            ResumeStrategy::Token => {
                if settings.resume {
                    let tokens = self.load_tokens().await?;
                    for stream_id in tokens.keys() {
                        info!(
                            stream_id = %stream_id,
                            resume_name = %self.resume_name,
                            "Resuming stream from stored token"
                        );
                    }
                    return Ok(ResumePoint::Tokens(tokens));
                }
                Ok(ResumePoint::Now)
            }
        }
    }

    pub async fn load_timestamp(&self) -> Result<Option<Timestamp>> {
        let col = self
            .client
            .database(&self.database)
            .collection::<Document>(RESUME_COLLECTION);
        let found = col
            .find_one(doc! { "_id": &self.resume_name })
            .await
            .map_err(SyncError::resume_err)?;
        Ok(found.and_then(|doc| doc.get_timestamp("ts").ok()))
    }

    /// Upserts the `(T, I)` checkpoint for this resume name.
    pub async fn save_timestamp(&self, ts: Timestamp) -> Result<()> {
        let col = self
            .client
            .database(&self.database)
            .collection::<Document>(RESUME_COLLECTION);
        col.update_one(
            doc! { "_id": &self.resume_name },
            doc! { "$set": { "ts": ts } },
        )
        .upsert(true)
        .await
        .map_err(SyncError::resume_err)?;
        Ok(())
    }

    pub async fn load_tokens(&self) -> Result<HashMap<String, Bson>> {
        let col = self
            .client
            .database(&self.database)
            .collection::<Document>(TOKENS_COLLECTION);
        let mut cursor = col
            .find(doc! { "resumeName": &self.resume_name })
            .await
            .map_err(SyncError::resume_err)?;

        let mut tokens = HashMap::new();
        while let Some(doc) = cursor.try_next().await.map_err(SyncError::resume_err)? {
            let stream_id = match doc.get_str("streamID") {
                Ok(s) => s.to_string(),
                Err(_) => continue,
            };
            if let Some(token) = doc.get("token") {
                tokens.insert(stream_id, token.clone());
            }
        }
        Ok(tokens)
    }

    /// Upserts one record per `(resumeName, streamID)` binding. The upserts
    /// run concurrently; order between streams carries no meaning.
    pub async fn save_tokens(&self, tokens: &HashMap<String, Bson>) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let col = self
            .client
            .database(&self.database)
            .collection::<Document>(TOKENS_COLLECTION);

        let writes = tokens.iter().map(|(stream_id, token)| {
            let col = col.clone();
            let filter = doc! {
                "resumeName": &self.resume_name,
                "streamID": stream_id,
            };
            let update = doc! { "$set": {
                "resumeName": &self.resume_name,
                "streamID": stream_id,
                "token": token.clone(),
            }};
            async move { col.update_one(filter, update).upsert(true).await }
        });

        for result in future::join_all(writes).await {
            result.map_err(SyncError::resume_err)?;
        }
        Ok(())
    }

    /// The source's current last-committed timestamp, used when resuming
    /// with no stored checkpoint.
    pub async fn last_committed(&self) -> Result<Timestamp> {
        let reply = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .await
            .map_err(SyncError::resume_err)?;

        let from_last_write = reply
            .get_document("lastWrite")
            .ok()
            .and_then(|lw| lw.get_document("opTime").ok())
            .and_then(|op| op.get_timestamp("ts").ok());
        Ok(from_last_write
            .or_else(|| reply.get_timestamp("operationTime").ok())
            .unwrap_or_else(now_timestamp))
    }
}
