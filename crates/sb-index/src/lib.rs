//! HTTP client for the bulk document-index API.
//!
//! One call: submit a batch of documents to a named engine. Partial failures
//! reported in the response body are surfaced as errors so the caller can
//! account for the whole batch.

use std::time::Duration;

use bson::Document;
use serde::Deserialize;
use tracing::debug;

use sb_common::{Result, SyncError};

/// Indexer endpoint configuration.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Base URL of the form `http://host:port`.
    pub base_url: String,
    /// Bearer token; no Authorization header is sent when unset.
    pub api_key: Option<String>,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3002".to_string(),
            api_key: None,
            user_agent: "searchbridge".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-document status element of the bulk-index response.
#[derive(Debug, Deserialize)]
pub struct DocumentStatus {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

pub struct IndexerClient {
    config: IndexerConfig,
    client: reqwest::Client,
}

impl IndexerClient {
    pub fn new(config: IndexerConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(SyncError::Config(format!(
                "unsupported protocol scheme in {}, the address must start with http:// or https://",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::Index(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Creates or updates `docs` in `engine` with a single bulk request.
    pub async fn index(&self, engine: &str, docs: &[Document]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let url = format!(
            "{}/api/as/v1/engines/{}/documents",
            self.config.base_url.trim_end_matches('/'),
            engine
        );
        debug!("Indexing batch of {} documents into {}", docs.len(), engine);

        let mut request = self.client.post(&url).json(&docs);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        match status.as_u16() {
            204 => Ok(()),
            200 => {
                let results: Vec<DocumentStatus> = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Index(format!("invalid response body: {}", e)))?;
                let failures: Vec<String> = results
                    .iter()
                    .filter(|r| !r.errors.is_empty())
                    .map(|r| {
                        format!(
                            "{}: {}",
                            r.id
                                .as_ref()
                                .map(|id| id.to_string())
                                .unwrap_or_else(|| "?".to_string()),
                            r.errors.join(", ")
                        )
                    })
                    .collect();
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(SyncError::Index(format!(
                        "engine {} rejected {} of {} documents: {}",
                        engine,
                        failures.len(),
                        docs.len(),
                        failures.join("; ")
                    )))
                }
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::Index(format!(
                    "engine {} returned HTTP {}: {}",
                    engine, status, body
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> IndexerConfig {
        IndexerConfig {
            base_url: server.uri(),
            api_key: Some("key-123".to_string()),
            user_agent: "searchbridge v0.1.0".to_string(),
            ..IndexerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_index_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/as/v1/engines/products/documents"))
            .and(header("Authorization", "Bearer key-123"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "1", "errors": [] },
                { "id": "2", "errors": [] }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = IndexerClient::new(test_config(&server)).unwrap();
        let docs = vec![doc! { "_id": 1 }, doc! { "_id": 2 }];
        client.index("products", &docs).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_index_accepts_204() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = IndexerClient::new(test_config(&server)).unwrap();
        client.index("products", &[doc! { "_id": 1 }]).await.unwrap();
    }

    #[tokio::test]
    async fn test_index_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = IndexerClient::new(test_config(&server)).unwrap();
        let err = client.index("products", &[doc! { "_id": 1 }]).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_index_partial_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "1", "errors": [] },
                { "id": "2", "errors": ["field type mismatch"] }
            ])))
            .mount(&server)
            .await;

        let client = IndexerClient::new(test_config(&server)).unwrap();
        let docs = vec![doc! { "_id": 1 }, doc! { "_id": 2 }];
        let err = client.index("products", &docs).await.unwrap_err();
        assert!(err.to_string().contains("rejected 1 of 2"));
        assert!(err.to_string().contains("field type mismatch"));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let server = MockServer::start().await;
        // no mock mounted: any request would 404 and fail the call
        let client = IndexerClient::new(test_config(&server)).unwrap();
        client.index("products", &[]).await.unwrap();
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_scheme() {
        let config = IndexerConfig {
            base_url: "ftp://example.com".to_string(),
            ..IndexerConfig::default()
        };
        assert!(IndexerClient::new(config).is_err());
    }
}
