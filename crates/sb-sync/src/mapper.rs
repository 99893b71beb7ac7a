//! The mapper boundary.
//!
//! Mappers are compile-time-registered implementations selected by name from
//! engine configuration. An engine naming an unregistered mapper fails at
//! startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use mongodb::Client;

use sb_common::{ChangeDescription, OpKind, Result, SyncError};

/// The named database clients available to mappers for side lookups.
#[derive(Clone)]
pub struct DbClients {
    pub core: Client,
    pub learn: Client,
    pub engagement: Client,
    pub test: Client,
}

/// Everything a mapper sees about one mutation.
pub struct MapperInput<'a> {
    pub id: &'a Bson,
    /// The document payload. Parsed and raw views collapse into one
    /// `Document` here.
    pub document: &'a Document,
    pub database: &'a str,
    pub collection: &'a str,
    pub namespace: &'a str,
    pub operation: OpKind,
    pub change: Option<&'a ChangeDescription>,
    pub clients: &'a DbClients,
}

/// A mapper's verdict on one mutation. `index`, `routing`, `version` and
/// `pipeline` are passthroughs for indexers that accept them; the bulk wire
/// format used here has no per-document slot for them.
#[derive(Debug, Default)]
pub struct MapperOutput {
    pub document: Option<Document>,
    pub index: Option<String>,
    pub routing: Option<String>,
    pub version: Option<i64>,
    pub pipeline: Option<String>,
    pub skip: bool,
}

impl MapperOutput {
    /// Discard this op; resume state still advances past it.
    pub fn skipped() -> Self {
        Self {
            skip: true,
            ..Default::default()
        }
    }

    /// Index `doc` in place of the observed document.
    pub fn replaced(doc: Document) -> Self {
        Self {
            document: Some(doc),
            ..Default::default()
        }
    }

    /// Index the observed document unchanged.
    pub fn passthrough() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait Mapper: Send + Sync + std::fmt::Debug {
    async fn map(&self, input: MapperInput<'_>) -> anyhow::Result<MapperOutput>;
}

/// Adapts a plain function into a [`Mapper`].
pub struct FnMapper<F>(pub F);

impl<F> std::fmt::Debug for FnMapper<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMapper").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Mapper for FnMapper<F>
where
    F: for<'a> Fn(MapperInput<'a>) -> anyhow::Result<MapperOutput> + Send + Sync,
{
    async fn map(&self, input: MapperInput<'_>) -> anyhow::Result<MapperOutput> {
        (self.0)(input)
    }
}

/// Name → mapper bindings, populated at startup.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn Mapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, mapper: Arc<dyn Mapper>) {
        self.mappers.insert(name.into(), mapper);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Mapper>> {
        self.mappers
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::Config(format!("unknown mapper function: {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_registered_name() {
        let mut registry = MapperRegistry::new();
        registry.register(
            "noop",
            Arc::new(FnMapper(|_input: MapperInput<'_>| Ok(MapperOutput::passthrough()))),
        );
        assert!(registry.resolve("noop").is_ok());
    }

    #[test]
    fn test_registry_unknown_name_is_error() {
        let registry = MapperRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert!(err.to_string().contains("unknown mapper function: missing"));
    }
}
