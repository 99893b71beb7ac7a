//! Engine registry: namespace → descriptor, built once at startup and
//! read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use bson::Document;
use chrono::{DateTime, Utc};

use sb_common::{parse_namespace, Result, SyncError};
use sb_config::EngineConfig;

use crate::mapper::{Mapper, MapperRegistry};

/// Static description of one downstream engine.
#[derive(Clone, Debug)]
pub struct EngineDescriptor {
    /// Target index name.
    pub name: String,
    /// Source namespace feeding this engine.
    pub namespace: String,
    pub change_stream_ns: Option<String>,
    /// Materialised-view namespace; oplog ops are re-fetched from here
    /// before mapping.
    pub direct_read_ns: Option<String>,
    pub mapper: Option<Arc<dyn Mapper>>,
}

pub type EngineRegistry = Arc<HashMap<String, EngineDescriptor>>;

/// Resolves engine configuration into the runtime registry. Unknown mapper
/// names fail here, before any worker starts.
pub fn build_registry(
    engines: &[EngineConfig],
    mappers: &MapperRegistry,
) -> Result<EngineRegistry> {
    if engines.is_empty() {
        return Err(SyncError::Config("no engine configuration found".to_string()));
    }

    let mut registry = HashMap::new();
    for config in engines {
        parse_namespace(&config.namespace)?;
        let mapper = match config.function_name() {
            Some(name) => Some(mappers.resolve(name)?),
            None => None,
        };
        registry.insert(
            config.namespace.clone(),
            EngineDescriptor {
                name: config.name.clone(),
                namespace: config.namespace.clone(),
                change_stream_ns: config.change_stream_ns().map(str::to_string),
                direct_read_ns: config.direct_read_ns().map(str::to_string),
                mapper,
            },
        );
    }
    Ok(Arc::new(registry))
}

/// Per-engine mutable state: documents mapped since the last flush.
pub struct EngineBuffer {
    pub name: String,
    pub docs: Vec<Document>,
    pub last_flush: Option<DateTime<Utc>>,
}

impl EngineBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: Vec::new(),
            last_flush: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{FnMapper, MapperInput, MapperOutput};

    fn engine_config(namespace: &str, function_name: &str) -> EngineConfig {
        EngineConfig {
            name: "products".to_string(),
            namespace: namespace.to_string(),
            function_name: function_name.to_string(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_build_registry() {
        let mut mappers = MapperRegistry::new();
        mappers.register(
            "noop",
            Arc::new(FnMapper(|_input: MapperInput<'_>| Ok(MapperOutput::passthrough()))),
        );
        let registry =
            build_registry(&[engine_config("shop.products", "noop")], &mappers).unwrap();
        let engine = registry.get("shop.products").unwrap();
        assert_eq!(engine.name, "products");
        assert!(engine.mapper.is_some());
    }

    #[test]
    fn test_empty_registry_is_fatal() {
        let err = build_registry(&[], &MapperRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("no engine configuration"));
    }

    #[test]
    fn test_unknown_mapper_is_fatal() {
        let err = build_registry(
            &[engine_config("shop.products", "missing")],
            &MapperRegistry::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown mapper function"));
    }

    #[test]
    fn test_bad_namespace_is_fatal() {
        assert!(build_registry(&[engine_config("nodot", "")], &MapperRegistry::new()).is_err());
    }
}
