//! Compile-time mapper registrations.
//!
//! Engines select a mapper by `FunctionName`; add deployment-specific
//! mappers here and register them under the name the configuration uses.

use std::sync::Arc;

use sb_sync::{FnMapper, MapperInput, MapperOutput, MapperRegistry};

pub fn register_all(registry: &mut MapperRegistry) {
    registry.register("passthrough", Arc::new(FnMapper(passthrough)));
}

/// Indexes the observed document unchanged.
fn passthrough(_input: MapperInput<'_>) -> anyhow::Result<MapperOutput> {
    Ok(MapperOutput::passthrough())
}
