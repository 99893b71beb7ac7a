pub mod engine;
pub mod manager;
pub mod mapper;

// Re-export key types
pub use engine::{build_registry, EngineBuffer, EngineDescriptor, EngineRegistry};
pub use manager::{SyncManager, SyncSettings};
pub use mapper::{DbClients, FnMapper, Mapper, MapperInput, MapperOutput, MapperRegistry};
