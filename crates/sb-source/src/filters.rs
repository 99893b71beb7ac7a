//! Composable predicates applied to every Op before emission.

use std::collections::HashSet;
use std::sync::Arc;

use sb_common::Op;

pub type OpFilter = Arc<dyn Fn(&Op) -> bool + Send + Sync>;

/// Applies `filters` in declared order, dropping the Op at the first
/// rejection.
pub fn chain_filters(filters: Vec<OpFilter>) -> OpFilter {
    Arc::new(move |op| filters.iter().all(|f| f(op)))
}

/// Drops Ops originating in the pipeline's own metadata database. Without
/// this, resume-state writes would loop back through the source.
pub fn not_self_writes(metadata_db: impl Into<String>) -> OpFilter {
    let metadata_db = metadata_db.into();
    Arc::new(move |op| op.database() != metadata_db)
}

/// Keeps only Ops whose namespace is registered with an engine.
pub fn only_namespaces(allowed: HashSet<String>) -> OpFilter {
    Arc::new(move |op| allowed.contains(&op.namespace))
}

/// Drops deletes (and anything else that is not an insert, update or
/// replace).
pub fn inserts_and_updates_only() -> OpFilter {
    Arc::new(|op| op.kind.is_insert() || op.kind.is_update())
}
