//! Coalescing buffer between a single stream producer and the shared op
//! channel. Ops accumulate until the size cap is hit or the producer's flush
//! deadline fires, then leave as one batch in the requested order.

use sb_common::Op;

/// Emission order of a drained batch. Across batches and across sources no
/// ordering is promised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ordering {
    #[default]
    Any,
    Namespace,
    Timestamp,
}

#[derive(Debug)]
pub struct Coalescer {
    buf: Vec<Op>,
    capacity: usize,
    ordering: Ordering,
}

impl Coalescer {
    pub fn new(capacity: usize, ordering: Ordering) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            ordering,
        }
    }

    /// Buffers `op`, returning the full batch once the size cap is reached.
    pub fn push(&mut self, op: Op) -> Option<Vec<Op>> {
        self.buf.push(op);
        (self.buf.len() >= self.capacity).then(|| self.drain())
    }

    pub fn drain(&mut self) -> Vec<Op> {
        let mut batch = std::mem::take(&mut self.buf);
        match self.ordering {
            Ordering::Any => {}
            Ordering::Namespace => batch.sort_by(|a, b| a.namespace.cmp(&b.namespace)),
            Ordering::Timestamp => batch.sort_by_key(|op| (op.timestamp.time, op.timestamp.increment)),
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{Bson, Timestamp};
    use sb_common::{OpKind, OpSource};

    fn op(ns: &str, time: u32, increment: u32) -> Op {
        Op {
            id: Bson::Int32(time as i32),
            namespace: ns.to_string(),
            kind: OpKind::Insert,
            doc: None,
            change: None,
            timestamp: Timestamp { time, increment },
            source: OpSource::Oplog,
            resume_token: None,
        }
    }

    #[test]
    fn test_size_cap_triggers_batch() {
        let mut coalescer = Coalescer::new(2, Ordering::Any);
        assert!(coalescer.push(op("a.b", 1, 0)).is_none());
        let batch = coalescer.push(op("a.b", 2, 0)).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(coalescer.is_empty());
    }

    #[test]
    fn test_zero_capacity_emits_immediately() {
        let mut coalescer = Coalescer::new(0, Ordering::Any);
        assert_eq!(coalescer.push(op("a.b", 1, 0)).unwrap().len(), 1);
    }

    #[test]
    fn test_timestamp_ordering() {
        let mut coalescer = Coalescer::new(8, Ordering::Timestamp);
        coalescer.push(op("a.b", 5, 1));
        coalescer.push(op("a.b", 3, 2));
        coalescer.push(op("a.b", 5, 0));
        let batch = coalescer.drain();
        let times: Vec<(u32, u32)> = batch
            .iter()
            .map(|op| (op.timestamp.time, op.timestamp.increment))
            .collect();
        assert_eq!(times, vec![(3, 2), (5, 0), (5, 1)]);
    }

    #[test]
    fn test_namespace_ordering_groups() {
        let mut coalescer = Coalescer::new(8, Ordering::Namespace);
        coalescer.push(op("b.y", 1, 0));
        coalescer.push(op("a.x", 2, 0));
        coalescer.push(op("b.y", 3, 0));
        let batch = coalescer.drain();
        let namespaces: Vec<&str> = batch.iter().map(|op| op.namespace.as_str()).collect();
        assert_eq!(namespaces, vec!["a.x", "b.y", "b.y"]);
    }
}
