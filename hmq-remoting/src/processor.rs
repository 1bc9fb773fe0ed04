//! Request processors and the per-code dispatch table.

use crate::channel::Channel;
use crate::executor::WorkerPool;
use hmq_protocol::Command;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Error type returned by processors.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// Context passed to a processor for a single request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    channel: Arc<Channel>,
}

impl RequestContext {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    /// Channel the request arrived on.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.remote_addr()
    }
}

/// Handles inbound requests of one or more codes.
///
/// Processors run on a worker pool, never on the I/O task, so they may block.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Produces the response, or `None` when no response should be written.
    fn process_request(
        &self,
        ctx: &RequestContext,
        request: &Command,
    ) -> Result<Option<Command>, ProcessorError>;

    /// Returns `true` to shed load before the request is queued.
    fn reject_request(&self) -> bool {
        false
    }
}

impl<F> RequestProcessor for F
where
    F: Fn(&RequestContext, &Command) -> Result<Option<Command>, ProcessorError>
        + Send
        + Sync
        + 'static,
{
    fn process_request(
        &self,
        ctx: &RequestContext,
        request: &Command,
    ) -> Result<Option<Command>, ProcessorError> {
        self(ctx, request)
    }
}

/// A processor and the pool it runs on.
#[derive(Clone)]
pub struct DispatchEntry {
    pub processor: Arc<dyn RequestProcessor>,
    pub executor: Arc<WorkerPool>,
}

impl DispatchEntry {
    pub fn new(processor: Arc<dyn RequestProcessor>, executor: Arc<WorkerPool>) -> Self {
        Self {
            processor,
            executor,
        }
    }
}

/// Maps request codes to dispatch entries, with an optional fallback.
#[derive(Default)]
pub struct ProcessorTable {
    by_code: RwLock<HashMap<i16, DispatchEntry>>,
    default: RwLock<Option<DispatchEntry>>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry for `code`, replacing any previous one.
    pub fn register(&self, code: i16, entry: DispatchEntry) {
        if self.by_code.write().insert(code, entry).is_some() {
            tracing::debug!("Replaced processor for request code {}", code);
        }
    }

    pub fn register_default(&self, entry: DispatchEntry) {
        *self.default.write() = Some(entry);
    }

    /// Resolves `code`, falling back to the default entry.
    pub fn lookup(&self, code: i16) -> Option<DispatchEntry> {
        if let Some(entry) = self.by_code.read().get(&code) {
            return Some(entry.clone());
        }
        self.default.read().clone()
    }

    pub fn contains(&self, code: i16) -> bool {
        self.by_code.read().contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.by_code.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.read().is_empty()
    }

    /// Every pool referenced by the table, default included.
    pub fn executors(&self) -> Vec<Arc<WorkerPool>> {
        let mut pools: Vec<Arc<WorkerPool>> = self
            .by_code
            .read()
            .values()
            .map(|e| e.executor.clone())
            .collect();
        if let Some(entry) = self.default.read().as_ref() {
            pools.push(entry.executor.clone());
        }
        pools.sort_by_key(|p| Arc::as_ptr(p) as usize);
        pools.dedup_by(|a, b| Arc::ptr_eq(a, b));
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &RequestContext, _: &Command) -> Result<Option<Command>, ProcessorError> {
        Ok(None)
    }

    struct Busy;

    impl RequestProcessor for Busy {
        fn process_request(
            &self,
            _ctx: &RequestContext,
            _request: &Command,
        ) -> Result<Option<Command>, ProcessorError> {
            Ok(None)
        }

        fn reject_request(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_lookup_with_default() {
        let pool = WorkerPool::new("table", 1, 4);
        let table = ProcessorTable::new();
        assert!(table.lookup(1).is_none());

        table.register(1, DispatchEntry::new(Arc::new(noop), pool.clone()));
        assert!(table.contains(1));
        assert!(table.lookup(2).is_none());

        table.register_default(DispatchEntry::new(Arc::new(Busy), pool.clone()));
        assert!(!table.lookup(1).unwrap().processor.reject_request());
        assert!(table.lookup(2).unwrap().processor.reject_request());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_executors_are_deduplicated() {
        let shared = WorkerPool::new("shared", 1, 4);
        let other = WorkerPool::new("other", 1, 4);
        let table = ProcessorTable::new();
        table.register(1, DispatchEntry::new(Arc::new(noop), shared.clone()));
        table.register(2, DispatchEntry::new(Arc::new(noop), shared.clone()));
        table.register_default(DispatchEntry::new(Arc::new(noop), other));
        assert_eq!(table.executors().len(), 2);
    }
}
