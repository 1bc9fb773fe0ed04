//! Pending requests awaiting a response.

use crate::error::RemotingError;
use crate::release::ReleaseOnce;
use dashmap::DashMap;
use hmq_protocol::Command;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Callback completing an asynchronous invocation.
pub type InvokeCallback = Box<dyn FnOnce(Result<Command, RemotingError>) + Send + 'static>;

/// Grace period past the timeout before the table scan reaps an entry.
pub const EXPIRY_GRACE: Duration = Duration::from_secs(1);

const SEND_UNKNOWN: u8 = 0;
const SEND_OK: u8 = 1;
const SEND_FAILED: u8 = 2;

enum Completion {
    Waiter(oneshot::Sender<Option<Command>>),
    Callback(InvokeCallback),
}

/// State of one outstanding request.
pub struct ResponseFuture {
    opaque: i32,
    channel_id: u64,
    remote_addr: String,
    timeout: Duration,
    begin: Instant,
    send_state: AtomicU8,
    cause: Mutex<Option<String>>,
    response: Mutex<Option<Command>>,
    completion: Mutex<Option<Completion>>,
    release: Option<ReleaseOnce>,
}

impl ResponseFuture {
    fn new(
        opaque: i32,
        channel_id: u64,
        remote_addr: String,
        timeout: Duration,
        completion: Completion,
        release: Option<ReleaseOnce>,
    ) -> Self {
        Self {
            opaque,
            channel_id,
            remote_addr,
            timeout,
            begin: Instant::now(),
            send_state: AtomicU8::new(SEND_UNKNOWN),
            cause: Mutex::new(None),
            response: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
            release,
        }
    }

    /// Creates a future completed through a waiter, for synchronous calls.
    pub fn for_waiter(
        opaque: i32,
        channel_id: u64,
        remote_addr: impl Into<String>,
        timeout: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<Option<Command>>) {
        let (tx, rx) = oneshot::channel();
        let future = Self::new(
            opaque,
            channel_id,
            remote_addr.into(),
            timeout,
            Completion::Waiter(tx),
            None,
        );
        (Arc::new(future), rx)
    }

    /// Creates a future completed through a callback, holding `release` until done.
    pub fn for_callback(
        opaque: i32,
        channel_id: u64,
        remote_addr: impl Into<String>,
        timeout: Duration,
        callback: InvokeCallback,
        release: ReleaseOnce,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            opaque,
            channel_id,
            remote_addr.into(),
            timeout,
            Completion::Callback(callback),
            Some(release),
        ))
    }

    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the table scan may reap this entry at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.begin) >= self.timeout + EXPIRY_GRACE
    }

    pub fn set_send_request_ok(&self, ok: bool) {
        let state = if ok { SEND_OK } else { SEND_FAILED };
        self.send_state.store(state, Ordering::Release);
    }

    /// `None` while the write is still in flight.
    pub fn send_request_ok(&self) -> Option<bool> {
        match self.send_state.load(Ordering::Acquire) {
            SEND_OK => Some(true),
            SEND_FAILED => Some(false),
            _ => None,
        }
    }

    pub fn set_cause(&self, cause: impl Into<String>) {
        *self.cause.lock() = Some(cause.into());
    }

    pub fn cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }

    /// Delivers the response, or `None` when the request failed.
    ///
    /// Waiters are woken immediately. Callback futures keep the response
    /// until [`take_callback`](Self::take_callback) and [`outcome`](Self::outcome).
    pub fn put_response(&self, response: Option<Command>) {
        let mut completion = self.completion.lock();
        match completion.take() {
            Some(Completion::Waiter(tx)) => {
                let _ = tx.send(response);
            }
            Some(callback @ Completion::Callback(_)) => {
                *self.response.lock() = response;
                *completion = Some(callback);
            }
            None => {}
        }
    }

    pub fn has_callback(&self) -> bool {
        matches!(*self.completion.lock(), Some(Completion::Callback(_)))
    }

    /// Takes the callback; only the first caller gets it.
    pub fn take_callback(&self) -> Option<InvokeCallback> {
        let mut completion = self.completion.lock();
        match completion.take() {
            Some(Completion::Callback(callback)) => Some(callback),
            other => {
                *completion = other;
                None
            }
        }
    }

    /// The result handed to a callback: the stored response or the failure.
    pub fn outcome(&self) -> Result<Command, RemotingError> {
        match self.response.lock().take() {
            Some(response) => Ok(response),
            None => Err(self.failure()),
        }
    }

    /// The error for a request that completed without a response.
    pub fn failure(&self) -> RemotingError {
        if self.send_request_ok() == Some(false) {
            RemotingError::SendRequest {
                addr: self.remote_addr.clone(),
                cause: self.cause().unwrap_or_else(|| "unknown".to_string()),
            }
        } else {
            RemotingError::Timeout {
                addr: self.remote_addr.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        }
    }

    /// Returns the held permit. Returns `true` only the first time.
    pub fn release(&self) -> bool {
        self.release.as_ref().map(|r| r.release()).unwrap_or(false)
    }
}

/// Pending requests keyed by opaque.
#[derive(Clone, Default)]
pub struct ResponseTable {
    entries: Arc<DashMap<i32, Arc<ResponseFuture>>>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, future: Arc<ResponseFuture>) {
        self.entries.insert(future.opaque(), future);
    }

    /// Removes an entry. Whoever removes it owns its completion.
    pub fn remove(&self, opaque: i32) -> Option<Arc<ResponseFuture>> {
        self.entries.remove(&opaque).map(|(_, future)| future)
    }

    pub fn contains(&self, opaque: i32) -> bool {
        self.entries.contains_key(&opaque)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry past its timeout plus the grace period.
    pub fn take_expired(&self, now: Instant) -> Vec<Arc<ResponseFuture>> {
        self.take_where(|future| future.is_expired(now))
    }

    /// Removes and returns every entry issued on the given channel.
    pub fn take_by_channel(&self, channel_id: u64) -> Vec<Arc<ResponseFuture>> {
        self.take_where(|future| future.channel_id() == channel_id)
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<Arc<ResponseFuture>> {
        self.take_where(|_| true)
    }

    fn take_where(&self, predicate: impl Fn(&ResponseFuture) -> bool) -> Vec<Arc<ResponseFuture>> {
        let keys: Vec<i32> = self
            .entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}

/// Removes a pending entry when dropped.
pub(crate) struct PendingGuard<'a> {
    pub(crate) table: &'a ResponseTable,
    pub(crate) opaque: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.opaque);
    }
}
