//! The correlation engine and request dispatch shared by client and server.

use crate::channel::Channel;
use crate::error::RemotingError;
use crate::event::{ChannelEvent, ChannelEventExecutor, ChannelEventListener, ChannelEventType};
use crate::executor::{Job, Rejected, WorkerPool};
use crate::hook::RpcHook;
use crate::processor::{DispatchEntry, ProcessorTable, RequestContext, RequestProcessor};
use crate::release::ReleaseOnce;
use crate::response::{InvokeCallback, PendingGuard, ResponseFuture, ResponseTable};
use hmq_protocol::{Command, CommandType, ResponseCode, MAX_FRAME_SIZE};
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};

/// Default number of in-flight asynchronous requests.
pub const DEFAULT_ASYNC_PERMITS: usize = 65535;

/// Default number of in-flight oneway requests.
pub const DEFAULT_ONEWAY_PERMITS: usize = 65535;

/// How often the response table is scanned for expired entries.
pub const RESPONSE_SCAN_PERIOD: Duration = Duration::from_secs(1);

const REJECT_REQUEST_REMARK: &str = "[REJECTREQUEST]system busy, start flow control for a while";
const OVERLOAD_REMARK: &str = "[OVERLOAD]system busy, start flow control for a while";

/// Limits applied by a remoting instance.
#[derive(Debug, Clone)]
pub struct RemotingConfig {
    pub async_permits: usize,
    pub oneway_permits: usize,
    pub max_frame_size: u32,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            async_permits: DEFAULT_ASYNC_PERMITS,
            oneway_permits: DEFAULT_ONEWAY_PERMITS,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Request/response machinery for one endpoint.
///
/// Owns the pending-request table, the processor table, RPC hooks and the
/// permits bounding asynchronous and oneway traffic.
pub struct RemotingCore {
    config: RemotingConfig,
    response_table: ResponseTable,
    processors: ProcessorTable,
    rpc_hooks: RwLock<Vec<Arc<dyn RpcHook>>>,
    async_permits: Arc<Semaphore>,
    oneway_permits: Arc<Semaphore>,
    callback_executor: RwLock<Option<Arc<WorkerPool>>>,
    events: Option<ChannelEventExecutor>,
    next_opaque: AtomicI32,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl RemotingCore {
    pub fn new(config: RemotingConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            async_permits: Arc::new(Semaphore::new(config.async_permits)),
            oneway_permits: Arc::new(Semaphore::new(config.oneway_permits)),
            config,
            response_table: ResponseTable::new(),
            processors: ProcessorTable::new(),
            rpc_hooks: RwLock::new(Vec::new()),
            callback_executor: RwLock::new(None),
            events: None,
            next_opaque: AtomicI32::new(0),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Delivers channel events to `listener`.
    pub fn with_event_listener(mut self, listener: Arc<dyn ChannelEventListener>) -> Self {
        self.events = Some(ChannelEventExecutor::new(listener));
        self
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    /// Starts the event executor and the response table scan.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = &self.events {
            events.start(self.shutdown.subscribe());
        }

        let core = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + RESPONSE_SCAN_PERIOD;
            let mut ticker = tokio::time::interval_at(start, RESPONSE_SCAN_PERIOD);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match core.upgrade() {
                        Some(core) => core.scan_response_table(),
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!("Response table scan stopped");
        });
    }

    /// Stops background tasks and fails every pending request.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        self.async_permits.close();
        self.oneway_permits.close();

        for future in self.response_table.drain() {
            future.set_send_request_ok(false);
            future.set_cause("remoting service shut down");
            self.complete_without_response(&future);
        }
        if let Some(pool) = self.callback_executor.read().as_ref() {
            pool.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_callback_executor(&self, executor: Arc<WorkerPool>) {
        *self.callback_executor.write() = Some(executor);
    }

    pub fn callback_executor(&self) -> Option<Arc<WorkerPool>> {
        self.callback_executor.read().clone()
    }

    pub fn register_processor(
        &self,
        code: i16,
        processor: Arc<dyn RequestProcessor>,
        executor: Arc<WorkerPool>,
    ) {
        self.processors
            .register(code, DispatchEntry::new(processor, executor));
    }

    pub fn register_default_processor(
        &self,
        processor: Arc<dyn RequestProcessor>,
        executor: Arc<WorkerPool>,
    ) {
        self.processors
            .register_default(DispatchEntry::new(processor, executor));
    }

    pub fn processor_table(&self) -> &ProcessorTable {
        &self.processors
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.rpc_hooks.write().push(hook);
    }

    pub fn do_before_rpc_hooks(&self, remote_addr: &str, request: &mut Command) {
        for hook in self.rpc_hooks.read().iter() {
            hook.do_before_request(remote_addr, request);
        }
    }

    pub fn do_after_rpc_hooks(&self, remote_addr: &str, request: &Command, response: Option<&Command>) {
        for hook in self.rpc_hooks.read().iter() {
            hook.do_after_response(remote_addr, request, response);
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.response_table.len()
    }

    /// Queues a lifecycle event for the listener, if one is registered.
    pub fn fire_event(&self, event_type: ChannelEventType, channel: &Arc<Channel>) {
        if let Some(events) = &self.events {
            events.put_event(ChannelEvent::new(event_type, channel));
        }
    }

    fn next_opaque(&self) -> i32 {
        self.next_opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Routes an inbound command by its type.
    pub fn process_message_received(self: &Arc<Self>, channel: &Arc<Channel>, command: Command) {
        match command.command_type() {
            CommandType::Request => self.process_request_command(channel, command),
            CommandType::Response => self.process_response_command(channel, command),
        }
    }

    /// Dispatches a request to its processor on the processor's pool.
    pub fn process_request_command(self: &Arc<Self>, channel: &Arc<Channel>, request: Command) {
        let Some(entry) = self.processors.lookup(request.code) else {
            let remark = format!(" request type {} not supported", request.code);
            tracing::warn!("{} {}", channel.remote_addr(), remark);
            let response = Command::response(ResponseCode::RequestCodeNotSupported, remark);
            self.reply(channel, &request, response);
            return;
        };

        if entry.processor.reject_request() {
            let response = Command::response(ResponseCode::SystemBusy, REJECT_REQUEST_REMARK);
            self.reply(channel, &request, response);
            return;
        }

        let opaque = request.opaque;
        let oneway = request.is_oneway();
        let core = self.clone();
        let job_channel = channel.clone();
        let processor = entry.processor.clone();
        let job: Job = Box::new(move || core.run_processor(processor.as_ref(), &job_channel, request));

        if let Err(Rejected(_)) = entry.executor.execute(job) {
            tracing::warn!(
                "{} rejected request from {}, pool is saturated",
                entry.executor.name(),
                channel.remote_addr()
            );
            if !oneway {
                let response = Command::response(ResponseCode::SystemBusy, OVERLOAD_REMARK)
                    .with_opaque(opaque);
                self.write_response(channel, response);
            }
        }
    }

    fn run_processor(&self, processor: &dyn RequestProcessor, channel: &Arc<Channel>, mut request: Command) {
        let remote_addr = channel.remote_addr().to_string();
        self.do_before_rpc_hooks(&remote_addr, &mut request);

        let ctx = RequestContext::new(channel.clone());
        match processor.process_request(&ctx, &request) {
            Ok(response) => {
                self.do_after_rpc_hooks(&remote_addr, &request, response.as_ref());
                if let Some(response) = response {
                    self.reply(channel, &request, response);
                }
            }
            Err(e) => {
                tracing::error!("Process request {} from {} failed: {}", request, remote_addr, e);
                self.do_after_rpc_hooks(&remote_addr, &request, None);
            }
        }
    }

    /// Writes a response to `request` unless it was oneway.
    fn reply(&self, channel: &Channel, request: &Command, mut response: Command) {
        if request.is_oneway() {
            return;
        }
        response.opaque = request.opaque;
        response.mark_response();
        self.write_response(channel, response);
    }

    fn write_response(&self, channel: &Channel, response: Command) {
        if let Err(e) = channel.write_command(&response) {
            tracing::error!("Failed to encode response {}: {}", response, e);
            let fallback = Command::response(ResponseCode::SystemError, e.to_string())
                .with_opaque(response.opaque);
            let _ = channel.write_command(&fallback);
        }
    }

    /// Completes the pending request matching the response's opaque.
    pub fn process_response_command(&self, channel: &Arc<Channel>, response: Command) {
        let opaque = response.opaque;
        match self.response_table.remove(opaque) {
            Some(future) => {
                future.put_response(Some(response));
                future.release();
                self.execute_invoke_callback(&future);
            }
            None => {
                tracing::warn!(
                    "Received response from {} matching no request: {}",
                    channel.remote_addr(),
                    response
                );
            }
        }
    }

    /// Runs a callback future's callback on the callback pool, falling back to
    /// the current thread when the pool is absent or saturated.
    fn execute_invoke_callback(&self, future: &ResponseFuture) {
        let Some(callback) = future.take_callback() else {
            return;
        };
        let outcome = future.outcome();
        let job: Job = Box::new(move || callback(outcome));

        let job = match self.callback_executor() {
            Some(pool) => match pool.execute(job) {
                Ok(()) => return,
                Err(Rejected(job)) => {
                    tracing::warn!("Callback pool busy, running callback in the current thread");
                    job
                }
            },
            None => job,
        };
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!("Invoke callback panicked");
        }
    }

    fn complete_without_response(&self, future: &ResponseFuture) {
        future.put_response(None);
        future.release();
        self.execute_invoke_callback(future);
    }

    /// Reaps entries whose deadline passed without a response.
    pub fn scan_response_table(&self) {
        for future in self.response_table.take_expired(Instant::now()) {
            tracing::warn!(
                "Removed timed out request {} to {}",
                future.opaque(),
                future.remote_addr()
            );
            self.complete_without_response(&future);
        }
    }

    /// Fails every pending request issued on a channel that just closed.
    pub fn fail_channel_requests(&self, channel: &Channel) {
        for future in self.response_table.take_by_channel(channel.id()) {
            future.set_send_request_ok(false);
            future.set_cause("connection closed");
            self.complete_without_response(&future);
        }
    }

    /// Sends a request and waits for its response.
    pub async fn invoke_sync_impl(
        &self,
        channel: &Arc<Channel>,
        mut request: Command,
        timeout: Duration,
    ) -> Result<Command, RemotingError> {
        let opaque = self.next_opaque();
        request.opaque = opaque;
        let addr = channel.remote_addr().to_string();

        let (future, waiter) = ResponseFuture::for_waiter(opaque, channel.id(), addr.clone(), timeout);
        self.response_table.insert(future.clone());
        let _guard = PendingGuard {
            table: &self.response_table,
            opaque,
        };

        let completion = channel.write_command(&request)?;
        {
            let future = future.clone();
            let table = self.response_table.clone();
            tokio::spawn(async move {
                match completion.wait().await {
                    Ok(()) => future.set_send_request_ok(true),
                    Err(cause) => {
                        tracing::warn!("Send request {} to <{}> failed: {}", opaque, addr, cause);
                        future.set_send_request_ok(false);
                        future.set_cause(cause);
                        if table.remove(opaque).is_some() {
                            future.put_response(None);
                        }
                    }
                }
            });
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(Some(response))) => Ok(response),
            _ => Err(future.failure()),
        }
    }

    /// Sends a request whose response is delivered to `callback`.
    pub async fn invoke_async_impl(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        mut request: Command,
        timeout: Duration,
        callback: InvokeCallback,
    ) -> Result<(), RemotingError> {
        let begin = Instant::now();
        let permit = self.acquire(&self.async_permits, timeout, "async").await?;
        let release = ReleaseOnce::new(permit);

        let remaining = timeout.saturating_sub(begin.elapsed());
        if remaining.is_zero() {
            release.release();
            return Err(RemotingError::Timeout {
                addr: channel.remote_addr().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let opaque = self.next_opaque();
        request.opaque = opaque;
        let addr = channel.remote_addr().to_string();
        let future = ResponseFuture::for_callback(
            opaque,
            channel.id(),
            addr.clone(),
            remaining,
            callback,
            release,
        );
        self.response_table.insert(future.clone());

        let completion = match channel.write_command(&request) {
            Ok(completion) => completion,
            Err(e) => {
                self.response_table.remove(opaque);
                future.release();
                return Err(e);
            }
        };

        let core = self.clone();
        tokio::spawn(async move {
            match completion.wait().await {
                Ok(()) => future.set_send_request_ok(true),
                Err(cause) => {
                    tracing::warn!("Send request {} to <{}> failed: {}", opaque, addr, cause);
                    future.set_send_request_ok(false);
                    future.set_cause(cause);
                    if core.response_table.remove(opaque).is_some() {
                        core.complete_without_response(&future);
                    }
                }
            }
        });
        Ok(())
    }

    /// Sends a request that expects no response.
    pub async fn invoke_oneway_impl(
        &self,
        channel: &Arc<Channel>,
        mut request: Command,
        timeout: Duration,
    ) -> Result<(), RemotingError> {
        request.mark_oneway();
        request.opaque = self.next_opaque();

        let permit = self.acquire(&self.oneway_permits, timeout, "oneway").await?;
        let release = ReleaseOnce::new(permit);
        let completion = channel.write_command(&request)?;

        let addr = channel.remote_addr().to_string();
        tokio::spawn(async move {
            if let Err(cause) = completion.wait().await {
                tracing::warn!("Send oneway request to <{}> failed: {}", addr, cause);
            }
            release.release();
        });
        Ok(())
    }

    async fn acquire(
        &self,
        semaphore: &Arc<Semaphore>,
        timeout: Duration,
        kind: &str,
    ) -> Result<OwnedSemaphorePermit, RemotingError> {
        match tokio::time::timeout(timeout, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(RemotingError::ShuttingDown),
            Err(_) => Err(RemotingError::TooManyRequests(format!(
                "{} permit not acquired within {}ms, {} available",
                kind,
                timeout.as_millis(),
                semaphore.available_permits()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::connected_pair;
    use crate::channel::InboundHandler;
    use crate::processor::ProcessorError;
    use crate::response::EXPIRY_GRACE;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::JoinSet;

    struct Endpoint(Arc<RemotingCore>);

    impl InboundHandler for Endpoint {
        fn on_command(&self, channel: &Arc<Channel>, command: Command) {
            self.0.process_message_received(channel, command);
        }

        fn on_close(&self, channel: &Arc<Channel>) {
            self.0.fail_channel_requests(channel);
            self.0.fire_event(ChannelEventType::Close, channel);
        }
    }

    struct Echo;

    impl RequestProcessor for Echo {
        fn process_request(
            &self,
            _ctx: &RequestContext,
            request: &Command,
        ) -> Result<Option<Command>, ProcessorError> {
            Ok(Some(
                Command::response(ResponseCode::Success, "").with_body(request.body.clone()),
            ))
        }
    }

    /// Sleeps before answering.
    struct Slow(Duration);

    impl RequestProcessor for Slow {
        fn process_request(
            &self,
            _ctx: &RequestContext,
            _request: &Command,
        ) -> Result<Option<Command>, ProcessorError> {
            std::thread::sleep(self.0);
            Ok(Some(Command::response(ResponseCode::Success, "")))
        }
    }

    fn silent(_: &RequestContext, _: &Command) -> Result<Option<Command>, ProcessorError> {
        Ok(None)
    }

    fn failing(_: &RequestContext, _: &Command) -> Result<Option<Command>, ProcessorError> {
        Err("disk on fire".into())
    }

    struct Setup {
        client: Arc<RemotingCore>,
        server: Arc<RemotingCore>,
        client_ch: Arc<Channel>,
        server_ch: Arc<Channel>,
        pool: Arc<WorkerPool>,
    }

    async fn setup() -> Setup {
        let client = Arc::new(RemotingCore::new(RemotingConfig::default()));
        let server = Arc::new(RemotingCore::new(RemotingConfig::default()));
        client.start();
        server.start();
        let (client_ch, server_ch) = connected_pair(
            Arc::new(Endpoint(client.clone())),
            Arc::new(Endpoint(server.clone())),
        )
        .await;
        Setup {
            client,
            server,
            client_ch,
            server_ch,
            pool: WorkerPool::new("test", 4, 1024),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn test_happy_path() {
        let s = setup().await;
        s.server.register_processor(10, Arc::new(Echo), s.pool.clone());

        let request = Command::request(10).with_body(&b"ping"[..]);
        let response = s
            .client
            .invoke_sync_impl(&s.client_ch, request, TIMEOUT)
            .await
            .unwrap();

        assert!(response.is_response());
        assert_eq!(response.code, ResponseCode::Success.code());
        assert_eq!(response.body.as_ref(), b"ping");
        assert_eq!(s.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_code_not_supported() {
        let s = setup().await;
        let response = s
            .client
            .invoke_sync_impl(&s.client_ch, Command::request(99), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(
            response.response_code(),
            Some(ResponseCode::RequestCodeNotSupported)
        );
        assert_eq!(
            response.remark.as_deref(),
            Some(" request type 99 not supported")
        );
    }

    #[tokio::test]
    async fn test_default_processor() {
        let s = setup().await;
        s.server.register_default_processor(Arc::new(Echo), s.pool.clone());

        let response = s
            .client
            .invoke_sync_impl(&s.client_ch, Command::request(1234), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response.response_code(), Some(ResponseCode::Success));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_entry() {
        let s = setup().await;
        s.server
            .register_processor(10, Arc::new(Slow(Duration::from_millis(400))), s.pool.clone());

        let started = Instant::now();
        let result = s
            .client
            .invoke_sync_impl(&s.client_ch, Command::request(10), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(RemotingError::Timeout { timeout_ms: 100, .. })));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(s.client.pending_requests(), 0);

        // The late response is dropped without disturbing later calls
        tokio::time::sleep(Duration::from_millis(500)).await;
        s.server.register_processor(11, Arc::new(Echo), s.pool.clone());
        let response = s
            .client
            .invoke_sync_impl(&s.client_ch, Command::request(11), TIMEOUT)
            .await;
        tokio_test::assert_ok!(response);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_match_by_opaque() {
        let s = setup().await;
        let seen = Arc::new(Mutex::new(HashSet::new()));
        {
            let seen = seen.clone();
            let processor = move |_: &RequestContext, request: &Command| -> Result<Option<Command>, ProcessorError> {
                seen.lock().insert(request.opaque);
                // Uneven delays so responses come back out of order
                let delay = request.body.last().copied().unwrap_or(0) % 5;
                std::thread::sleep(Duration::from_millis(delay as u64));
                Ok(Some(
                    Command::response(ResponseCode::Success, "").with_body(request.body.clone()),
                ))
            };
            s.server.register_processor(10, Arc::new(processor), s.pool.clone());
        }

        let mut tasks = JoinSet::new();
        for i in 0..200u32 {
            let client = s.client.clone();
            let channel = s.client_ch.clone();
            tasks.spawn(async move {
                let body = i.to_be_bytes().to_vec();
                let request = Command::request(10).with_body(body.clone());
                let response = client.invoke_sync_impl(&channel, request, TIMEOUT).await.unwrap();
                assert_eq!(response.body.as_ref(), body.as_slice());
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert_eq!(seen.lock().len(), 200);
        assert_eq!(s.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_invoke_async_delivers_response() {
        let s = setup().await;
        s.server.register_processor(10, Arc::new(Echo), s.pool.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        s.client
            .invoke_async_impl(
                &s.client_ch,
                Command::request(10).with_body(&b"async"[..]),
                TIMEOUT,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .await
            .unwrap();

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.body.as_ref(), b"async");
        assert_eq!(s.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_invoke_async_timeout_is_reaped() {
        let s = setup().await;
        s.server.register_processor(10, Arc::new(silent), s.pool.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        s.client
            .invoke_async_impl(
                &s.client_ch,
                Command::request(10),
                Duration::from_millis(100),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .await
            .unwrap();
        assert_eq!(s.client.pending_requests(), 1);

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RemotingError::Timeout { .. })));
        assert_eq!(s.client.pending_requests(), 0);
        assert_eq!(s.client.async_permits.available_permits(), DEFAULT_ASYNC_PERMITS);
    }

    #[tokio::test]
    async fn test_async_permits_exhausted() {
        let client = Arc::new(RemotingCore::new(RemotingConfig {
            async_permits: 1,
            ..RemotingConfig::default()
        }));
        let server = Arc::new(RemotingCore::new(RemotingConfig::default()));
        let pool = WorkerPool::new("test", 1, 16);
        server.register_processor(10, Arc::new(silent), pool);
        let (client_ch, _server_ch) = connected_pair(
            Arc::new(Endpoint(client.clone())),
            Arc::new(Endpoint(server.clone())),
        )
        .await;

        client
            .invoke_async_impl(&client_ch, Command::request(10), TIMEOUT, Box::new(|_| {}))
            .await
            .unwrap();
        let result = client
            .invoke_async_impl(
                &client_ch,
                Command::request(10),
                Duration::from_millis(50),
                Box::new(|_| {}),
            )
            .await;
        assert!(matches!(result, Err(RemotingError::TooManyRequests(_))));
    }

    #[tokio::test]
    async fn test_oneway_gets_no_response() {
        let s = setup().await;
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            let processor = move |_: &RequestContext, request: &Command| -> Result<Option<Command>, ProcessorError> {
                assert!(request.is_oneway());
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Command::response(ResponseCode::Success, "")))
            };
            s.server.register_processor(10, Arc::new(processor), s.pool.clone());
        }

        s.client
            .invoke_oneway_impl(&s.client_ch, Command::request(10), TIMEOUT)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(s.client.pending_requests(), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while s.client.oneway_permits.available_permits() != DEFAULT_ONEWAY_PERMITS {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_reject_request() {
        struct Rejecting;

        impl RequestProcessor for Rejecting {
            fn process_request(
                &self,
                _ctx: &RequestContext,
                _request: &Command,
            ) -> Result<Option<Command>, ProcessorError> {
                unreachable!("rejected requests are never processed")
            }

            fn reject_request(&self) -> bool {
                true
            }
        }

        let s = setup().await;
        s.server.register_processor(10, Arc::new(Rejecting), s.pool.clone());
        let response = s
            .client
            .invoke_sync_impl(&s.client_ch, Command::request(10), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response.response_code(), Some(ResponseCode::SystemBusy));
        assert!(response.remark.unwrap().starts_with("[REJECTREQUEST]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overload_returns_system_busy_quickly() {
        let s = setup().await;
        let tiny = WorkerPool::new("tiny", 1, 1);
        s.server
            .register_processor(10, Arc::new(Slow(Duration::from_millis(800))), tiny);

        let mut tasks = JoinSet::new();
        for _ in 0..4 {
            let client = s.client.clone();
            let channel = s.client_ch.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let response = client
                    .invoke_sync_impl(&channel, Command::request(10), TIMEOUT)
                    .await
                    .unwrap();
                (response, started.elapsed())
            });
        }

        let mut busy = 0;
        while let Some(result) = tasks.join_next().await {
            let (response, elapsed) = result.unwrap();
            if response.response_code() == Some(ResponseCode::SystemBusy) {
                assert!(response.remark.unwrap().starts_with("[OVERLOAD]"));
                assert!(elapsed < Duration::from_millis(800));
                busy += 1;
            }
        }
        assert!(busy >= 1);
    }

    #[tokio::test]
    async fn test_processor_error_sends_no_response() {
        let s = setup().await;
        s.server.register_processor(10, Arc::new(failing), s.pool.clone());
        let result = s
            .client
            .invoke_sync_impl(&s.client_ch, Command::request(10), Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(RemotingError::Timeout { timeout_ms: 300, .. })));
        assert_eq!(s.client.pending_requests(), 0);
    }

    #[test]
    fn test_release_paths_race_releases_once() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let _enter = rt.enter();
        let client = Arc::new(RemotingCore::new(RemotingConfig {
            async_permits: 1,
            ..RemotingConfig::default()
        }));
        let server = Arc::new(RemotingCore::new(RemotingConfig::default()));
        server.register_processor(10, Arc::new(silent), WorkerPool::new("test", 1, 16));
        let (client_ch, _server_ch) = rt.block_on(connected_pair(
            Arc::new(Endpoint(client.clone())),
            Arc::new(Endpoint(server.clone())),
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let opaque = client.next_opaque.load(Ordering::SeqCst);
        {
            let calls = calls.clone();
            rt.block_on(client.invoke_async_impl(
                &client_ch,
                Command::request(10),
                Duration::from_millis(1),
                Box::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            ))
            .unwrap();
        }
        assert_eq!(client.async_permits.available_permits(), 0);
        std::thread::sleep(EXPIRY_GRACE + Duration::from_millis(100));

        let barrier = Arc::new(std::sync::Barrier::new(3));
        let mut threads = Vec::new();
        for path in 0..3 {
            let client = client.clone();
            let channel = client_ch.clone();
            let barrier = barrier.clone();
            threads.push(std::thread::spawn(move || {
                barrier.wait();
                match path {
                    0 => {
                        let mut response = Command::response(ResponseCode::Success, "");
                        response.opaque = opaque;
                        client.process_response_command(&channel, response);
                    }
                    1 => client.fail_channel_requests(&channel),
                    _ => client.scan_response_table(),
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.async_permits.available_permits(), 1);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_channel_close_fails_pending_requests() {
        let s = setup().await;
        s.server.register_processor(10, Arc::new(silent), s.pool.clone());

        let client = s.client.clone();
        let channel = s.client_ch.clone();
        let call = tokio::spawn(async move {
            client
                .invoke_sync_impl(&channel, Command::request(10), Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        s.server_ch.close();

        let result = tokio::time::timeout(Duration::from_secs(3), call)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(RemotingError::SendRequest { cause, .. }) => assert_eq!(cause, "connection closed"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(s.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_server_hooks_wrap_processing() {
        #[derive(Default)]
        struct Counting {
            before: AtomicUsize,
            after: AtomicUsize,
        }

        impl RpcHook for Counting {
            fn do_before_request(&self, _remote_addr: &str, request: &mut Command) {
                self.before.fetch_add(1, Ordering::SeqCst);
                request.ext_fields.insert("hooked".to_string(), "yes".to_string());
            }

            fn do_after_response(&self, _remote_addr: &str, request: &Command, response: Option<&Command>) {
                assert_eq!(request.ext_fields.get("hooked").map(String::as_str), Some("yes"));
                assert!(response.is_some());
                self.after.fetch_add(1, Ordering::SeqCst);
            }
        }

        let s = setup().await;
        let hook = Arc::new(Counting::default());
        s.server.register_rpc_hook(hook.clone());
        s.server.register_processor(10, Arc::new(Echo), s.pool.clone());

        s.client
            .invoke_sync_impl(&s.client_ch, Command::request(10), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(hook.before.load(Ordering::SeqCst), 1);
        assert_eq!(hook.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_event_delivered() {
        #[derive(Default)]
        struct Listener {
            closed: AtomicUsize,
        }

        impl ChannelEventListener for Listener {
            fn on_channel_close(&self, _remote_addr: &str, _channel: &Arc<Channel>) {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let listener = Arc::new(Listener::default());
        let client = Arc::new(
            RemotingCore::new(RemotingConfig::default()).with_event_listener(listener.clone()),
        );
        client.start();
        let server = Arc::new(RemotingCore::new(RemotingConfig::default()));
        let (client_ch, _server_ch) = connected_pair(
            Arc::new(Endpoint(client.clone())),
            Arc::new(Endpoint(server.clone())),
        )
        .await;

        client_ch.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while listener.closed.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_callbacks() {
        let s = setup().await;
        s.server.register_processor(10, Arc::new(silent), s.pool.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        s.client
            .invoke_async_impl(
                &s.client_ch,
                Command::request(10),
                Duration::from_secs(30),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .await
            .unwrap();

        s.client.shutdown();
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RemotingError::SendRequest { .. })));

        let after = s
            .client
            .invoke_async_impl(&s.client_ch, Command::request(10), TIMEOUT, Box::new(|_| {}))
            .await;
        assert!(matches!(after, Err(RemotingError::ShuttingDown)));
    }
}
