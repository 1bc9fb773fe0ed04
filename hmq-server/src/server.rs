//! TCP server implementation.

use crate::config::ServerConfig;
use crate::error::ServerError;
use dashmap::DashMap;
use hmq_protocol::Command;
use hmq_remoting::{
    Channel, ChannelEventListener, ChannelEventType, InboundHandler, InvokeCallback, RemotingCore,
    RemotingError, RequestProcessor, RpcHook, WorkerPool,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub idle_closed_total: AtomicU64,
}

/// Accepts connections and dispatches their requests to registered processors.
pub struct RemotingServer {
    config: ServerConfig,
    core: Arc<RemotingCore>,
    handler: Arc<ServerHandler>,
    public_executor: OnceLock<Arc<WorkerPool>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl RemotingServer {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let core = RemotingCore::new(config.remoting_config());
        Self::with_core(config, core)
    }

    /// Creates a server that reports connection events to `listener`.
    pub fn with_event_listener(config: ServerConfig, listener: Arc<dyn ChannelEventListener>) -> Self {
        let core = RemotingCore::new(config.remoting_config()).with_event_listener(listener);
        Self::with_core(config, core)
    }

    fn with_core(config: ServerConfig, core: RemotingCore) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let core = Arc::new(core);
        Self {
            handler: Arc::new(ServerHandler {
                core: core.clone(),
                channels: DashMap::new(),
                stats: ServerStats::default(),
            }),
            config,
            core,
            public_executor: OnceLock::new(),
            local_addr: Mutex::new(None),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        let callback_pool = WorkerPool::new(
            "ServerCallbackExecutor",
            self.config.callback_executor_threads,
            self.config.executor_queue_capacity,
        );
        self.core.set_callback_executor(callback_pool);
        self.core.start();

        tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.config.max_frame_size,
            self.shutdown.subscribe(),
        ));
        tokio::spawn(idle_scan(
            self.handler.clone(),
            self.config.channel_max_idle(),
            self.shutdown.subscribe(),
        ));

        tracing::info!("Remoting server listening on {}", local_addr);
        Ok(local_addr)
    }

    fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_send_buffer_size(self.config.socket_send_buf_size)?;
        socket.set_recv_buffer_size(self.config.socket_rcv_buf_size)?;
        socket
            .bind(addr)
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(socket.listen(self.config.backlog)?)
    }

    /// Stops accepting, fails pending requests and closes every connection.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Remoting server shutting down");
        let _ = self.shutdown.send(());
        self.core.shutdown();

        for channel in self.channels() {
            channel.close();
        }
        if let Some(pool) = self.public_executor.get() {
            pool.shutdown();
        }
        for pool in self.core.processor_table().executors() {
            pool.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Registers a processor for `code`.
    ///
    /// Without an executor the processor runs on the shared public pool.
    /// Must be called within a Tokio runtime.
    pub fn register_processor(
        &self,
        code: i16,
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
    ) {
        let executor = executor.unwrap_or_else(|| self.public_executor());
        self.core.register_processor(code, processor, executor);
    }

    /// Registers the processor used for codes without their own.
    pub fn register_default_processor(
        &self,
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
    ) {
        let executor = executor.unwrap_or_else(|| self.public_executor());
        self.core.register_default_processor(processor, executor);
    }

    pub fn register_rpc_hook(&self, hook: Arc<dyn RpcHook>) {
        self.core.register_rpc_hook(hook);
    }

    fn public_executor(&self) -> Arc<WorkerPool> {
        self.public_executor
            .get_or_init(|| {
                WorkerPool::new(
                    "ServerPublicExecutor",
                    self.config.public_executor_threads,
                    self.config.executor_queue_capacity,
                )
            })
            .clone()
    }

    /// Sends a request to the peer of `channel` and waits for its response.
    pub async fn invoke_sync(
        &self,
        channel: &Arc<Channel>,
        mut request: Command,
        timeout: Duration,
    ) -> Result<Command, RemotingError> {
        let addr = channel.remote_addr().to_string();
        self.core.do_before_rpc_hooks(&addr, &mut request);
        let response = self
            .core
            .invoke_sync_impl(channel, request.clone(), timeout)
            .await?;
        self.core
            .do_after_rpc_hooks(&addr, &request, Some(&response));
        Ok(response)
    }

    /// Sends a request to the peer of `channel`; `callback` receives the outcome.
    pub async fn invoke_async(
        &self,
        channel: &Arc<Channel>,
        mut request: Command,
        timeout: Duration,
        callback: InvokeCallback,
    ) -> Result<(), RemotingError> {
        let addr = channel.remote_addr().to_string();
        self.core.do_before_rpc_hooks(&addr, &mut request);
        self.core
            .invoke_async_impl(channel, request, timeout, callback)
            .await
    }

    /// Sends a request to the peer of `channel` without expecting a response.
    pub async fn invoke_oneway(
        &self,
        channel: &Arc<Channel>,
        mut request: Command,
        timeout: Duration,
    ) -> Result<(), RemotingError> {
        let addr = channel.remote_addr().to_string();
        self.core.do_before_rpc_hooks(&addr, &mut request);
        self.core.invoke_oneway_impl(channel, request, timeout).await
    }

    /// Connections currently open.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.handler
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.handler.channels.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.core.pending_requests()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.handler.stats
    }
}

impl Drop for RemotingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Routes inbound traffic of accepted connections into the remoting core.
struct ServerHandler {
    core: Arc<RemotingCore>,
    channels: DashMap<u64, Arc<Channel>>,
    stats: ServerStats,
}

impl InboundHandler for ServerHandler {
    fn on_command(&self, channel: &Arc<Channel>, command: Command) {
        if !command.is_response() {
            self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        }
        self.core.process_message_received(channel, command);
    }

    fn on_close(&self, channel: &Arc<Channel>) {
        if self.channels.remove(&channel.id()).is_some() {
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
        self.core.fail_channel_requests(channel);
        self.core.fire_event(ChannelEventType::Close, channel);
        tracing::info!("Client disconnected: {}", channel.remote_addr());
    }

    fn on_exception(&self, channel: &Arc<Channel>, error: &RemotingError) {
        tracing::warn!("Connection {} failed: {}", channel.remote_addr(), error);
        self.core.fire_event(ChannelEventType::Exception, channel);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ServerHandler>,
    max_frame_size: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        stream.set_nodelay(true).ok();
                        let inbound: Arc<dyn InboundHandler> = handler.clone();
                        match Channel::spawn(stream, inbound, max_frame_size) {
                            Ok(channel) => {
                                tracing::info!("Client connected: {}", addr);
                                handler.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                                handler.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                                handler.channels.insert(channel.id(), channel.clone());
                                if !channel.is_active() && handler.channels.remove(&channel.id()).is_some() {
                                    // Closed before it was tracked
                                    handler.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                    continue;
                                }
                                handler.core.fire_event(ChannelEventType::Connect, &channel);
                            }
                            Err(e) => tracing::warn!("Failed to set up connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Accept loop stopped");
                break;
            }
        }
    }
}

/// Closes connections that have seen no traffic for `max_idle`.
async fn idle_scan(
    handler: Arc<ServerHandler>,
    max_idle: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = (max_idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle: Vec<Arc<Channel>> = handler
                    .channels
                    .iter()
                    .filter(|entry| entry.value().idle_time() >= max_idle)
                    .map(|entry| entry.value().clone())
                    .collect();
                for channel in idle {
                    tracing::warn!(
                        "Connection {} idle for {}ms, closing",
                        channel.remote_addr(),
                        channel.idle_time().as_millis()
                    );
                    handler.stats.idle_closed_total.fetch_add(1, Ordering::Relaxed);
                    handler.core.fire_event(ChannelEventType::Idle, &channel);
                    channel.close();
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
