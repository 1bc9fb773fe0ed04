//! The client-side remoting façade.

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use hmq_protocol::Command;
use hmq_remoting::{
    Channel, ChannelEventListener, InvokeCallback, RemotingCore, RemotingError, RequestProcessor, RpcHook,
    WorkerPool,
};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Sends requests to remote servers over pooled connections.
///
/// One connection is kept per address and created on first use. Requests
/// the server sends back over those connections are handled by the
/// processors registered here.
///
/// # Example
///
/// ```rust,ignore
/// use hmq_client::{ClientConfig, RemotingClient};
/// use hmq_protocol::Command;
/// use std::time::Duration;
///
/// let client = RemotingClient::new(ClientConfig::default());
/// client.start();
///
/// let response = client
///     .invoke_sync("127.0.0.1:8888", Command::request(10), Duration::from_secs(3))
///     .await?;
/// println!("{}", response);
///
/// client.shutdown();
/// ```
pub struct RemotingClient {
    config: ClientConfig,
    core: Arc<RemotingCore>,
    connections: Arc<ConnectionManager>,
    public_executor: OnceLock<Arc<WorkerPool>>,
}

impl RemotingClient {
    pub fn new(config: ClientConfig) -> Self {
        let core = RemotingCore::new(config.remoting_config());
        Self::with_core(config, core)
    }

    /// Creates a client that reports connection events to `listener`.
    pub fn with_event_listener(config: ClientConfig, listener: Arc<dyn ChannelEventListener>) -> Self {
        let core = RemotingCore::new(config.remoting_config()).with_event_listener(listener);
        Self::with_core(config, core)
    }

    fn with_core(config: ClientConfig, core: RemotingCore) -> Self {
        let core = Arc::new(core);
        let connections = ConnectionManager::new(config.clone(), core.clone());
        Self {
            config,
            core,
            connections,
            public_executor: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts the callback pool and background scans. Must be called within a Tokio runtime.
    pub fn start(&self) {
        if self.core.is_running() {
            return;
        }
        let callback_pool = WorkerPool::new(
            "ClientCallbackExecutor",
            self.config.callback_executor_threads,
            self.config.executor_queue_capacity,
        );
        self.core.set_callback_executor(callback_pool);
        self.core.start();
        tracing::info!("Remoting client started");
    }

    /// Fails pending requests and closes every connection.
    pub fn shutdown(&self) {
        self.core.shutdown();
        self.connections.shutdown();
        if let Some(pool) = self.public_executor.get() {
            pool.shutdown();
        }
        for pool in self.core.processor_table().executors() {
            pool.shutdown();
        }
        tracing::info!("Remoting client shut down");
    }

    /// Registers a processor for requests the server sends with `code`.
    ///
    /// Without an executor the processor runs on the shared public pool.
    pub fn register_processor(
        &self,
        code: i16,
        processor: Arc<dyn RequestProcessor>,
        executor: Option<Arc<WorkerPool>>,
    ) {
        let executor = executor.unwrap_or_else(|| self.public_executor());
        self.core.register_processor(code, processor, executor);
    }

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
                    "ClientPublicExecutor",
                    self.config.public_executor_threads,
                    self.config.executor_queue_capacity,
                )
            })
            .clone()
    }

    /// A live channel to `addr`; an unparsable address is a connect failure.
    async fn channel(&self, addr: &str) -> Result<Arc<Channel>, RemotingError> {
        let channel = match self.connections.get_or_create_connection(addr).await {
            Ok(channel) => channel,
            Err(RemotingError::InvalidAddress(_)) => {
                tracing::warn!("Cannot connect to invalid address '{}'", addr);
                return Err(RemotingError::Connect {
                    addr: addr.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        if !channel.is_active() {
            self.connections.close_connection(addr, &channel);
            return Err(RemotingError::Connect {
                addr: addr.to_string(),
            });
        }
        Ok(channel)
    }

    /// Sends `request` to `addr` and waits up to `timeout` for the response.
    ///
    /// Time spent connecting counts against `timeout`.
    pub async fn invoke_sync(
        &self,
        addr: &str,
        mut request: Command,
        timeout: Duration,
    ) -> Result<Command, RemotingError> {
        let begin = Instant::now();
        let channel = self.channel(addr).await?;

        self.core.do_before_rpc_hooks(addr, &mut request);
        let remaining = remaining(begin, timeout, addr)?;

        match self
            .core
            .invoke_sync_impl(&channel, request.clone(), remaining)
            .await
        {
            Ok(response) => {
                request.opaque = response.opaque;
                self.core
                    .do_after_rpc_hooks(addr, &request, Some(&response));
                Ok(response)
            }
            Err(e @ RemotingError::SendRequest { .. }) => {
                tracing::warn!("invoke_sync: send request to {} failed, closing the connection", addr);
                self.connections.close_connection(addr, &channel);
                Err(e)
            }
            Err(e @ RemotingError::Timeout { .. }) => {
                if self.config.close_socket_if_timeout {
                    self.connections.close_connection(addr, &channel);
                    tracing::warn!("invoke_sync: closed connection to {} after timeout", addr);
                }
                tracing::warn!("invoke_sync: wait response from {} timed out", addr);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends `request` to `addr`; `callback` receives the response or the failure.
    ///
    /// An `Err` return means the request was never sent and the callback
    /// will not run.
    pub async fn invoke_async(
        &self,
        addr: &str,
        mut request: Command,
        timeout: Duration,
        callback: InvokeCallback,
    ) -> Result<(), RemotingError> {
        let begin = Instant::now();
        let channel = self.channel(addr).await?;

        self.core.do_before_rpc_hooks(addr, &mut request);
        let remaining = remaining(begin, timeout, addr)?;

        let core = self.core.clone();
        let connections = self.connections.clone();
        let hook_addr = addr.to_string();
        let mut hook_request = request.clone();
        let hook_channel = channel.clone();
        let callback: InvokeCallback = Box::new(move |result| {
            match &result {
                Ok(response) => {
                    hook_request.opaque = response.opaque;
                    core.do_after_rpc_hooks(&hook_addr, &hook_request, Some(response));
                }
                Err(RemotingError::SendRequest { .. }) => {
                    connections.close_connection(&hook_addr, &hook_channel);
                }
                Err(_) => {}
            }
            callback(result);
        });

        self.core
            .invoke_async_impl(&channel, request, remaining, callback)
            .await
    }

    /// Sends `request` to `addr` without expecting a response.
    pub async fn invoke_oneway(
        &self,
        addr: &str,
        mut request: Command,
        timeout: Duration,
    ) -> Result<(), RemotingError> {
        let channel = self.channel(addr).await?;

        self.core.do_before_rpc_hooks(addr, &mut request);
        self.core.invoke_oneway_impl(&channel, request, timeout).await
    }

    /// Closes the connection to `addr`, if any.
    pub fn close_connection(&self, addr: &str) {
        self.connections.remove_connection(addr);
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.core.pending_requests()
    }

    /// Addresses with a live connection.
    pub fn connected_addresses(&self) -> Vec<String> {
        self.connections.connected_addresses()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn remaining(begin: Instant, timeout: Duration, addr: &str) -> Result<Duration, RemotingError> {
    let remaining = timeout.saturating_sub(begin.elapsed());
    if remaining.is_zero() {
        return Err(RemotingError::Timeout {
            addr: addr.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        });
    }
    Ok(remaining)
}
