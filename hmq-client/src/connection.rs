//! One connection per remote address, created lazily and replaced on failure.

use crate::config::ClientConfig;
use dashmap::DashMap;
use hmq_protocol::Command;
use hmq_remoting::{Channel, ChannelEventType, InboundHandler, RemotingCore, RemotingError};
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};

/// Connection progress for one address.
#[derive(Debug, Clone)]
enum ConnectState {
    Connecting,
    Ready(Arc<Channel>),
    Failed,
}

/// Table entry for one remote address.
struct ConnectionEntry {
    addr: String,
    state: watch::Receiver<ConnectState>,
}

impl ConnectionEntry {
    fn channel(&self) -> Option<Arc<Channel>> {
        match &*self.state.borrow() {
            ConnectState::Ready(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    /// Connected and still active.
    fn ready_channel(&self) -> Option<Arc<Channel>> {
        self.channel().filter(|channel| channel.is_active())
    }

    fn is_connecting(&self) -> bool {
        matches!(*self.state.borrow(), ConnectState::Connecting)
    }

    fn holds(&self, channel: &Channel) -> bool {
        self.channel().map(|c| c.id() == channel.id()).unwrap_or(false)
    }

    /// Waits for the connect attempt to settle.
    async fn wait(&self, timeout: Duration) -> Option<Arc<Channel>> {
        let mut state = self.state.clone();
        let settled = tokio::time::timeout(timeout, async {
            loop {
                if !matches!(*state.borrow(), ConnectState::Connecting) {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        if settled.is_err() {
            tracing::warn!(
                "Connect to {} did not finish within {}ms",
                self.addr,
                timeout.as_millis()
            );
        }
        self.ready_channel()
    }
}

/// Owns the client's connections, keyed by the address string callers use.
pub struct ConnectionManager {
    config: ClientConfig,
    core: Arc<RemotingCore>,
    table: DashMap<String, Arc<ConnectionEntry>>,
    lock: Mutex<()>,
    handler: Arc<ClientHandler>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, core: Arc<RemotingCore>) -> Arc<Self> {
        Arc::new_cyclic(|manager| Self {
            handler: Arc::new(ClientHandler {
                core: core.clone(),
                manager: manager.clone(),
            }),
            config,
            core,
            table: DashMap::new(),
            lock: Mutex::new(()),
        })
    }

    /// Returns a live connection to `addr`, connecting if needed.
    pub async fn get_or_create_connection(&self, addr: &str) -> Result<Arc<Channel>, RemotingError> {
        let existing = self.table.get(addr).map(|entry| entry.value().clone());
        if let Some(channel) = existing.and_then(|entry| entry.ready_channel()) {
            return Ok(channel);
        }
        self.create_connection(addr).await
    }

    async fn create_connection(&self, addr: &str) -> Result<Arc<Channel>, RemotingError> {
        validate_addr(addr)?;

        let entry = {
            let _guard = tokio::time::timeout(self.config.lock_timeout(), self.lock.lock())
                .await
                .map_err(|_| {
                    tracing::warn!(
                        "Timed out after {}ms waiting for the connection table lock",
                        self.config.lock_timeout_ms
                    );
                    RemotingError::Connect {
                        addr: addr.to_string(),
                    }
                })?;

            let existing = self.table.get(addr).map(|entry| entry.value().clone());
            match existing {
                Some(entry) if entry.ready_channel().is_some() => entry,
                Some(entry) if entry.is_connecting() => entry,
                Some(entry) => {
                    // Dead or failed: evict and dial again
                    self.table.remove(addr);
                    if let Some(channel) = entry.channel() {
                        channel.close();
                    }
                    self.dial(addr)
                }
                None => self.dial(addr),
            }
        };

        entry
            .wait(self.config.connect_timeout())
            .await
            .ok_or_else(|| RemotingError::Connect {
                addr: addr.to_string(),
            })
    }

    /// Inserts a connecting entry and starts the connect in the background.
    fn dial(&self, addr: &str) -> Arc<ConnectionEntry> {
        let (state_tx, state_rx) = watch::channel(ConnectState::Connecting);
        let entry = Arc::new(ConnectionEntry {
            addr: addr.to_string(),
            state: state_rx,
        });
        self.table.insert(addr.to_string(), entry.clone());

        let addr = addr.to_string();
        let config = self.config.clone();
        let core = self.core.clone();
        let manager = self.handler.manager.clone();
        let dialed = entry.clone();
        let handler: Arc<dyn InboundHandler> = self.handler.clone();
        tokio::spawn(async move {
            match connect(&addr, &config, handler).await {
                Ok(channel) => {
                    tracing::info!("Connected to {}", addr);
                    core.fire_event(ChannelEventType::Connect, &channel);
                    state_tx.send_replace(ConnectState::Ready(channel));
                }
                Err(e) => {
                    tracing::warn!("Connect to {} failed: {}", addr, e);
                    // Evict before waking waiters
                    if let Some(manager) = manager.upgrade() {
                        manager
                            .table
                            .remove_if(&addr, |_, entry| Arc::ptr_eq(entry, &dialed));
                    }
                    state_tx.send_replace(ConnectState::Failed);
                }
            }
        });
        entry
    }

    /// Removes the entry for `addr` if it still refers to `channel`, then closes the channel.
    pub fn close_connection(&self, addr: &str, channel: &Channel) {
        let removed = self
            .table
            .remove_if(addr, |_, entry| entry.holds(channel))
            .is_some();
        if removed {
            tracing::info!("Removed connection to {} from the table", addr);
        }
        channel.close();
    }

    /// Removes the entry for `addr` whatever it holds, closing its channel.
    pub fn remove_connection(&self, addr: &str) {
        if let Some((_, entry)) = self.table.remove(addr) {
            if let Some(channel) = entry.channel() {
                channel.close();
            }
            tracing::info!("Removed connection to {} from the table", addr);
        }
    }

    /// Removes whichever entry refers to `channel`, then closes it.
    pub fn close_channel(&self, channel: &Channel) {
        self.table.retain(|addr, entry| {
            let keep = !entry.holds(channel);
            if !keep {
                tracing::info!("Removed connection to {} from the table", addr);
            }
            keep
        });
        channel.close();
    }

    /// Closes every connection.
    pub fn shutdown(&self) {
        for entry in self.table.iter() {
            if let Some(channel) = entry.value().channel() {
                channel.close();
            }
        }
        self.table.clear();
    }

    /// Number of table entries, connecting ones included.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Addresses with a live connection.
    pub fn connected_addresses(&self) -> Vec<String> {
        self.table
            .iter()
            .filter(|entry| entry.value().ready_channel().is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Routes inbound traffic of client connections into the remoting core.
struct ClientHandler {
    core: Arc<RemotingCore>,
    manager: Weak<ConnectionManager>,
}

impl InboundHandler for ClientHandler {
    fn on_command(&self, channel: &Arc<Channel>, command: Command) {
        self.core.process_message_received(channel, command);
    }

    fn on_close(&self, channel: &Arc<Channel>) {
        tracing::debug!("Connection to {} closed", channel.remote_addr());
        if let Some(manager) = self.manager.upgrade() {
            manager.close_channel(channel);
        }
        self.core.fail_channel_requests(channel);
        self.core.fire_event(ChannelEventType::Close, channel);
    }

    fn on_exception(&self, channel: &Arc<Channel>, error: &RemotingError) {
        tracing::warn!("Connection to {} failed: {}", channel.remote_addr(), error);
        self.core.fire_event(ChannelEventType::Exception, channel);
    }
}

fn validate_addr(addr: &str) -> Result<(), RemotingError> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(RemotingError::InvalidAddress(addr.to_string())),
    }
}

async fn connect(
    addr: &str,
    config: &ClientConfig,
    handler: Arc<dyn InboundHandler>,
) -> io::Result<Arc<Channel>> {
    let connect = async {
        let socket_addr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(config.socket_send_buf_size)?;
        socket.set_recv_buffer_size(config.socket_rcv_buf_size)?;
        socket.connect(socket_addr).await
    };

    let stream: TcpStream = tokio::time::timeout(config.connect_timeout(), connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true).ok();

    Channel::spawn(stream, handler, config.max_frame_size)
}
