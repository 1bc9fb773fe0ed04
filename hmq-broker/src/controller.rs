//! Broker lifecycle: opens the commit log and serves send-message requests.

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::processor::SendMessageProcessor;
use crate::request_code::SEND_MESSAGE;
use hmq_remoting::WorkerPool;
use hmq_server::RemotingServer;
use hmq_store::{CommitLog, MessageStore};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

/// Owns the broker's remoting server and commit log.
pub struct BrokerController {
    config: BrokerConfig,
    store: Arc<CommitLog>,
    server: RemotingServer,
    send_message_executor: OnceLock<Arc<WorkerPool>>,
}

impl BrokerController {
    /// Opens the commit log and prepares the server. Nothing listens yet.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let store = Arc::new(CommitLog::open(config.store.clone())?);
        let server = RemotingServer::new(config.server.clone());
        Ok(Self {
            config,
            store,
            server,
            send_message_executor: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Registers the processors and starts listening.
    ///
    /// Must be called within a Tokio runtime. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, BrokerError> {
        let executor = self
            .send_message_executor
            .get_or_init(|| {
                WorkerPool::new(
                    "SendMessageThread",
                    self.config.send_message_threads,
                    self.config.send_message_queue_capacity,
                )
            })
            .clone();

        let processor = Arc::new(SendMessageProcessor::new(self.store.clone()));
        self.server
            .register_processor(SEND_MESSAGE, processor.clone(), Some(executor.clone()));
        self.server
            .register_default_processor(processor, Some(executor));

        let addr = self.server.start().await?;
        tracing::info!(
            "Broker started on {}, commit log at {}",
            addr,
            self.config.store.data_dir.display()
        );
        Ok(addr)
    }

    /// Stops the server, then flushes and closes the commit log.
    pub fn shutdown(&self) -> Result<(), BrokerError> {
        self.server.shutdown();
        if let Some(executor) = self.send_message_executor.get() {
            executor.shutdown();
        }
        self.store.close()?;
        tracing::info!(
            "Broker stopped, commit log max offset {}",
            self.store.max_offset()
        );
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn server(&self) -> &RemotingServer {
        &self.server
    }

    pub fn store(&self) -> &Arc<CommitLog> {
        &self.store
    }
}
