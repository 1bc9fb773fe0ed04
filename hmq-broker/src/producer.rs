//! Message producer.

use crate::error::BrokerError;
use crate::header::{SendMessageRequestHeader, SendMessageResponseHeader};
use crate::message::{properties_to_string, Message};
use crate::request_code::SEND_MESSAGE;
use hmq_client::{ClientConfig, RemotingClient};
use hmq_protocol::{Command, ResponseCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default timeout for a single send, in milliseconds.
pub const DEFAULT_SEND_MSG_TIMEOUT_MS: u64 = 3000;

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub msg_id: String,
    pub queue_offset: Option<i64>,
}

/// Receives the outcome of [`Producer::send_async`].
pub type SendCallback = Box<dyn FnOnce(Result<SendResult, BrokerError>) + Send + 'static>;

/// Sends messages to a single broker.
pub struct Producer {
    broker_addr: String,
    send_msg_timeout: Duration,
    client: RemotingClient,
    started: AtomicBool,
}

impl Producer {
    pub fn new(broker_addr: impl Into<String>) -> Self {
        Self::with_client_config(broker_addr, ClientConfig::from_env())
    }

    pub fn with_client_config(broker_addr: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            send_msg_timeout: Duration::from_millis(DEFAULT_SEND_MSG_TIMEOUT_MS),
            client: RemotingClient::new(config),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_send_msg_timeout(mut self, timeout: Duration) -> Self {
        self.send_msg_timeout = timeout;
        self
    }

    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

    /// Starts the underlying client. Must be called within a Tokio runtime.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.client.start();
        }
    }

    pub fn shutdown(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.client.shutdown();
        }
    }

    /// Sends a message and waits for the broker to store it.
    pub async fn send(&self, message: &Message) -> Result<SendResult, BrokerError> {
        self.ensure_started()?;
        let response = self
            .client
            .invoke_sync(&self.broker_addr, build_request(message), self.send_msg_timeout)
            .await?;
        process_send_response(&response)
    }

    /// Sends a message; `callback` receives the broker's answer or the failure.
    ///
    /// An `Err` return means the message was never sent and the callback
    /// will not run.
    pub async fn send_async(&self, message: &Message, callback: SendCallback) -> Result<(), BrokerError> {
        self.ensure_started()?;
        self.client
            .invoke_async(
                &self.broker_addr,
                build_request(message),
                self.send_msg_timeout,
                Box::new(move |result| {
                    callback(
                        result
                            .map_err(BrokerError::from)
                            .and_then(|response| process_send_response(&response)),
                    )
                }),
            )
            .await?;
        Ok(())
    }

    /// Sends a message without waiting for the broker.
    pub async fn send_oneway(&self, message: &Message) -> Result<(), BrokerError> {
        self.ensure_started()?;
        self.client
            .invoke_oneway(&self.broker_addr, build_request(message), self.send_msg_timeout)
            .await?;
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), BrokerError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotStarted("producer"))
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_request(message: &Message) -> Command {
    let properties = properties_to_string(&message.properties);
    let header = SendMessageRequestHeader {
        topic: message.topic.clone(),
        properties: (!properties.is_empty()).then_some(properties),
        born_timestamp: chrono::Utc::now().timestamp_millis(),
    };
    Command::request_with_header(SEND_MESSAGE, &header).with_body(message.body.clone())
}

fn process_send_response(response: &Command) -> Result<SendResult, BrokerError> {
    if response.response_code() != Some(ResponseCode::Success) {
        return Err(BrokerError::Broker {
            code: response.code,
            remark: response.remark.clone().unwrap_or_default(),
        });
    }
    let header: SendMessageResponseHeader = response.decode_header()?;
    Ok(SendResult {
        msg_id: header.msg_id,
        queue_offset: header.queue_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::string_to_properties;
    use crate::processor::SendMessageProcessor;
    use hmq_server::{RemotingServer, ServerConfig};
    use hmq_store::{parse_msg_id, CommitLog, MessageStore, StoreConfig};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn broker() -> (TempDir, Arc<CommitLog>, RemotingServer) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CommitLog::open(StoreConfig::new(dir.path())).unwrap());
        let server = RemotingServer::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        server.register_processor(
            SEND_MESSAGE,
            Arc::new(SendMessageProcessor::new(store.clone())),
            None,
        );
        server.start().await.unwrap();
        (dir, store, server)
    }

    fn producer(server: &RemotingServer) -> Producer {
        let addr = server.local_addr().unwrap().to_string();
        let producer = Producer::new(addr);
        producer.start();
        producer
    }

    async fn wait_for(f: impl Fn() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met");
    }

    #[test]
    fn test_build_request() {
        let message = Message::new("orders", "hello").with_tags("tagA");
        let request = build_request(&message);
        assert_eq!(request.code, SEND_MESSAGE);
        assert_eq!(&request.body[..], b"hello");

        let header: SendMessageRequestHeader = request.decode_header().unwrap();
        assert_eq!(header.topic, "orders");
        assert!(header.born_timestamp > 0);
        let properties = string_to_properties(&header.properties.unwrap());
        assert_eq!(properties.get("TAGS").map(String::as_str), Some("tagA"));

        let bare = build_request(&Message::new("orders", "x"));
        assert!(!bare.ext_fields.contains_key("properties"));
    }

    #[test]
    fn test_failed_response() {
        let response = Command::response(ResponseCode::SystemBusy, "[OVERLOAD]system busy");
        match process_send_response(&response) {
            Err(BrokerError::Broker { code, remark }) => {
                assert_eq!(code, 2);
                assert_eq!(remark, "[OVERLOAD]system busy");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_started() {
        let producer = Producer::new("127.0.0.1:1");
        let err = producer.send(&Message::new("t", "x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotStarted(_)));
    }

    #[tokio::test]
    async fn test_send_sync() {
        let (_dir, store, server) = broker().await;
        let producer = producer(&server);

        let first = producer.send(&Message::new("orders", "a")).await.unwrap();
        let second = producer.send(&Message::new("orders", "b")).await.unwrap();
        assert_eq!(first.queue_offset, Some(0));
        assert_eq!(second.queue_offset, Some(1));
        assert!(parse_msg_id(&second.msg_id).unwrap() > parse_msg_id(&first.msg_id).unwrap());
        assert_eq!(store.stats().messages_written, 2);

        producer.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_async() {
        let (_dir, store, server) = broker().await;
        let producer = producer(&server);

        let (tx, rx) = oneshot::channel();
        producer
            .send_async(
                &Message::new("orders", "async"),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .await
            .unwrap();
        let result = rx.await.unwrap().unwrap();
        let record = store.read(parse_msg_id(&result.msg_id).unwrap()).unwrap().unwrap();
        assert_eq!(&record.message.body[..], b"async");

        producer.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_oneway() {
        let (_dir, store, server) = broker().await;
        let producer = producer(&server);

        producer.send_oneway(&Message::new("orders", "fire")).await.unwrap();
        wait_for(|| store.stats().messages_written == 1).await;

        producer.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_absent_broker() {
        let producer = Producer::new("127.0.0.1:1").with_send_msg_timeout(Duration::from_millis(500));
        producer.start();
        let err = producer.send(&Message::new("orders", "x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Remoting(_)));
        assert!(err.is_retryable());
    }
}
