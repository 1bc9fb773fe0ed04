//! # hmq-broker
//!
//! The hmq broker and its producer.
//!
//! This crate provides:
//! - The `SEND_MESSAGE` request code and its typed headers
//! - `SendMessageProcessor`, which appends messages to a [`MessageStore`]
//! - `BrokerController`, which wires the remoting server to the commit log
//! - `Producer`, which sends messages with sync, async and oneway semantics
//!
//! [`MessageStore`]: hmq_store::MessageStore

pub mod config;
pub mod controller;
pub mod error;
pub mod header;
pub mod message;
pub mod processor;
pub mod producer;

pub use config::BrokerConfig;
pub use controller::BrokerController;
pub use error::BrokerError;
pub use header::{SendMessageRequestHeader, SendMessageResponseHeader};
pub use message::Message;
pub use processor::SendMessageProcessor;
pub use producer::{Producer, SendCallback, SendResult};

/// Request codes understood by the broker.
pub mod request_code {
    /// Store one message.
    pub const SEND_MESSAGE: i16 = 10;
}

/// Environment variable naming the broker's YAML config file.
pub const CONFIG_ENV: &str = "HMQ_CONFIG";
