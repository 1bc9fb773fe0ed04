//! # hmq-client
//!
//! Client library for hmq remoting.
//!
//! This crate provides:
//! - Lazy, per-address connection management
//! - Synchronous, asynchronous and oneway invocation
//! - Processors for requests the server initiates
//!
//! # Example
//!
//! ```rust,ignore
//! use hmq_client::{ClientConfig, RemotingClient};
//! use hmq_protocol::Command;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RemotingClient::new(ClientConfig::from_env());
//!     client.start();
//!
//!     let response = client
//!         .invoke_sync("127.0.0.1:8888", Command::request(10), Duration::from_secs(3))
//!         .await?;
//!     println!("{}", response);
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;

pub use client::RemotingClient;
pub use config::ClientConfig;
pub use connection::ConnectionManager;
