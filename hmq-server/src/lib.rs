//! # hmq-server
//!
//! Remoting server for hmq.
//!
//! This crate provides:
//! - A TCP accept loop wrapping each connection in a framed channel
//! - Request dispatch through the shared remoting core
//! - Idle connection detection and lifecycle events
//! - Server-initiated calls on accepted connections

pub mod config;
pub mod error;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use error::ServerError;
pub use server::{RemotingServer, ServerStats};
