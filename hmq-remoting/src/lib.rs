//! # hmq-remoting
//!
//! Transport-agnostic remoting core shared by the hmq client and server.
//!
//! This crate provides:
//! - Framed channels with dedicated reader and writer tasks
//! - The opaque-keyed correlation engine (sync, async and oneway calls)
//! - The per-code processor table with worker-pool admission control
//! - RPC hooks and channel lifecycle events

pub mod channel;
pub mod error;
pub mod event;
pub mod executor;
pub mod hook;
pub mod processor;
pub mod release;
pub mod remoting;
pub mod response;

pub use channel::{Channel, InboundHandler, WriteCompletion};
pub use error::RemotingError;
pub use event::{ChannelEvent, ChannelEventListener, ChannelEventType};
pub use executor::{Job, Rejected, WorkerPool};
pub use hook::RpcHook;
pub use processor::{ProcessorError, RequestContext, RequestProcessor};
pub use release::ReleaseOnce;
pub use remoting::{RemotingConfig, RemotingCore};
pub use response::{InvokeCallback, ResponseFuture, ResponseTable};
