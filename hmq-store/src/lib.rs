//! # hmq-store
//!
//! Message storage for the hmq broker.
//!
//! This crate provides a durable, append-only commit log with:
//! - Per-record CRC32C checksums for corruption detection
//! - Segment files named by the physical offset of their first byte
//! - Message ids derived from the physical offset
//! - Recovery that truncates torn or damaged tails

pub mod commit_log;
pub mod error;
pub mod message;
pub mod segment;

pub use commit_log::{
    AppendResult, AppendStatus, CommitLog, FlushPolicy, MessageStore, RecoveryReport, StoreConfig,
    StoreStats,
};
pub use error::StoreError;
pub use message::{msg_id, parse_msg_id, MessageRecord, StoredMessage};
pub use segment::{Segment, SegmentId};

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default largest message body (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 12;
