//! The commit log: every message of every topic, appended in arrival order.

use crate::error::StoreError;
use crate::message::{self, MessageRecord, StoredMessage, MAX_PROPERTIES_LENGTH, MAX_TOPIC_LENGTH};
use crate::segment::{Segment, SegmentId, SegmentScanner};
use crate::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SEGMENT_SIZE};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fsync policy for commit log writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Fsync after every append (safest, slowest).
    #[default]
    EveryWrite,
    /// Fsync after N appends.
    EveryN(u32),
    /// Never fsync automatically (caller must call flush).
    Never,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the commit log segments.
    pub data_dir: PathBuf,
    /// Maximum segment size before rotation.
    pub segment_size: u64,
    pub flush_policy: FlushPolicy,
    /// Largest message body accepted.
    pub max_message_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/commitlog"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            flush_policy: FlushPolicy::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("HMQ_STORE_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(size) = std::env::var("HMQ_STORE_SEGMENT_SIZE") {
            if let Ok(bytes) = size.parse() {
                self.segment_size = bytes;
            }
        }

        if let Ok(policy) = std::env::var("HMQ_STORE_FLUSH_POLICY") {
            self.flush_policy = match policy.to_lowercase().as_str() {
                "every_write" | "everywrite" => FlushPolicy::EveryWrite,
                "never" => FlushPolicy::Never,
                s if s.starts_with("every_n:") => s[8..]
                    .parse()
                    .map(FlushPolicy::EveryN)
                    .unwrap_or(self.flush_policy),
                _ => self.flush_policy,
            };
        }
    }
}

/// Outcome category of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    PutOk,
    /// Topic empty or too long, or body too large.
    MessageIllegal,
    PropertiesSizeExceeded,
}

/// Result of appending one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub status: AppendStatus,
    /// Physical offset of the record.
    pub wrote_offset: u64,
    pub wrote_bytes: usize,
    pub msg_id: String,
    /// Position of the message within its topic.
    pub queue_offset: u64,
    pub store_timestamp: i64,
}

impl AppendResult {
    fn rejected(status: AppendStatus) -> Self {
        Self {
            status,
            wrote_offset: 0,
            wrote_bytes: 0,
            msg_id: String::new(),
            queue_offset: 0,
            store_timestamp: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AppendStatus::PutOk
    }
}

/// Persistent storage for messages.
pub trait MessageStore: Send + Sync {
    /// Appends a message. Validation failures are reported through
    /// [`AppendResult::status`]; `Err` means the store itself failed.
    fn append(&self, message: &StoredMessage) -> Result<AppendResult, StoreError>;

    /// Reads the message stored at a physical offset.
    fn read(&self, physical_offset: u64) -> Result<Option<MessageRecord>, StoreError>;

    /// Physical offset the next append will use.
    fn max_offset(&self) -> u64;

    /// Forces buffered writes to disk.
    fn flush(&self) -> Result<(), StoreError>;
}

/// I/O statistics for the commit log.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub messages_written: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
}

/// What opening the log found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub segments: usize,
    pub records: u64,
    pub bytes_truncated: u64,
}

struct WriteState {
    current: Segment,
    queue_offsets: HashMap<String, u64>,
    writes_since_sync: u32,
}

/// Segmented, append-only commit log.
pub struct CommitLog {
    config: StoreConfig,
    state: Mutex<WriteState>,
    /// Read handles for every segment.
    readers: RwLock<BTreeMap<SegmentId, Arc<Mutex<Segment>>>>,
    max_offset: AtomicU64,
    closed: AtomicBool,
    recovery: RecoveryReport,
    stats_messages: AtomicU64,
    stats_bytes: AtomicU64,
    stats_fsyncs: AtomicU64,
}

impl CommitLog {
    /// Opens or creates the commit log, truncating torn tails.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut segment_ids = SegmentScanner::list_segments(&config.data_dir)?;
        if segment_ids.is_empty() {
            Segment::create(&config.data_dir, 0, config.segment_size)?;
            segment_ids.push(0);
        }

        let mut report = RecoveryReport {
            segments: segment_ids.len(),
            ..Default::default()
        };
        let mut queue_offsets: HashMap<String, u64> = HashMap::new();
        let mut readers = BTreeMap::new();

        for &id in &segment_ids {
            let mut segment = Segment::open(&config.data_dir, id, config.segment_size)?;
            let scan = segment.scan()?;

            for record in &scan.records {
                let next = queue_offsets
                    .entry(record.message.topic.clone())
                    .or_insert(0);
                *next = (*next).max(record.queue_offset + 1);
            }
            report.records += scan.records.len() as u64;

            if scan.valid_len < segment.size() {
                let truncated = segment.size() - scan.valid_len;
                match &scan.error {
                    Some(e) => tracing::warn!(
                        "Segment {} damaged at offset {}: {}, truncating {} bytes",
                        id,
                        id + scan.valid_len,
                        e,
                        truncated
                    ),
                    None => tracing::warn!(
                        "Segment {} has a torn tail, truncating {} bytes",
                        id,
                        truncated
                    ),
                }
                segment.truncate_at(scan.valid_len)?;
                report.bytes_truncated += truncated;
            }

            readers.insert(id, Arc::new(Mutex::new(segment)));
        }

        let latest = *segment_ids
            .last()
            .ok_or_else(|| StoreError::InvalidState("no segments".to_string()))?;
        let current = Segment::open(&config.data_dir, latest, config.segment_size)?;
        let max_offset = current.end_offset();

        tracing::info!(
            "Commit log recovered: {} segments, {} messages, max offset {}",
            report.segments,
            report.records,
            max_offset
        );

        Ok(Self {
            config,
            state: Mutex::new(WriteState {
                current,
                queue_offsets,
                writes_since_sync: 0,
            }),
            readers: RwLock::new(readers),
            max_offset: AtomicU64::new(max_offset),
            closed: AtomicBool::new(false),
            recovery: report,
            stats_messages: AtomicU64::new(0),
            stats_bytes: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// What was found when the log was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    fn validate(&self, message: &StoredMessage) -> Result<(), AppendStatus> {
        if message.topic.is_empty() || message.topic.len() > MAX_TOPIC_LENGTH {
            return Err(AppendStatus::MessageIllegal);
        }
        if message.body.len() > self.config.max_message_size {
            return Err(AppendStatus::MessageIllegal);
        }
        if message.properties.len() > MAX_PROPERTIES_LENGTH {
            return Err(AppendStatus::PropertiesSizeExceeded);
        }
        Ok(())
    }

    /// Starts a new segment right after the current one.
    fn rotate(&self, state: &mut WriteState) -> Result<(), StoreError> {
        state.current.sync()?;
        let next_id = state.current.end_offset();
        let segment = Segment::create(&self.config.data_dir, next_id, self.config.segment_size)?;
        let reader = Segment::open(&self.config.data_dir, next_id, self.config.segment_size)?;
        self.readers
            .write()
            .insert(next_id, Arc::new(Mutex::new(reader)));
        state.current = segment;
        tracing::debug!("Rotated to segment {}", next_id);
        Ok(())
    }

    /// Closes the log, syncing pending writes.
    pub fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.flush()
    }

    /// Next queue offset for `topic`.
    pub fn topic_offset(&self, topic: &str) -> u64 {
        self.state
            .lock()
            .queue_offsets
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.readers.read().keys().copied().collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            messages_written: self.stats_messages.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
        }
    }
}

impl MessageStore for CommitLog {
    fn append(&self, message: &StoredMessage) -> Result<AppendResult, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if let Err(status) = self.validate(message) {
            tracing::warn!(
                "Rejected message for topic '{}': {:?}",
                message.topic,
                status
            );
            return Ok(AppendResult::rejected(status));
        }

        let mut state = self.state.lock();
        let queue_offset = state
            .queue_offsets
            .get(&message.topic)
            .copied()
            .unwrap_or(0);
        let store_timestamp = chrono::Utc::now().timestamp_millis();
        let record = message::encode(message, queue_offset, store_timestamp);

        if !state.current.can_fit(record.len()) {
            self.rotate(&mut state)?;
        }
        let offset = state.current.append(&record)?;
        state
            .queue_offsets
            .insert(message.topic.clone(), queue_offset + 1);

        state.writes_since_sync += 1;
        let sync = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => state.writes_since_sync >= n,
            FlushPolicy::Never => false,
        };
        if sync {
            state.current.sync()?;
            state.writes_since_sync = 0;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }

        self.max_offset
            .store(offset + record.len() as u64, Ordering::Release);
        self.stats_messages.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes
            .fetch_add(record.len() as u64, Ordering::Relaxed);

        Ok(AppendResult {
            status: AppendStatus::PutOk,
            wrote_offset: offset,
            wrote_bytes: record.len(),
            msg_id: message::msg_id(offset),
            queue_offset,
            store_timestamp,
        })
    }

    fn read(&self, physical_offset: u64) -> Result<Option<MessageRecord>, StoreError> {
        if physical_offset >= self.max_offset() {
            return Ok(None);
        }
        let segment = {
            let readers = self.readers.read();
            match readers.range(..=physical_offset).next_back() {
                Some((_, segment)) => segment.clone(),
                None => return Ok(None),
            }
        };
        let mut segment = segment.lock();
        segment.read_at(physical_offset)
    }

    fn max_offset(&self) -> u64 {
        self.max_offset.load(Ordering::Acquire)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.current.sync()? {
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        state.writes_since_sync = 0;
        Ok(())
    }
}
