//! Commit log segment files.
//!
//! The commit log is split into segments named after the physical offset of
//! their first byte, so any offset maps to exactly one file.

use crate::error::StoreError;
use crate::message::MessageRecord;
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier: the physical offset of the segment's first byte.
pub type SegmentId = u64;

/// Segment file name format: NNNNNNNNNNNNNNNN.log (16 hex digits)
pub fn segment_filename(id: SegmentId) -> String {
    format!("{:016x}.log", id)
}

/// Parse segment ID from filename.
pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let name = name.strip_suffix(".log")?;
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// Outcome of reading a segment from the start.
#[derive(Debug)]
pub struct SegmentScan {
    pub records: Vec<MessageRecord>,
    /// Length of the intact prefix of the file.
    pub valid_len: u64,
    /// The error that stopped the scan, if any.
    pub error: Option<StoreError>,
}

/// A single commit log segment file.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    sync_pending: bool,
}

impl Segment {
    /// Creates a new segment file.
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, StoreError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_size,
            sync_pending: false,
        })
    }

    /// Opens an existing segment file for reading and appending.
    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, StoreError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            file,
            size,
            max_size,
            sync_pending: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Physical offset one past the last byte written.
    pub fn end_offset(&self) -> u64 {
        self.id + self.size
    }

    /// Returns whether the segment can fit a record of the given size.
    ///
    /// An empty segment accepts any record so oversized records still land.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.size == 0 || self.size + record_size as u64 <= self.max_size
    }

    /// Appends encoded record bytes, returning their physical offset.
    pub fn append(&mut self, record: &[u8]) -> Result<u64, StoreError> {
        let offset = self.end_offset();
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(record)?;
        self.size += record.len() as u64;
        self.sync_pending = true;
        Ok(offset)
    }

    /// Syncs the segment to disk. Returns whether anything was synced.
    pub fn sync(&mut self) -> Result<bool, StoreError> {
        if self.sync_pending {
            self.file.sync_data()?;
            self.sync_pending = false;
            return Ok(true);
        }
        Ok(false)
    }

    /// Reads every record up to the first damaged or incomplete one.
    pub fn scan(&mut self) -> Result<SegmentScan, StoreError> {
        let mut contents = Vec::with_capacity(self.size as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut contents)?;
        let mut buf = BytesMut::from(&contents[..]);

        let mut records = Vec::new();
        let mut position = 0u64;
        let mut error = None;

        while buf.len() >= RECORD_HEADER_SIZE {
            match MessageRecord::decode(&mut buf, self.id + position) {
                Ok(Some(record)) => {
                    position += record.disk_size() as u64;
                    records.push(record);
                }
                Ok(None) => break,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        Ok(SegmentScan {
            records,
            valid_len: position,
            error,
        })
    }

    /// Reads the record at a physical offset inside this segment.
    pub fn read_at(&mut self, physical_offset: u64) -> Result<Option<MessageRecord>, StoreError> {
        if physical_offset < self.id {
            return Err(StoreError::InvalidState(format!(
                "offset {} precedes segment {}",
                physical_offset, self.id
            )));
        }
        self.file.seek(SeekFrom::Start(physical_offset - self.id))?;

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + 4096);
        let mut chunk = vec![0u8; RECORD_HEADER_SIZE + 4096];

        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e.into()),
            }

            if let Some(record) = MessageRecord::decode(&mut buf, physical_offset)? {
                return Ok(Some(record));
            }
        }
    }

    /// Truncates the segment at a position relative to its start.
    pub fn truncate_at(&mut self, position: u64) -> Result<(), StoreError> {
        self.file.set_len(position)?;
        self.size = position;
        self.file.seek(SeekFrom::End(0))?;
        self.sync_pending = true;
        self.sync()?;
        Ok(())
    }
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists all segment IDs in a directory, sorted ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, StoreError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = parse_segment_filename(&name) {
                segments.push(id);
            }
        }

        segments.sort();
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode, StoredMessage};
    use tempfile::TempDir;

    fn record(i: u64) -> BytesMut {
        encode(&StoredMessage::new("t", format!("body-{}", i)), i, 0)
    }

    #[test]
    fn test_segment_filename() {
        assert_eq!(segment_filename(0), "0000000000000000.log");
        assert_eq!(segment_filename(4096), "0000000000001000.log");
        assert_eq!(parse_segment_filename("0000000000001000.log"), Some(4096));
        assert_eq!(parse_segment_filename("invalid.log"), None);
        assert_eq!(parse_segment_filename("0000000000000000.wal"), None);
    }

    #[test]
    fn test_append_offsets_are_physical() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1000, 1 << 20).unwrap();

        let first = record(0);
        assert_eq!(segment.append(&first).unwrap(), 1000);
        assert_eq!(segment.append(&record(1)).unwrap(), 1000 + first.len() as u64);
        assert!(segment.sync().unwrap());
        assert!(!segment.sync().unwrap());

        let read = segment.read_at(1000 + first.len() as u64).unwrap().unwrap();
        assert_eq!(read.queue_offset, 1);
        assert_eq!(&read.message.body[..], b"body-1");
        assert!(segment.read_at(segment.end_offset()).unwrap().is_none());
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 0, 1 << 20).unwrap();
        for i in 0..3 {
            segment.append(&record(i)).unwrap();
        }
        let intact = segment.size();
        let torn = record(3);
        segment.append(&torn[..torn.len() / 2]).unwrap();

        let scan = segment.scan().unwrap();
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.valid_len, intact);
        assert!(scan.error.is_none());

        segment.truncate_at(scan.valid_len).unwrap();
        assert_eq!(segment.size(), intact);
    }

    #[test]
    fn test_can_fit() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 0, 64).unwrap();
        assert!(segment.can_fit(1000));
        segment.append(&record(0)).unwrap();
        assert!(!segment.can_fit(64));
    }

    #[test]
    fn test_list_segments_sorted() {
        let dir = TempDir::new().unwrap();
        for id in [4096, 0, 1 << 20] {
            Segment::create(dir.path(), id, 1 << 20).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(
            SegmentScanner::list_segments(dir.path()).unwrap(),
            vec![0, 4096, 1 << 20]
        );
    }
}
