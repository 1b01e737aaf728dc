//! Durable journal backing the mutation logs.
//!
//! Every event is written here before it becomes visible to readers.
//! On open the journal is replayed so the store and the logs come back
//! with the same indices they had before the restart.

use crate::error::{Result, StreamError};
use crate::types::{Event, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"EVJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Sanity cap on a single encoded entry.
const MAX_ENTRY_SIZE: usize = 16 * 1024 * 1024;

const JOURNAL_FILE: &str = "events.journal";
const LOCK_FILE: &str = "LOCK";

/// Journal configuration.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Directory holding the journal and its lock file.
    pub path: PathBuf,

    /// Sync every N appends (0 and 1 both mean every append).
    /// Default: 100
    pub sync_interval: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./journal"),
            sync_interval: 100,
        }
    }
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub event: Event,
    pub written_at: Timestamp,
}

struct JournalWriter {
    file: BufWriter<File>,
    writes_since_sync: u64,
}

/// Append-only event journal.
pub struct Journal {
    path: PathBuf,
    /// Held for exclusive access to the directory.
    _lock_file: File,
    writer: Mutex<JournalWriter>,
    sync_interval: u64,
    /// Write time of the last entry replayed on open.
    replayed_through: Option<Timestamp>,
}

impl Journal {
    /// Open (or create) the journal and return the events it holds.
    ///
    /// A torn or corrupt tail ends the replay; the file is truncated back
    /// to the last intact entry.
    pub fn open(config: &JournalConfig) -> Result<(Self, Vec<Event>)> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let path = config.path.join(JOURNAL_FILE);
        let existing = path.exists() && fs::metadata(&path)?.len() > 0;

        let (events, replayed_through) = if existing {
            let (events, replayed_through, good_offset) = Self::replay(&path)?;
            let len = fs::metadata(&path)?.len();
            if good_offset < len {
                warn!(
                    path = %path.display(),
                    good_offset,
                    len,
                    "truncating torn journal tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_offset)?;
                file.sync_all()?;
            }
            (events, replayed_through)
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            (Vec::new(), None)
        };

        debug!(
            path = %path.display(),
            replayed = events.len(),
            last_written = ?replayed_through,
            "journal opened"
        );

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok((
            Self {
                path,
                _lock_file: lock_file,
                writer: Mutex::new(JournalWriter {
                    file: BufWriter::new(file),
                    writes_since_sync: 0,
                }),
                sync_interval: config.sync_interval.max(1),
                replayed_through,
            },
            events,
        ))
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the newest entry found on open was written. `None` for a
    /// fresh journal.
    pub fn replayed_through(&self) -> Option<Timestamp> {
        self.replayed_through
    }

    /// Durably record an event.
    pub fn append(&self, event: &Event) -> Result<()> {
        let entry = JournalEntry {
            event: event.clone(),
            written_at: Timestamp::now(),
        };
        let encoded = rmp_serde::to_vec_named(&entry)?;

        let mut writer = self.writer.lock();
        writer
            .file
            .write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.file.write_all(&encoded)?;
        writer
            .file
            .write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        writer.file.flush()?;

        writer.writes_since_sync += 1;
        if writer.writes_since_sync >= self.sync_interval {
            writer.file.get_ref().sync_all()?;
            writer.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        writer.writes_since_sync = 0;
        Ok(())
    }

    /// Read every intact entry. Returns the events, the write time of the
    /// last one, and the offset just past it.
    fn replay(path: &Path) -> Result<(Vec<Event>, Option<Timestamp>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StreamError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StreamError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut events = Vec::new();
        let mut last_written = None;
        let mut offset = HEADER_SIZE;
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, size))) => {
                    last_written = Some(entry.written_at);
                    events.push(entry.event);
                    offset += size;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, offset, "journal replay stopped at bad entry");
                    break;
                }
            }
        }

        Ok((events, last_written, offset))
    }

    /// Read one entry. `Ok(None)` at a clean end of file.
    fn read_entry(reader: &mut BufReader<File>) -> Result<Option<(JournalEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(StreamError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StreamError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entry: JournalEntry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, (4 + len + 4) as u64)))
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StreamError::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
