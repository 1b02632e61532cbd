//! Append-only changelog backing a state store.
//!
//! Mutations are persisted here before they are applied to the in-memory
//! index, enabling recovery after crashes. Record format on disk:
//! `[length: 4][crc32: 4][data: length]`, little-endian, rkyv-encoded
//! entries. A torn tail (partial frame or checksum mismatch after a crash)
//! is detected at read time and reported so recovery can truncate it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rkyv::{
    rancor::Error as RkyvError, util::AlignedVec, Archive, Deserialize as RkyvDeserialize,
    Serialize as RkyvSerialize,
};

use freshet_core::state::StateError;

/// Upper bound on a single entry frame. Anything larger is treated as a
/// corrupt length field.
const MAX_ENTRY_BYTES: u32 = 64 * 1024 * 1024;

/// Changelog entry types.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum ChangelogEntry {
    /// Put a key-value pair.
    Put {
        /// The key.
        key: Vec<u8>,
        /// The value.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key.
        key: Vec<u8>,
    },
    /// Offsets committed after the preceding mutations were durable.
    ///
    /// Keys are `"{topic}-{partition}"`, values next-to-read offsets.
    Commit {
        /// Committed offsets.
        offsets: HashMap<String, i64>,
    },
}

/// Error type for changelog operations.
#[derive(Debug, thiserror::Error)]
pub enum ChangelogError {
    /// IO error during changelog operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error when writing entries.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error on a frame that passed its checksum.
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<ChangelogError> for StateError {
    fn from(e: ChangelogError) -> Self {
        match e {
            ChangelogError::Io(io) => StateError::Io(io),
            ChangelogError::Serialization(msg) => StateError::Serialization(msg),
            ChangelogError::Deserialization(msg) => StateError::Corruption(msg),
        }
    }
}

/// Append-only changelog writer with group commit.
pub struct Changelog {
    /// Buffered writer for efficient appends.
    writer: BufWriter<File>,
    /// Path to the log file.
    path: PathBuf,
    /// Sync interval for group commit.
    sync_interval: Duration,
    /// Last sync time.
    last_sync: Instant,
    /// Current file position.
    position: u64,
    /// Whether to sync on every append (for testing).
    sync_on_write: bool,
}

impl Changelog {
    /// Opens (or creates) a changelog at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, sync_interval: Duration) -> Result<Self, ChangelogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let position = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            sync_interval,
            last_sync: Instant::now(),
            position,
            sync_on_write: false,
        })
    }

    /// Enable sync on every append (for testing).
    pub fn set_sync_on_write(&mut self, enabled: bool) {
        self.sync_on_write = enabled;
    }

    /// Appends an entry and returns its starting position.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn append(&mut self, entry: &ChangelogEntry) -> Result<u64, ChangelogError> {
        let start_pos = self.position;

        let bytes: AlignedVec = rkyv::to_bytes::<RkyvError>(entry)
            .map_err(|e| ChangelogError::Serialization(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_ENTRY_BYTES
        let len = bytes.len() as u32;
        let crc = crc32c::crc32c(&bytes);

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&bytes)?;
        self.position += 8 + bytes.len() as u64;

        if self.sync_on_write || self.last_sync.elapsed() >= self.sync_interval {
            self.sync()?;
        }

        Ok(start_pos)
    }

    /// Flushes buffered writes and fsyncs the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    pub fn sync(&mut self) -> Result<(), ChangelogError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Current end position of the log.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Truncates the log at `position`.
    ///
    /// Used after checkpointing (old entries are covered by the snapshot)
    /// and after a torn tail is detected during recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncate or reopen fails.
    pub fn truncate(&mut self, position: u64) -> Result<(), ChangelogError> {
        self.sync()?;

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(position)?;
        file.sync_all()?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.position = position;

        Ok(())
    }

    /// Opens a reader starting at `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or seeked.
    pub fn read_from(&self, position: u64) -> Result<ChangelogReader, ChangelogError> {
        ChangelogReader::open(&self.path, position)
    }
}

impl std::fmt::Debug for Changelog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Changelog")
            .field("path", &self.path)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Outcome of reading one frame from the changelog.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete, checksum-valid entry.
    Entry(ChangelogEntry),
    /// Clean end of the log.
    Eof,
    /// Torn or corrupt data starting at `position`; the remainder of the
    /// file is garbage and should be truncated.
    CorruptTail {
        /// Position of the first bad byte.
        position: u64,
        /// What failed.
        reason: &'static str,
    },
}

/// Reader over changelog frames, used during recovery replay.
pub struct ChangelogReader {
    reader: BufReader<File>,
    position: u64,
}

impl ChangelogReader {
    fn open(path: &Path, position: u64) -> Result<Self, ChangelogError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(position))?;
        Ok(Self { reader, position })
    }

    /// Position of the next unread frame.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next frame.
    ///
    /// Partial frames and checksum mismatches are reported as
    /// [`ReadOutcome::CorruptTail`] rather than errors: they are the
    /// expected shape of a crash mid-append.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::Deserialization`] if a checksum-valid
    /// frame fails to decode (a bug, not a torn write), or an IO error.
    pub fn read_next(&mut self) -> Result<ReadOutcome, ChangelogError> {
        let frame_start = self.position;

        let mut header = [0u8; 8];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadFill::Eof => return Ok(ReadOutcome::Eof),
            ReadFill::Partial => {
                return Ok(ReadOutcome::CorruptTail {
                    position: frame_start,
                    reason: "partial frame header",
                })
            }
            ReadFill::Full => {}
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_ENTRY_BYTES {
            return Ok(ReadOutcome::CorruptTail {
                position: frame_start,
                reason: "implausible frame length",
            });
        }

        let mut payload = vec![0u8; len as usize];
        match read_exact_or_eof(&mut self.reader, &mut payload)? {
            ReadFill::Full => {}
            ReadFill::Eof | ReadFill::Partial => {
                return Ok(ReadOutcome::CorruptTail {
                    position: frame_start,
                    reason: "truncated frame payload",
                })
            }
        }

        if crc32c::crc32c(&payload) != crc {
            return Ok(ReadOutcome::CorruptTail {
                position: frame_start,
                reason: "checksum mismatch",
            });
        }

        let entry = rkyv::from_bytes::<ChangelogEntry, RkyvError>(&payload)
            .map_err(|e| ChangelogError::Deserialization(e.to_string()))?;

        self.position += 8 + u64::from(len);
        Ok(ReadOutcome::Entry(entry))
    }
}

enum ReadFill {
    Full,
    Partial,
    Eof,
}

/// Fills `buf` completely, distinguishing a clean EOF at a frame boundary
/// from a torn frame.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadFill, ChangelogError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadFill::Eof
            } else {
                ReadFill::Partial
            });
        }
        filled += n;
    }
    Ok(ReadFill::Full)
}
