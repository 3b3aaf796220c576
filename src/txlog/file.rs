//! File-Backed Transaction Store
//!
//! Single append-only log file. Each record is framed as
//! `[length: u32][compressed: u8][data][crc32: u32]` after a fixed header.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::record::{TxId, TxRecord};
use super::{check_append, check_readable, TxStore};
use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Magic bytes at the start of the log file
const LOG_MAGIC: &[u8; 8] = b"TXRELAY\0";

/// Log file version
const LOG_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: u64 = 16;

/// Length prefix + compression flag + checksum
const FRAME_OVERHEAD: u64 = 4 + 1 + 4;

/// Outcome of decoding one frame
enum Frame {
    Record(TxRecord, u64),
    /// Incomplete or checksum-failing frame
    Damaged,
}

/// Mutable file state, guarded by the store mutex
struct FileInner {
    file: File,
    /// End of the last complete frame
    write_pos: u64,
    /// Frame offset of every record
    offsets: BTreeMap<TxId, u64>,
}

/// Durable transaction store backed by one log file
pub struct FileTxStore {
    path: PathBuf,
    inner: Mutex<FileInner>,
    last: AtomicU64,
    oldest: AtomicU64,
    compression: bool,
    fsync: bool,
}

impl FileTxStore {
    /// Open (or create) the log at `path`, recovering the committed tail
    pub fn open(path: impl AsRef<Path>, config: &LogConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            write_header(&mut file)?;
        } else {
            read_header(&mut file)?;
        }

        let end = file.seek(SeekFrom::End(0))?;
        let (offsets, write_pos) = recover(&mut file, end)?;

        if write_pos < end {
            tracing::warn!(
                "Truncating damaged tail of {:?}: {} bytes after offset {}",
                path,
                end - write_pos,
                write_pos
            );
            file.set_len(write_pos)?;
            file.sync_all()?;
        }

        let last = offsets.keys().next_back().copied().unwrap_or(0);
        let oldest = offsets.keys().next().copied().unwrap_or(last + 1);
        tracing::info!(
            "Opened transaction log {:?}: {} records, last tx {}",
            path,
            offsets.len(),
            last
        );

        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                file,
                write_pos,
                offsets,
            }),
            last: AtomicU64::new(last),
            oldest: AtomicU64::new(oldest),
            compression: config.compression,
            fsync: config.fsync,
        })
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl TxStore for FileTxStore {
    fn last_committed_tx_id(&self) -> TxId {
        self.last.load(Ordering::Acquire)
    }

    fn oldest_retained_tx_id(&self) -> TxId {
        self.oldest.load(Ordering::Acquire)
    }

    async fn append(&self, record: TxRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        check_append(self.last.load(Ordering::Acquire), &record)?;

        let frame = encode_frame(&record, self.compression)?;
        let pos = inner.write_pos;
        inner.file.seek(SeekFrom::Start(pos))?;
        inner.file.write_all(&frame)?;
        if self.fsync {
            inner.file.sync_data()?;
        }

        inner.offsets.insert(record.tx_id, pos);
        inner.write_pos = pos + frame.len() as u64;
        if inner.offsets.len() == 1 {
            self.oldest.store(record.tx_id, Ordering::Release);
        }
        self.last.store(record.tx_id, Ordering::Release);
        Ok(())
    }

    async fn read_after(&self, from_exclusive: TxId, max: usize) -> Result<Vec<TxRecord>> {
        let mut inner = self.inner.lock().await;
        check_readable(from_exclusive, self.oldest.load(Ordering::Acquire))?;

        let positions: Vec<(TxId, u64)> = inner
            .offsets
            .range(from_exclusive.saturating_add(1)..)
            .take(max)
            .map(|(tx_id, pos)| (*tx_id, *pos))
            .collect();

        let end = inner.write_pos;
        let mut records = Vec::with_capacity(positions.len());
        for (tx_id, pos) in positions {
            match read_frame(&mut inner.file, pos, end)? {
                Frame::Record(record, _) => records.push(record),
                Frame::Damaged => {
                    return Err(Error::LogCorrupted {
                        tx_id,
                        reason: format!("damaged frame at offset {}", pos),
                    })
                }
            }
        }
        Ok(records)
    }
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(LOG_MAGIC);
    header[8..12].copy_from_slice(&LOG_VERSION.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    if &header[0..8] != LOG_MAGIC {
        return Err(Error::Log("Invalid transaction log magic bytes".into()));
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != LOG_VERSION {
        return Err(Error::Log(format!("Unsupported log version: {}", version)));
    }
    Ok(())
}

/// Scan every frame, returning the offset index and the end of the last good frame
fn recover(file: &mut File, end: u64) -> Result<(BTreeMap<TxId, u64>, u64)> {
    let mut offsets = BTreeMap::new();
    let mut pos = HEADER_SIZE;
    let mut previous: Option<TxId> = None;

    while pos < end {
        match read_frame(file, pos, end)? {
            Frame::Record(record, next) => {
                if let Some(prev) = previous {
                    if record.tx_id != prev + 1 {
                        return Err(Error::LogCorrupted {
                            tx_id: record.tx_id,
                            reason: format!("record follows tx {} in the log file", prev),
                        });
                    }
                }
                previous = Some(record.tx_id);
                offsets.insert(record.tx_id, pos);
                pos = next;
            }
            Frame::Damaged => break,
        }
    }

    Ok((offsets, pos))
}

fn encode_frame(record: &TxRecord, compression: bool) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(record)?;
    let data = if compression {
        lz4_flex::compress_prepend_size(&serialized)
    } else {
        serialized
    };

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD as usize + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.push(compression as u8);
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    Ok(frame)
}

fn read_frame(file: &mut File, pos: u64, end: u64) -> Result<Frame> {
    if pos + FRAME_OVERHEAD > end {
        return Ok(Frame::Damaged);
    }

    file.seek(SeekFrom::Start(pos))?;
    let mut prefix = [0u8; 5];
    file.read_exact(&mut prefix)?;
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
    let compressed = prefix[4] != 0;

    let next = pos + FRAME_OVERHEAD + len;
    if next > end {
        return Ok(Frame::Damaged);
    }

    let mut data = vec![0u8; len as usize];
    file.read_exact(&mut data)?;
    let mut checksum = [0u8; 4];
    file.read_exact(&mut checksum)?;
    if u32::from_le_bytes(checksum) != crc32fast::hash(&data) {
        return Ok(Frame::Damaged);
    }

    let serialized = if compressed {
        lz4_flex::decompress_size_prepended(&data)
            .map_err(|e| Error::Log(format!("Decompression failed: {}", e)))?
    } else {
        data
    };

    let record: TxRecord = bincode::deserialize(&serialized)?;
    Ok(Frame::Record(record, next))
}
