//! Fixed-size, sequence-addressed circular ring file.
//!
//! Layout: one 512-byte header block (20 bytes used: magic, last sequence
//! written, record count, record size in blocks) followed by `max_records`
//! fixed-size slots of `record_size_blocks * 512` bytes. A sequence maps to
//! slot `seq mod max_records`, so the ring retains exactly the last
//! `max_records` sequences; anything older is rejected rather than allowed
//! to collide with a still-outstanding newer record.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RingError, RingResult};

/// Ring file magic: "SRNG".
pub const RING_MAGIC: u32 = 0x5352_4E47;
/// Base block granularity of the file.
pub const BLOCK_SIZE: usize = 512;
/// Bytes of the header block actually used.
pub const HEADER_SIZE: usize = 20;

/// Watermark value of a ring that has never been written.
const EMPTY_SEQ: i64 = -1;

struct Inner {
    file: File,
    last_seq_out: i64,
}

/// Sequence-addressed circular store of fixed-size records.
pub struct RingStore {
    path: PathBuf,
    max_records: i32,
    record_size_blocks: i32,
    inner: Mutex<Inner>,
}

impl RingStore {
    /// Opens or creates the ring at `path` with the given geometry.
    ///
    /// An existing file whose recorded geometry differs is obsolete: it is
    /// reset in place (watermark cleared, header rewritten, file truncated
    /// to the new size). There is no data migration.
    pub fn open(
        path: impl AsRef<Path>,
        record_size_blocks: i32,
        max_records: i32,
    ) -> RingResult<Self> {
        if record_size_blocks <= 0 || max_records <= 0 {
            return Err(RingError::InvalidHeader {
                reason: format!(
                    "non-positive geometry: record_size_blocks {record_size_blocks}, max_records {max_records}"
                ),
            });
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = (max_records as u64 * record_size_blocks as u64 + 1) * BLOCK_SIZE as u64;
        let existing_len = file.metadata()?.len();

        let mut last_seq_out = EMPTY_SEQ;
        if existing_len == 0 {
            info!(path = %path.display(), max_records, record_size_blocks, "creating ring file");
            file.set_len(file_size)?;
            write_header(&file, EMPTY_SEQ, max_records, record_size_blocks)?;
        } else {
            match read_header(&file) {
                Ok((seq, file_max, file_blocks))
                    if file_max == max_records && file_blocks == record_size_blocks =>
                {
                    last_seq_out = seq;
                    debug!(
                        path = %path.display(),
                        last_seq_out,
                        "opened ring file"
                    );
                }
                Ok((_, file_max, file_blocks)) => {
                    warn!(
                        path = %path.display(),
                        file_max,
                        file_blocks,
                        max_records,
                        record_size_blocks,
                        "ring geometry changed, resetting file"
                    );
                    file.set_len(file_size)?;
                    write_header(&file, EMPTY_SEQ, max_records, record_size_blocks)?;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable ring header, resetting file");
                    file.set_len(file_size)?;
                    write_header(&file, EMPTY_SEQ, max_records, record_size_blocks)?;
                }
            }
        }

        Ok(Self {
            path,
            max_records,
            record_size_blocks,
            inner: Mutex::new(Inner { file, last_seq_out }),
        })
    }

    /// Ring capacity in records.
    pub fn max_records(&self) -> i32 {
        self.max_records
    }

    /// Slot size in bytes.
    pub fn slot_size(&self) -> usize {
        self.record_size_blocks as usize * BLOCK_SIZE
    }

    /// Highest sequence ever written, or `-1` for an empty ring.
    pub fn last_seq_out(&self) -> i64 {
        self.inner.lock().last_seq_out
    }

    /// Inclusive readable window `(low, high)`, or `None` for an empty ring.
    pub fn readable_range(&self) -> Option<(i64, i64)> {
        let last = self.inner.lock().last_seq_out;
        if last == EMPTY_SEQ {
            return None;
        }
        let low = (last - self.max_records as i64 + 1).max(0);
        Some((low, last))
    }

    /// Writes one record at its sequence-addressed slot.
    ///
    /// Sequences older than the retention window are rejected with
    /// [`RingError::StaleSequence`]; the slot they alias holds a newer
    /// record that may still be unacknowledged. The slot tail past the
    /// record is zeroed so no previous occupant leaks into a read.
    pub fn write(&self, sequence: i64, bytes: &[u8]) -> RingResult<()> {
        if sequence < 0 {
            return Err(RingError::NegativeSequence { sequence });
        }
        let slot_size = self.slot_size();
        if bytes.len() > slot_size {
            return Err(RingError::RecordTooLarge {
                size: bytes.len(),
                slot_size,
            });
        }

        let mut inner = self.inner.lock();
        if inner.last_seq_out != EMPTY_SEQ
            && sequence <= inner.last_seq_out - self.max_records as i64
        {
            return Err(RingError::StaleSequence {
                sequence,
                last_seq_out: inner.last_seq_out,
                max_records: self.max_records,
            });
        }

        let slot = (sequence % self.max_records as i64) as u64;
        let offset = BLOCK_SIZE as u64 + slot * slot_size as u64;
        let mut slot_buf = vec![0u8; slot_size];
        slot_buf[..bytes.len()].copy_from_slice(bytes);
        inner.file.write_all_at(&slot_buf, offset)?;

        if sequence > inner.last_seq_out {
            inner.last_seq_out = sequence;
            write_header(
                &inner.file,
                sequence,
                self.max_records,
                self.record_size_blocks,
            )?;
        }
        Ok(())
    }

    /// Reads the slot for `sequence`. Returns the full slot contents; ring
    /// records are self-describing, the caller trims to the framed length.
    pub fn read(&self, sequence: i64) -> RingResult<Vec<u8>> {
        let inner = self.inner.lock();
        let last = inner.last_seq_out;
        let low = (last - self.max_records as i64 + 1).max(0);
        if last == EMPTY_SEQ || sequence < low || sequence > last {
            return Err(RingError::NotFound {
                sequence,
                low: low.max(0),
                high: last,
            });
        }
        let slot = (sequence % self.max_records as i64) as u64;
        let offset = BLOCK_SIZE as u64 + slot * self.slot_size() as u64;
        let mut buf = vec![0u8; self.slot_size()];
        inner.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Forces header and slot data to disk.
    pub fn flush(&self) -> RingResult<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        debug!(path = %self.path.display(), last_seq_out = inner.last_seq_out, "ring flushed");
        Ok(())
    }
}

fn write_header(
    file: &File,
    last_seq_out: i64,
    max_records: i32,
    record_size_blocks: i32,
) -> RingResult<()> {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&RING_MAGIC.to_be_bytes());
    header[4..12].copy_from_slice(&last_seq_out.to_be_bytes());
    header[12..16].copy_from_slice(&max_records.to_be_bytes());
    header[16..20].copy_from_slice(&record_size_blocks.to_be_bytes());
    file.write_all_at(&header, 0)?;
    Ok(())
}

fn read_header(file: &File) -> RingResult<(i64, i32, i32)> {
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut header, 0)?;
    let magic = u32::from_be_bytes(header[0..4].try_into().unwrap_or_default());
    if magic != RING_MAGIC {
        return Err(RingError::InvalidHeader {
            reason: format!("bad magic {magic:#010x}"),
        });
    }
    let last_seq_out = i64::from_be_bytes(header[4..12].try_into().unwrap_or_default());
    let max_records = i32::from_be_bytes(header[12..16].try_into().unwrap_or_default());
    let record_size_blocks = i32::from_be_bytes(header[16..20].try_into().unwrap_or_default());
    if max_records <= 0 || record_size_blocks <= 0 {
        return Err(RingError::InvalidHeader {
            reason: format!(
                "non-positive geometry: max_records {max_records}, record_size_blocks {record_size_blocks}"
            ),
        });
    }
    Ok((last_seq_out, max_records, record_size_blocks))
}
