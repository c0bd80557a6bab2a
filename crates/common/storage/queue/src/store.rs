// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Backing store for a single cycle.
//!
//! ## Cycle File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Header (128 bytes)                       │
//! ├───────────┬───────────┬──────────────────┬───────┬───────┬───┤
//! │ magic 4B  │ version 4B│ roll cycle 32B   │ epoch │ cycle │ first_index │
//! │ "CQ4S"    │           │ name, NUL padded │ i64   │ i64   │ u64         │
//! └───────────┴───────────┴──────────────────┴───────┴───────┴─────────────┘
//! ┌──────────────────────────────────────────────────────────────┐
//! │ record 0 │ record 1 │ ... │ 0 / end-of-cycle marker          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Record framing is described in [`crate::message`]. The store keeps an
//! in-memory table from sequence number to file offset, rebuilt by scanning
//! when the file is opened and extended whenever records written by other
//! store instances (other processes) are discovered.
//!
//! ## Reservations
//!
//! A store starts with one reservation held by whoever created or opened it.
//! [`WireStore::reserve`] only succeeds while the count is positive, so a
//! store whose count hit zero is never handed out again.

use std::{
    fmt,
    path::Path,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use snafu::{OptionExt, ensure};
use tracing::{debug, warn};

use crate::{
    FlushMode, Result,
    error::{
        CorruptedMessageSnafu, CycleSealedSnafu, IndexBeforeCurrentSnafu, IndexBeyondEndSnafu,
        InvalidArgumentSnafu, InvalidStoreHeaderSnafu, RollCycleMismatchSnafu, StoreFullSnafu,
        StoreReleasedSnafu,
    },
    file::DataFile,
    message::{
        END_OF_CYCLE, MAX_PAYLOAD_LEN, NOT_COMPLETE, RECORD_HEADER_SIZE, RecordHeader,
        calculate_record_crc, record_disk_size,
    },
    roll_cycle::RollCycle,
};

/// Size of the cycle file header in bytes.
pub const STORE_HEADER_SIZE: u64 = 128;

const STORE_MAGIC: [u8; 4] = *b"CQ4S";
const STORE_VERSION: u32 = 1;
const ROLL_CYCLE_NAME_LEN: usize = 32;

const OFFSET_ROLL_CYCLE: usize = 8;
const OFFSET_EPOCH: usize = OFFSET_ROLL_CYCLE + ROLL_CYCLE_NAME_LEN;
const OFFSET_CYCLE: usize = OFFSET_EPOCH + 8;
const OFFSET_FIRST_INDEX: usize = OFFSET_CYCLE + 8;

const FIRST_INDEX_UNSET: u64 = u64::MAX;

/// Decoded cycle file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub roll_cycle:  RollCycle,
    pub epoch:       i64,
    pub cycle:       i64,
    pub first_index: Option<u64>,
}

impl StoreHeader {
    fn encode(&self) -> [u8; STORE_HEADER_SIZE as usize] {
        let mut buf = [0u8; STORE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&STORE_MAGIC);
        buf[4..8].copy_from_slice(&STORE_VERSION.to_le_bytes());
        let name: &'static str = self.roll_cycle.into();
        buf[OFFSET_ROLL_CYCLE..OFFSET_ROLL_CYCLE + name.len()].copy_from_slice(name.as_bytes());
        buf[OFFSET_EPOCH..OFFSET_EPOCH + 8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[OFFSET_CYCLE..OFFSET_CYCLE + 8].copy_from_slice(&self.cycle.to_le_bytes());
        buf[OFFSET_FIRST_INDEX..OFFSET_FIRST_INDEX + 8].copy_from_slice(
            &self
                .first_index
                .unwrap_or(FIRST_INDEX_UNSET)
                .to_le_bytes(),
        );
        buf
    }

    /// Reads the header of the cycle file at `path`. `Ok(None)` while the
    /// file has no header: its creator has not written it yet, or died
    /// before doing so.
    pub fn read_path(path: &Path) -> Result<Option<Self>> {
        if std::fs::metadata(path)?.len() < STORE_HEADER_SIZE {
            return Ok(None);
        }
        let file = DataFile::open(path, false)?;
        if Self::is_blank(&file)? {
            return Ok(None);
        }
        Self::read(&file).map(Some)
    }

    /// A file without magic was never initialised; writers publish the
    /// magic last.
    fn is_blank(file: &DataFile) -> Result<bool> {
        if file.size() < STORE_HEADER_SIZE {
            return Ok(true);
        }
        let mut magic = [0u8; 4];
        file.read_at(0, &mut magic)?;
        Ok(magic == [0u8; 4])
    }

    /// Reads and validates the header of an open cycle file.
    pub fn read(file: &DataFile) -> Result<Self> {
        let invalid = |reason: &str| {
            InvalidStoreHeaderSnafu {
                path:   file.path().to_path_buf(),
                reason: reason.to_string(),
            }
            .build()
        };

        if file.size() < STORE_HEADER_SIZE {
            return Err(invalid("file smaller than header"));
        }

        let mut buf = [0u8; STORE_HEADER_SIZE as usize];
        file.read_at(0, &mut buf)?;

        if buf[0..4] != STORE_MAGIC {
            return Err(invalid("bad magic"));
        }
        if read_u32(&buf, 4) != STORE_VERSION {
            return Err(invalid("unsupported version"));
        }

        let name = &buf[OFFSET_ROLL_CYCLE..OFFSET_EPOCH];
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let roll_cycle = std::str::from_utf8(&name[..name_len])
            .ok()
            .and_then(|name| name.parse::<RollCycle>().ok())
            .ok_or_else(|| invalid("unknown roll cycle"))?;

        let first_index = read_u64(&buf, OFFSET_FIRST_INDEX);

        Ok(Self {
            roll_cycle,
            epoch: i64::from_le_bytes(read_8(&buf, OFFSET_EPOCH)),
            cycle: i64::from_le_bytes(read_8(&buf, OFFSET_CYCLE)),
            first_index: (first_index != FIRST_INDEX_UNSET).then_some(first_index),
        })
    }

    fn describe(roll_cycle: RollCycle, epoch: i64) -> String {
        format!("{roll_cycle} (epoch {epoch})")
    }
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 { u64::from_le_bytes(read_8(buf, offset)) }

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

/// Outcome of reading one sequence from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadAt {
    Record(Bytes),
    /// Not written yet; it may appear later.
    NotPresent,
    /// Can never be in this cycle: past the end-of-cycle marker or beyond
    /// the roll cycle's sequence range.
    OutOfCycle,
}

/// Why the scan of committed records stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Empty,
    Sealed,
    Torn,
    Full,
}

struct WriteState {
    /// Offset one past the last complete record.
    position: u64,
    tail:     Tail,
}

/// One cycle's backing storage.
pub struct WireStore {
    cycle:       i64,
    roll_cycle:  RollCycle,
    epoch:       i64,
    file:        DataFile,
    flush_mode:  FlushMode,
    verify_crc:  bool,
    ref_count:   AtomicUsize,
    first_index: AtomicU64,
    write:       Mutex<WriteState>,
    /// File offset of each complete record, by sequence.
    positions:   RwLock<Vec<u64>>,
}

impl WireStore {
    /// Create a fresh cycle file of `block_size` bytes.
    pub fn create<P: AsRef<Path>>(
        path: P,
        roll_cycle: RollCycle,
        epoch: i64,
        cycle: i64,
        block_size: u64,
        flush_mode: FlushMode,
    ) -> Result<Self> {
        ensure!(
            block_size > STORE_HEADER_SIZE + record_disk_size(0) + RECORD_HEADER_SIZE,
            InvalidArgumentSnafu {
                message: format!("block size {block_size} cannot hold a record"),
            }
        );

        let file = DataFile::create(path, block_size)?;
        let header = StoreHeader {
            roll_cycle,
            epoch,
            cycle,
            first_index: None,
        }
        .encode();
        // readers treat the file as absent until the magic lands
        file.write_at(4, &header[4..])?;
        file.write_at(0, &header[..4])?;
        file.flush()?;

        debug!(cycle, path = ?file.path(), "Created cycle file");

        Ok(Self::from_parts(
            file, roll_cycle, epoch, cycle, None, flush_mode, false,
        ))
    }

    /// Open an existing cycle file, checking that it was written with the
    /// same roll cycle and epoch, and rebuild the record table.
    ///
    /// Returns `Ok(None)` when the file has no header yet.
    pub fn open<P: AsRef<Path>>(
        path: P,
        roll_cycle: RollCycle,
        epoch: i64,
        writable: bool,
        flush_mode: FlushMode,
        verify_crc: bool,
    ) -> Result<Option<Self>> {
        let path = path.as_ref();
        if std::fs::metadata(path)?.len() < STORE_HEADER_SIZE {
            debug!(path = ?path, "Cycle file shorter than its header");
            return Ok(None);
        }
        let file = DataFile::open(path, writable)?;
        if StoreHeader::is_blank(&file)? {
            debug!(path = ?path, "Cycle file has no header yet");
            return Ok(None);
        }
        let header = StoreHeader::read(&file)?;

        ensure!(
            header.roll_cycle == roll_cycle && header.epoch == epoch,
            RollCycleMismatchSnafu {
                expected: StoreHeader::describe(roll_cycle, epoch),
                found:    StoreHeader::describe(header.roll_cycle, header.epoch),
            }
        );

        let store = Self::from_parts(
            file,
            roll_cycle,
            epoch,
            header.cycle,
            header.first_index,
            flush_mode,
            verify_crc,
        );

        {
            let mut state = store.write.lock();
            store.catch_up(&mut state)?;
            debug!(
                cycle = store.cycle,
                records = store.positions.read().len(),
                position = state.position,
                tail = ?state.tail,
                "Opened cycle file"
            );
        }

        Ok(Some(store))
    }

    fn from_parts(
        file: DataFile,
        roll_cycle: RollCycle,
        epoch: i64,
        cycle: i64,
        first_index: Option<u64>,
        flush_mode: FlushMode,
        verify_crc: bool,
    ) -> Self {
        Self {
            cycle,
            roll_cycle,
            epoch,
            file,
            flush_mode,
            verify_crc,
            ref_count: AtomicUsize::new(1),
            first_index: AtomicU64::new(match first_index {
                Some(index) => index,
                None => FIRST_INDEX_UNSET,
            }),
            write: Mutex::new(WriteState {
                position: STORE_HEADER_SIZE,
                tail:     Tail::Empty,
            }),
            positions: RwLock::new(Vec::new()),
        }
    }

    pub const fn cycle(&self) -> i64 { self.cycle }

    pub const fn roll_cycle(&self) -> RollCycle { self.roll_cycle }

    pub const fn epoch(&self) -> i64 { self.epoch }

    pub fn path(&self) -> &Path { self.file.path() }

    /// Current number of reservations.
    pub fn ref_count(&self) -> usize { self.ref_count.load(Ordering::Acquire) }

    /// Adds a reservation if, and only if, the store is still live.
    pub fn reserve(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .is_ok()
    }

    /// Drops a reservation. Returns `true` for the call that took the count
    /// to zero; that caller owns teardown.
    pub fn release(&self) -> Result<bool> {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(previous) => Ok(previous == 1),
            Err(_) => StoreReleasedSnafu { cycle: self.cycle }.fail(),
        }
    }

    /// Flushes the mapping. The mapping itself is unmapped when the last
    /// handle to the store is dropped.
    pub fn close(&self) -> Result<()> { self.file.flush() }

    /// Index of the first record ever written to this cycle.
    pub fn first_index(&self) -> Option<u64> {
        let index = self.first_index.load(Ordering::Acquire);
        (index != FIRST_INDEX_UNSET).then_some(index)
    }

    /// Publishes the cycle's first index. Only the first caller wins; later
    /// callers get `false` and change nothing.
    pub fn write_header_if_absent(&self, index: u64) -> Result<bool> {
        if self
            .first_index
            .compare_exchange(
                FIRST_INDEX_UNSET,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }
        self.file.write_at(OFFSET_FIRST_INDEX as u64, &index.to_le_bytes())?;
        Ok(true)
    }

    /// Number of complete records, including ones appended by other store
    /// instances since the last look.
    pub fn entry_count(&self) -> Result<u64> {
        let mut state = self.write.lock();
        self.catch_up(&mut state)?;
        Ok(self.positions.read().len() as u64)
    }

    /// Offset one past the last complete record.
    pub fn write_position(&self) -> Result<u64> {
        let mut state = self.write.lock();
        self.catch_up(&mut state)?;
        Ok(state.position)
    }

    pub fn is_sealed(&self) -> Result<bool> {
        let mut state = self.write.lock();
        self.catch_up(&mut state)?;
        Ok(state.tail == Tail::Sealed)
    }

    /// Appends a record at the next sequence and returns that sequence.
    pub fn append(&self, payload: &[u8]) -> Result<u64> { self.write_record(None, payload) }

    /// Appends a record only if `sequence` is exactly the next sequence.
    pub fn append_at(&self, sequence: u64, payload: &[u8]) -> Result<u64> {
        self.write_record(Some(sequence), payload)
    }

    fn write_record(&self, expected: Option<u64>, payload: &[u8]) -> Result<u64> {
        ensure!(
            self.file.is_writable(),
            InvalidArgumentSnafu {
                message: format!("cycle {} is open read-only", self.cycle),
            }
        );
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|&len| len <= MAX_PAYLOAD_LEN)
            .context(InvalidArgumentSnafu {
                message: format!("payload of {} bytes is too large", payload.len()),
            })?;

        let mut state = self.write.lock();
        self.catch_up(&mut state)?;
        ensure!(
            state.tail != Tail::Sealed,
            CycleSealedSnafu { cycle: self.cycle }
        );

        let sequence = self.positions.read().len() as u64;
        if let Some(target) = expected {
            let index = self.roll_cycle.to_index(self.cycle, target)?;
            ensure!(target >= sequence, IndexBeforeCurrentSnafu { index });
            ensure!(target == sequence, IndexBeyondEndSnafu { index });
        }
        let index = self.roll_cycle.to_index(self.cycle, sequence)?;

        let position = state.position;
        if state.tail == Tail::Torn {
            let raw = self.file.read_u32(position)?;
            warn!(
                cycle = self.cycle,
                position,
                header = %format!("{raw:#x}"),
                "Discarding incomplete record left by an interrupted write"
            );
        }

        let disk_size = record_disk_size(u64::from(length));
        let needed = disk_size + RECORD_HEADER_SIZE;
        ensure!(
            position + needed <= self.file.size(),
            StoreFullSnafu {
                cycle:    self.cycle,
                needed,
                capacity: self.file.size() - position,
            }
        );

        // the zero after the record stops scanners at our end even when the
        // slot held a longer torn record
        self.file.write_u32(position + disk_size, 0)?;
        self.file.write_u32(position, NOT_COMPLETE | length)?;
        self.file.write_at(position + RECORD_HEADER_SIZE, payload)?;
        self.file.write_u32(
            position + RECORD_HEADER_SIZE + u64::from(length),
            calculate_record_crc(length, payload),
        )?;
        self.file.write_u32(position, length)?;

        if matches!(self.flush_mode, FlushMode::Sync) {
            self.file.flush()?;
        }

        self.positions.write().push(position);
        state.position = position + disk_size;
        state.tail = Tail::Empty;

        if sequence == 0 {
            self.write_header_if_absent(index)?;
        }

        debug!(cycle = self.cycle, sequence, offset = position, size = disk_size, "Wrote record");

        Ok(sequence)
    }

    /// Writes the end-of-cycle marker. Returns `false` when the cycle was
    /// already sealed.
    pub fn seal(&self) -> Result<bool> {
        let mut state = self.write.lock();
        self.catch_up(&mut state)?;
        if state.tail == Tail::Sealed {
            return Ok(false);
        }

        self.file.write_u32(state.position, END_OF_CYCLE)?;
        self.file.flush()?;
        state.tail = Tail::Sealed;

        debug!(cycle = self.cycle, position = state.position, "Sealed cycle");
        Ok(true)
    }

    /// Reads the record at `sequence`.
    pub fn read_at(&self, sequence: u64) -> Result<ReadAt> {
        if sequence > self.roll_cycle.max_sequence() {
            return Ok(ReadAt::OutOfCycle);
        }
        let Ok(slot) = usize::try_from(sequence) else {
            return Ok(ReadAt::OutOfCycle);
        };

        let known = self.positions.read().get(slot).copied();
        let position = match known {
            Some(position) => position,
            None => {
                let mut state = self.write.lock();
                self.catch_up(&mut state)?;
                let found = self.positions.read().get(slot).copied();
                match found {
                    Some(position) => position,
                    None if state.tail == Tail::Sealed => return Ok(ReadAt::OutOfCycle),
                    None => return Ok(ReadAt::NotPresent),
                }
            }
        };

        let RecordHeader::Complete(length) = RecordHeader::decode(self.file.read_u32(position)?)
        else {
            return CorruptedMessageSnafu {
                cycle: self.cycle,
                sequence,
            }
            .fail();
        };

        let mut payload = vec![0u8; length as usize];
        self.file.read_at(position + RECORD_HEADER_SIZE, &mut payload)?;
        let stored_crc = self
            .file
            .read_u32(position + RECORD_HEADER_SIZE + u64::from(length))?;
        ensure!(
            calculate_record_crc(length, &payload) == stored_crc,
            CorruptedMessageSnafu {
                cycle: self.cycle,
                sequence,
            }
        );

        Ok(ReadAt::Record(Bytes::from(payload)))
    }

    /// Extends the record table with complete records found past the
    /// current write position.
    fn catch_up(&self, state: &mut WriteState) -> Result<()> {
        if state.tail == Tail::Sealed {
            return Ok(());
        }

        let capacity = self.file.size();
        let mut discovered = Vec::new();
        let tail = loop {
            let position = state.position;
            if position + RECORD_HEADER_SIZE > capacity {
                break Tail::Full;
            }
            match RecordHeader::decode(self.file.read_u32(position)?) {
                RecordHeader::Empty => break Tail::Empty,
                RecordHeader::EndOfCycle => break Tail::Sealed,
                RecordHeader::Incomplete(_) => break Tail::Torn,
                RecordHeader::Complete(length) => {
                    let disk_size = record_disk_size(u64::from(length));
                    if position + disk_size > capacity || !self.crc_matches(position, length)? {
                        warn!(
                            cycle = self.cycle,
                            position, length, "Record failed validation, treating as torn"
                        );
                        break Tail::Torn;
                    }
                    discovered.push(position);
                    state.position = position + disk_size;
                }
            }
        };

        if !discovered.is_empty() {
            self.positions.write().extend(discovered);
        }
        state.tail = tail;
        Ok(())
    }

    fn crc_matches(&self, position: u64, length: u32) -> Result<bool> {
        if !self.verify_crc {
            return Ok(true);
        }
        let mut payload = vec![0u8; length as usize];
        self.file.read_at(position + RECORD_HEADER_SIZE, &mut payload)?;
        let stored = self
            .file
            .read_u32(position + RECORD_HEADER_SIZE + u64::from(length))?;
        Ok(calculate_record_crc(length, &payload) == stored)
    }
}

impl fmt::Debug for WireStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireStore")
            .field("cycle", &self.cycle)
            .field("roll_cycle", &self.roll_cycle)
            .field("path", &self.file.path())
            .field("ref_count", &self.ref_count())
            .finish_non_exhaustive()
    }
}
