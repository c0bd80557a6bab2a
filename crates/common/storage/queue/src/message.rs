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

//! Record types and on-disk record format.
//!
//! ## On-Disk Record Format
//!
//! Records are stored contiguously after the cycle file header:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┬─────────────────┐
//! │  Header (4B)    │   Payload (variable) │   CRC32 (4B)    │
//! │  little-endian  │   raw bytes          │   little-endian │
//! └─────────────────┴──────────────────────┴─────────────────┘
//! ```
//!
//! The header doubles as the commit flag:
//!
//! | header                     | meaning                                  |
//! |----------------------------|------------------------------------------|
//! | `0`                        | nothing written here yet                 |
//! | `0xC000_0000`              | end of cycle, the writer rolled on       |
//! | `0x8000_0000 \| len`       | write in progress, or torn by a crash    |
//! | `len`                      | complete record of `len` payload bytes   |
//!
//! A writer publishes `NOT_COMPLETE | len` before the payload and the plain
//! length after the CRC, so a reader never accepts a half-written payload.
//! The CRC covers the length and payload.

use bytes::Bytes;
use crc32fast::Hasher;

/// Size of the record header in bytes.
pub(crate) const RECORD_HEADER_SIZE: u64 = 4;

/// Size of the CRC32 checksum in bytes.
pub(crate) const RECORD_CRC_SIZE: u64 = 4;

/// Flag set while a record's payload is not yet complete.
pub(crate) const NOT_COMPLETE: u32 = 0x8000_0000;

/// Marker written where the next record would go once a cycle is finished.
pub(crate) const END_OF_CYCLE: u32 = 0xC000_0000;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD_LEN: u32 = 0x3FFF_FFFF;

/// `NOT_COMPLETE` with no length: a writer died before even recording the
/// size.
pub const NOT_COMPLETE_UNKNOWN_LENGTH: u32 = NOT_COMPLETE;

/// A record read from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Packed `(cycle, sequence)` index of the record.
    pub index:   u64,
    /// The record payload.
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn encoding(&self) -> RecordEncoding { RecordEncoding::detect(&self.payload) }
}

/// How a payload is encoded, decided from its first byte.
///
/// Binary payloads start with a byte whose high bit is set; anything else
/// (including an empty payload) is text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordEncoding {
    Binary,
    Text,
}

impl RecordEncoding {
    #[must_use]
    pub fn detect(payload: &[u8]) -> Self {
        match payload.first() {
            Some(b) if b & 0x80 != 0 => Self::Binary,
            _ => Self::Text,
        }
    }
}

/// What the header at some offset says lives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordHeader {
    Empty,
    EndOfCycle,
    /// `None` when the writer never recorded the length.
    Incomplete(Option<u32>),
    Complete(u32),
}

impl RecordHeader {
    pub(crate) const fn decode(raw: u32) -> Self {
        match raw {
            0 => Self::Empty,
            END_OF_CYCLE => Self::EndOfCycle,
            raw if raw & NOT_COMPLETE != 0 => match raw & MAX_PAYLOAD_LEN {
                0 => Self::Incomplete(None),
                len => Self::Incomplete(Some(len)),
            },
            len => Self::Complete(len),
        }
    }
}

/// Calculate the total on-disk size of a record given its payload length.
#[inline]
pub(crate) const fn record_disk_size(payload_len: u64) -> u64 {
    RECORD_HEADER_SIZE + payload_len + RECORD_CRC_SIZE
}

#[inline]
pub(crate) fn calculate_record_crc(length: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}
