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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error"), context(false))]
    Io {
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed on {}: {message}", path.display()))]
    MmapFailed { path: PathBuf, message: String },

    /// A cycle or sequence does not fit the roll cycle's index layout.
    #[snafu(display("Index overflow: cycle {cycle}, sequence {sequence} do not fit {roll_cycle}"))]
    IndexOverflow {
        roll_cycle: String,
        cycle:      i64,
        sequence:   u64,
    },

    /// The queue files were written with a different roll cycle or epoch.
    #[snafu(display("Roll cycle mismatch: queue opened with {expected} but files use {found}"))]
    RollCycleMismatch { expected: String, found: String },

    /// A cycle file header could not be understood.
    #[snafu(display("Invalid store header in {}: {reason}", path.display()))]
    InvalidStoreHeader { path: PathBuf, reason: String },

    /// Explicit-index write targets a record that already exists.
    #[snafu(display("Unable to move to index {index:#x} as the index already exists"))]
    IndexBeforeCurrent { index: u64 },

    /// Explicit-index write would leave a gap in the cycle.
    #[snafu(display("Unable to move to index {index:#x} beyond the end of the queue"))]
    IndexBeyondEnd { index: u64 },

    /// The cycle file has no room for the record.
    #[snafu(display("Store for cycle {cycle} is full: need {needed} bytes, capacity {capacity}"))]
    StoreFull {
        cycle:    i64,
        needed:   u64,
        capacity: u64,
    },

    /// The cycle was closed with an end-of-cycle marker.
    #[snafu(display("Cycle {cycle} is sealed and accepts no further records"))]
    CycleSealed { cycle: i64 },

    /// Release called on a store whose reservations are already gone.
    #[snafu(display("Store for cycle {cycle} was already released"))]
    StoreReleased { cycle: i64 },

    /// CRC mismatch detected during read.
    #[snafu(display("Corrupted message at cycle {cycle}, sequence {sequence}"))]
    CorruptedMessage { cycle: i64, sequence: u64 },

    /// Caller supplied an argument the queue cannot satisfy.
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument { message: String },

    /// Invalid filter pattern handed to the reader.
    #[snafu(display("Invalid pattern {pattern:?}"))]
    InvalidPattern {
        pattern: String,
        source:  regex::Error,
    },

    /// The queue (and its store pool) has been closed.
    #[snafu(display("Queue is closed"))]
    QueueClosed,

    /// Invariant violation inside the queue.
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

impl QueueError {
    /// Configuration errors are fatal to the calling operation and must not
    /// be retried.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::IndexOverflow { .. } | Self::RollCycleMismatch { .. }
        )
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
