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

use std::path::PathBuf;

use crate::roll_cycle::RollCycle;

/// Default capacity of a single cycle file.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Plain-data queue settings. Pluggable collaborators (clock, file
/// listener) live on [`crate::QueueBuilder`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_path:         PathBuf,
    /// `None` adopts the roll cycle recorded in existing cycle files and
    /// falls back to [`RollCycle::Daily`] for an empty directory.
    pub roll_cycle:        Option<RollCycle>,
    /// Offset in milliseconds applied before computing cycle numbers.
    /// `None` adopts the epoch of existing cycle files and falls back to 0.
    pub epoch:             Option<i64>,
    /// Size of each cycle file.
    pub block_size:        u64,
    pub flush_mode:        FlushMode,
    /// Check record checksums while scanning files at open.
    pub verify_on_startup: bool,
    pub read_only:         bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_path:         PathBuf::from("./queue_data"),
            roll_cycle:        None,
            epoch:             None,
            block_size:        DEFAULT_BLOCK_SIZE,
            flush_mode:        FlushMode::Async,
            verify_on_startup: true,
            read_only:         false,
        }
    }
}

/// When appended records are pushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Leave write-back to the OS; files are flushed on release and seal.
    #[default]
    Async,
    /// Flush after every record.
    Sync,
}
