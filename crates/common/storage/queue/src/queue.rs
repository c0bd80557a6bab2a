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

//! Main queue struct and lifecycle management.
//!
//! The [`Queue`] is the entry point of the library. It:
//! - Settles the roll cycle, adopting the one recorded in existing files
//! - Owns the [`WireStorePool`] shared by all appenders and tailers
//! - Hands out [`Appender`]s and [`Tailer`]s
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/path/to/queue")
//!     .roll_cycle(RollCycle::Daily)
//!     .build()?;
//!
//! let mut appender = queue.acquire_appender()?;
//! let index = appender.write_text("hello")?;
//!
//! let mut tailer = queue.create_tailer()?;
//! while let Some(msg) = tailer.read_next()? {
//!     println!("{index:#x}: {:?}", msg.payload);
//! }
//!
//! queue.close();
//! ```

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use snafu::ensure;
use tracing::{info, warn};

use crate::{
    QueueConfig, Result,
    appender::Appender,
    error::{InvalidArgumentSnafu, QueueClosedSnafu, RollCycleMismatchSnafu},
    path::{cycle_file_path, scan_cycle_files},
    pool::{StoreFileListener, WireStorePool},
    roll_cycle::RollCycle,
    store::{StoreHeader, WireStore},
    supplier::FileStoreSupplier,
    tailer::{Tailer, TailerDirection},
    time::TimeProvider,
};

/// A persistent append-only queue rolled into one file per cycle.
pub struct Queue {
    config:     QueueConfig,
    roll_cycle: RollCycle,
    epoch:      i64,
    pool:       Arc<WireStorePool>,
    clock:      Arc<dyn TimeProvider>,
    closed:     AtomicBool,
}

impl Queue {
    pub(crate) fn open(
        mut config: QueueConfig,
        clock: Arc<dyn TimeProvider>,
        listener: Arc<dyn StoreFileListener>,
    ) -> Result<Self> {
        if !config.read_only {
            std::fs::create_dir_all(&config.base_path)?;
        }

        let (roll_cycle, epoch) = resolve_roll_cycle(&config)?;
        config.roll_cycle = Some(roll_cycle);
        config.epoch = Some(epoch);
        let supplier = FileStoreSupplier::new(&config, roll_cycle, epoch);
        let pool = Arc::new(WireStorePool::new(Arc::new(supplier), epoch, listener));

        info!(
            path = ?config.base_path,
            %roll_cycle,
            epoch,
            read_only = config.read_only,
            "Queue opened"
        );

        Ok(Self {
            config,
            roll_cycle,
            epoch,
            pool,
            clock,
            closed: AtomicBool::new(false),
        })
    }

    /// Create an appender writing to the current cycle.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or was opened read-only.
    pub fn acquire_appender(&self) -> Result<Appender> {
        ensure!(!self.is_closed(), QueueClosedSnafu);
        ensure!(
            !self.config.read_only,
            InvalidArgumentSnafu {
                message: "queue is open read-only",
            }
        );
        Ok(Appender::new(
            Arc::clone(&self.pool),
            self.roll_cycle,
            self.epoch,
            Arc::clone(&self.clock),
        ))
    }

    /// Create a forward tailer that starts at the first record on its first
    /// read.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed.
    pub fn create_tailer(&self) -> Result<Tailer> {
        ensure!(!self.is_closed(), QueueClosedSnafu);
        Ok(Tailer::new(Arc::clone(&self.pool), self.roll_cycle))
    }

    /// Reserve the store of `cycle`, creating it when `create` is set. Pair
    /// with [`Queue::release_store`].
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or the store cannot be opened.
    pub fn store_for_cycle(&self, cycle: i64, create: bool) -> Result<Option<Arc<WireStore>>> {
        self.pool.acquire(cycle, create && !self.config.read_only)
    }

    /// # Errors
    ///
    /// Fails when the store has no reservation left.
    pub fn release_store(&self, store: &Arc<WireStore>) -> Result<()> { self.pool.release(store) }

    /// # Errors
    ///
    /// Fails when the queue directory cannot be read.
    pub fn first_cycle(&self) -> Result<Option<i64>> {
        self.pool.next_cycle(i64::MIN, TailerDirection::Forward)
    }

    /// # Errors
    ///
    /// Fails when the queue directory cannot be read.
    pub fn last_cycle(&self) -> Result<Option<i64>> {
        self.pool.next_cycle(i64::MAX, TailerDirection::Backward)
    }

    /// Index of the oldest record in the queue.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or a store cannot be opened.
    pub fn first_index(&self) -> Result<Option<u64>> {
        self.find_index(TailerDirection::Forward)
    }

    /// Index of the newest record in the queue.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or a store cannot be opened.
    pub fn last_index(&self) -> Result<Option<u64>> { self.find_index(TailerDirection::Backward) }

    fn find_index(&self, direction: TailerDirection) -> Result<Option<u64>> {
        let mut from = match direction {
            TailerDirection::Backward => i64::MAX,
            TailerDirection::Forward | TailerDirection::None => i64::MIN,
        };
        while let Some(cycle) = self.pool.next_cycle(from, direction)? {
            from = cycle;
            let Some(store) = self.pool.acquire(cycle, false)? else {
                continue;
            };
            let count = store.entry_count();
            self.pool.release(&store)?;
            let count = count?;
            if count == 0 {
                continue;
            }
            let sequence = match direction {
                TailerDirection::Backward => count - 1,
                TailerDirection::Forward | TailerDirection::None => 0,
            };
            return self.roll_cycle.to_index(cycle, sequence).map(Some);
        }
        Ok(None)
    }

    /// Cycle the clock is in now.
    #[must_use]
    pub fn cycle(&self) -> i64 {
        self.roll_cycle
            .cycle_of(self.epoch, self.clock.current_time_millis())
    }

    #[must_use]
    pub const fn roll_cycle(&self) -> RollCycle { self.roll_cycle }

    #[must_use]
    pub const fn epoch(&self) -> i64 { self.epoch }

    /// Path of the file that backs (or would back) `cycle`.
    ///
    /// # Errors
    ///
    /// Fails when the cycle cannot be formatted as a file name.
    pub fn file_for_cycle(&self, cycle: i64) -> Result<PathBuf> {
        cycle_file_path(&self.config.base_path, self.roll_cycle, cycle)
    }

    #[must_use]
    pub fn base_path(&self) -> &Path { &self.config.base_path }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig { &self.config }

    #[must_use]
    pub const fn pool(&self) -> &Arc<WireStorePool> { &self.pool }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Close the queue. Later acquisitions fail with
    /// [`crate::QueueError::QueueClosed`]; calling it again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close();
        info!(path = ?self.config.base_path, "Queue closed");
    }
}

impl Drop for Queue {
    fn drop(&mut self) { self.close(); }
}

/// Picks the roll cycle and epoch for `config`, checking whatever was set
/// explicitly against the header of the first initialised cycle file.
fn resolve_roll_cycle(config: &QueueConfig) -> Result<(RollCycle, i64)> {
    let mut header = None;
    for path in scan_cycle_files(&config.base_path)? {
        if let Some(found) = StoreHeader::read_path(&path)? {
            header = Some((path, found));
            break;
        }
        warn!(file = ?path, "Skipping cycle file without a header");
    }
    let Some((first, header)) = header else {
        return Ok((
            config.roll_cycle.unwrap_or_default(),
            config.epoch.unwrap_or_default(),
        ));
    };

    let roll_cycle = config.roll_cycle.unwrap_or(header.roll_cycle);
    let epoch = config.epoch.unwrap_or(header.epoch);
    ensure!(
        roll_cycle == header.roll_cycle && epoch == header.epoch,
        RollCycleMismatchSnafu {
            expected: format!("{roll_cycle} (epoch {epoch})"),
            found:    format!("{} (epoch {})", header.roll_cycle, header.epoch),
        }
    );

    if config.roll_cycle.is_none() || config.epoch.is_none() {
        info!(
            %roll_cycle,
            epoch,
            file = ?first,
            "Adopting roll cycle of existing queue files"
        );
    }
    Ok((roll_cycle, epoch))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{QueueBuilder, QueueError, file::DataFile, time::SetTimeProvider};

    const DAY_MS: i64 = 86_400_000;

    fn clock(cycle: i64) -> Arc<dyn TimeProvider> { Arc::new(SetTimeProvider::new(cycle * DAY_MS)) }

    #[test]
    fn test_defaults_to_daily() {
        let dir = TempDir::new().unwrap();
        let queue = QueueBuilder::new(dir.path()).build().unwrap();
        assert_eq!(queue.roll_cycle(), RollCycle::Daily);
        assert_eq!(queue.first_cycle().unwrap(), None);
        assert_eq!(queue.first_index().unwrap(), None);
    }

    #[test]
    fn test_adopts_roll_cycle_from_files() {
        let dir = TempDir::new().unwrap();
        {
            let queue = QueueBuilder::new(dir.path())
                .roll_cycle(RollCycle::Hourly)
                .block_size(64 * 1024)
                .build()
                .unwrap();
            queue.acquire_appender().unwrap().write_text("x").unwrap();
        }

        let queue = QueueBuilder::new(dir.path()).build().unwrap();
        assert_eq!(queue.roll_cycle(), RollCycle::Hourly);
        assert!(queue.last_index().unwrap().is_some());
    }

    #[test]
    fn test_rejects_mismatched_roll_cycle() {
        let dir = TempDir::new().unwrap();
        {
            let queue = QueueBuilder::new(dir.path())
                .roll_cycle(RollCycle::Hourly)
                .block_size(64 * 1024)
                .build()
                .unwrap();
            queue.acquire_appender().unwrap().write_text("x").unwrap();
        }

        let err = QueueBuilder::new(dir.path())
            .roll_cycle(RollCycle::Minutely)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::RollCycleMismatch { .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_explicit_epoch_must_match_files() {
        let dir = TempDir::new().unwrap();
        {
            let queue = QueueBuilder::new(dir.path())
                .roll_cycle(RollCycle::Hourly)
                .block_size(64 * 1024)
                .build()
                .unwrap();
            queue.acquire_appender().unwrap().write_text("x").unwrap();
        }

        let err = QueueBuilder::new(dir.path())
            .epoch(3_600_000)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::RollCycleMismatch { .. }));

        let queue = QueueBuilder::new(dir.path()).epoch(0).build().unwrap();
        assert_eq!(queue.roll_cycle(), RollCycle::Hourly);
        assert_eq!(queue.epoch(), 0);
        assert_eq!(queue.config().epoch, Some(0));
    }

    #[test]
    fn test_open_skips_headerless_first_file() {
        let dir = TempDir::new().unwrap();
        {
            let queue = QueueBuilder::new(dir.path())
                .roll_cycle(RollCycle::TestDaily)
                .block_size(64 * 1024)
                .time_provider(clock(5))
                .build()
                .unwrap();
            queue.acquire_appender().unwrap().write_text("x").unwrap();
            let path = queue.file_for_cycle(1).unwrap();
            drop(DataFile::create(&path, 64 * 1024).unwrap());
        }

        let queue = QueueBuilder::new(dir.path()).build().unwrap();
        assert_eq!(queue.roll_cycle(), RollCycle::TestDaily);
        assert_eq!(queue.first_index().unwrap(), Some(0x0005_0000_0000));
    }

    #[test]
    fn test_first_and_last_index_span_cycles() {
        let dir = TempDir::new().unwrap();
        let queue = QueueBuilder::new(dir.path())
            .roll_cycle(RollCycle::TestDaily)
            .block_size(64 * 1024)
            .time_provider(clock(3))
            .build()
            .unwrap();

        let mut appender = queue.acquire_appender().unwrap();
        appender.write_bytes_at_index(0x0001_0000_0000, b"c1").unwrap();
        appender.write_bytes_at_index(0x0003_0000_0000, b"c3-0").unwrap();
        appender.write_bytes_at_index(0x0003_0000_0001, b"c3-1").unwrap();

        // an empty cycle file at either end is skipped
        let empty = queue.store_for_cycle(7, true).unwrap().unwrap();
        queue.release_store(&empty).unwrap();

        assert_eq!(queue.first_cycle().unwrap(), Some(1));
        assert_eq!(queue.last_cycle().unwrap(), Some(7));
        assert_eq!(queue.first_index().unwrap(), Some(0x0001_0000_0000));
        assert_eq!(queue.last_index().unwrap(), Some(0x0003_0000_0001));
        assert_eq!(queue.cycle(), 3);
    }

    #[test]
    fn test_read_only_queue() {
        let dir = TempDir::new().unwrap();
        {
            let queue = QueueBuilder::new(dir.path())
                .block_size(64 * 1024)
                .build()
                .unwrap();
            queue.acquire_appender().unwrap().write_text("ro").unwrap();
        }

        let queue = QueueBuilder::new(dir.path()).read_only(true).build().unwrap();
        assert!(queue.acquire_appender().is_err());
        let mut tailer = queue.create_tailer().unwrap();
        let message = tailer.read_next().unwrap().unwrap();
        assert_eq!(message.payload.as_ref(), b"ro");
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = QueueBuilder::new(dir.path())
            .block_size(64 * 1024)
            .build()
            .unwrap();
        queue.close();
        queue.close();
        assert!(matches!(
            queue.acquire_appender(),
            Err(QueueError::QueueClosed)
        ));
        assert!(matches!(queue.create_tailer(), Err(QueueError::QueueClosed)));
    }
}
