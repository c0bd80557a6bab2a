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

use std::{
    collections::BTreeSet,
    fmt,
    ops::Bound,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    FlushMode, QueueConfig, Result,
    path::{cycle_file_path, scan_cycles},
    roll_cycle::RollCycle,
    store::WireStore,
    tailer::TailerDirection,
};

/// Locates or creates the backing store of a cycle and answers questions
/// about which cycles exist.
pub trait WireStoreSupplier: Send + Sync + fmt::Debug {
    /// Opens the store for `cycle`, creating it only when `create_if_absent`
    /// is set. `Ok(None)` means the cycle has no store.
    fn acquire(&self, cycle: i64, create_if_absent: bool) -> Result<Option<WireStore>>;

    /// Nearest existing cycle strictly after (`Forward`) or before
    /// (`Backward`) `current`.
    fn next_cycle(&self, current: i64, direction: TailerDirection) -> Result<Option<i64>>;

    /// Existing cycles in `lower..=upper`.
    fn cycles(&self, lower: i64, upper: i64) -> Result<BTreeSet<i64>>;
}

/// Supplier backed by one `.cq4` file per cycle in a directory.
#[derive(Debug, Clone)]
pub struct FileStoreSupplier {
    base_path:         PathBuf,
    roll_cycle:        RollCycle,
    epoch:             i64,
    block_size:        u64,
    flush_mode:        FlushMode,
    verify_on_startup: bool,
    read_only:         bool,
}

impl FileStoreSupplier {
    pub fn new(config: &QueueConfig, roll_cycle: RollCycle, epoch: i64) -> Self {
        Self {
            base_path: config.base_path.clone(),
            roll_cycle,
            epoch,
            block_size: config.block_size,
            flush_mode: config.flush_mode,
            verify_on_startup: config.verify_on_startup,
            read_only: config.read_only,
        }
    }

    pub fn base_path(&self) -> &Path { &self.base_path }
}

impl WireStoreSupplier for FileStoreSupplier {
    fn acquire(&self, cycle: i64, create_if_absent: bool) -> Result<Option<WireStore>> {
        let path = cycle_file_path(&self.base_path, self.roll_cycle, cycle)?;
        let create = create_if_absent && !self.read_only;

        if path.exists() {
            let opened = WireStore::open(
                &path,
                self.roll_cycle,
                self.epoch,
                !self.read_only,
                self.flush_mode,
                self.verify_on_startup,
            )?;
            if opened.is_some() || !create {
                return Ok(opened);
            }
            warn!(cycle, path = ?path, "Reinitialising cycle file that has no header");
        } else if !create {
            debug!(cycle, path = ?path, "No cycle file");
            return Ok(None);
        }

        WireStore::create(
            &path,
            self.roll_cycle,
            self.epoch,
            cycle,
            self.block_size,
            self.flush_mode,
        )
        .map(Some)
    }

    fn next_cycle(&self, current: i64, direction: TailerDirection) -> Result<Option<i64>> {
        let cycles = scan_cycles(&self.base_path, self.roll_cycle)?;
        Ok(match direction {
            TailerDirection::Forward => cycles
                .range((Bound::Excluded(current), Bound::Unbounded))
                .next()
                .copied(),
            TailerDirection::Backward => cycles.range(..current).next_back().copied(),
            TailerDirection::None => None,
        })
    }

    fn cycles(&self, lower: i64, upper: i64) -> Result<BTreeSet<i64>> {
        if lower > upper {
            return Ok(BTreeSet::new());
        }
        Ok(scan_cycles(&self.base_path, self.roll_cycle)?
            .range(lower..=upper)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn supplier(dir: &TempDir) -> FileStoreSupplier {
        let config = QueueConfig {
            base_path: dir.path().to_path_buf(),
            block_size: 64 * 1024,
            ..Default::default()
        };
        FileStoreSupplier::new(&config, RollCycle::Daily, 0)
    }

    #[test]
    fn test_acquire_without_create_returns_none() {
        let dir = TempDir::new().unwrap();
        let supplier = supplier(&dir);
        assert!(supplier.acquire(10, false).unwrap().is_none());
        assert!(supplier.acquire(10, true).unwrap().is_some());
        assert!(supplier.acquire(10, false).unwrap().is_some());
    }

    #[test]
    fn test_headerless_file_is_absent_until_created() {
        let dir = TempDir::new().unwrap();
        let supplier = supplier(&dir);
        let path = cycle_file_path(dir.path(), RollCycle::Daily, 2).unwrap();
        drop(crate::file::DataFile::create(&path, 64 * 1024).unwrap());

        assert!(supplier.acquire(2, false).unwrap().is_none());

        let store = supplier.acquire(2, true).unwrap().unwrap();
        assert_eq!(store.cycle(), 2);
        assert_eq!(store.append(b"x").unwrap(), 0);
        drop(store);
        assert_eq!(
            supplier.acquire(2, false).unwrap().unwrap().entry_count().unwrap(),
            1
        );
    }

    #[test]
    fn test_next_cycle_skips_gaps() {
        let dir = TempDir::new().unwrap();
        let supplier = supplier(&dir);
        for cycle in [1, 5, 9] {
            supplier.acquire(cycle, true).unwrap();
        }

        assert_eq!(supplier.next_cycle(1, TailerDirection::Forward).unwrap(), Some(5));
        assert_eq!(supplier.next_cycle(5, TailerDirection::Backward).unwrap(), Some(1));
        assert_eq!(supplier.next_cycle(9, TailerDirection::Forward).unwrap(), None);
        assert_eq!(supplier.next_cycle(1, TailerDirection::Backward).unwrap(), None);
        assert_eq!(supplier.next_cycle(i64::MIN, TailerDirection::Forward).unwrap(), Some(1));
        assert_eq!(supplier.next_cycle(5, TailerDirection::None).unwrap(), None);
    }

    #[test]
    fn test_cycles_between_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let supplier = supplier(&dir);
        for cycle in [1, 5, 9] {
            supplier.acquire(cycle, true).unwrap();
        }

        let cycles: Vec<_> = supplier.cycles(1, 5).unwrap().into_iter().collect();
        assert_eq!(cycles, vec![1, 5]);
        assert!(supplier.cycles(6, 8).unwrap().is_empty());
        assert!(supplier.cycles(9, 1).unwrap().is_empty());
    }
}
