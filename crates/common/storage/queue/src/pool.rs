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

//! Registry of live cycle stores.
//!
//! The pool hands out at most one [`WireStore`] per `(cycle, epoch)` key.
//! Every [`WireStorePool::acquire`] that returns a store holds one
//! reservation on it and must be paired with a [`WireStorePool::release`].
//! The caller whose release takes the count to zero removes the entry and
//! notifies the [`StoreFileListener`].
//!
//! Opening a store can be slow (file creation, mapping, scanning), so it
//! happens under a lock scoped to the key rather than under the registry
//! lock. Lookups for other cycles proceed meanwhile.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    Result,
    error::QueueClosedSnafu,
    store::WireStore,
    supplier::WireStoreSupplier,
    tailer::TailerDirection,
};

/// Pool key. The epoch is part of it so stores of queues with different
/// epochs never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RollDetails {
    pub cycle: i64,
    pub epoch: i64,
}

/// Notified when a cycle file comes into use and when it is let go.
pub trait StoreFileListener: Send + Sync + fmt::Debug {
    fn on_acquired(&self, _cycle: i64, _path: &Path) {}

    fn on_released(&self, _cycle: i64, _path: &Path) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStoreFileListener;

impl StoreFileListener for NoopStoreFileListener {}

pub struct WireStorePool {
    supplier: Arc<dyn WireStoreSupplier>,
    epoch:    i64,
    listener: Arc<dyn StoreFileListener>,
    stores:   Mutex<HashMap<RollDetails, Arc<WireStore>>>,
    /// One lock per key serializing store creation, present while some
    /// caller is opening that key.
    creating: Mutex<HashMap<RollDetails, Arc<Mutex<()>>>>,
    closed:   AtomicBool,
}

impl WireStorePool {
    pub fn new(
        supplier: Arc<dyn WireStoreSupplier>,
        epoch: i64,
        listener: Arc<dyn StoreFileListener>,
    ) -> Self {
        Self {
            supplier,
            epoch,
            listener,
            stores: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reserves the store for `cycle`, opening it through the supplier when
    /// it is not cached. `Ok(None)` when the cycle has no store and
    /// `create_if_absent` is false.
    pub fn acquire(&self, cycle: i64, create_if_absent: bool) -> Result<Option<Arc<WireStore>>> {
        ensure!(!self.is_closed(), QueueClosedSnafu);

        let key = RollDetails {
            cycle,
            epoch: self.epoch,
        };
        if let Some(store) = self.lookup(key) {
            return Ok(Some(store));
        }

        let creation = Arc::clone(self.creating.lock().entry(key).or_default());
        let acquired = {
            let _creating = creation.lock();
            self.open_store(key, create_if_absent)
        };
        self.forget_creation_lock(key, &creation);
        acquired
    }

    /// Runs under the key's creation lock.
    fn open_store(
        &self,
        key: RollDetails,
        create_if_absent: bool,
    ) -> Result<Option<Arc<WireStore>>> {
        if let Some(store) = self.lookup(key) {
            return Ok(Some(store));
        }

        let Some(store) = self.supplier.acquire(key.cycle, create_if_absent)? else {
            return Ok(None);
        };
        let store = Arc::new(store);

        {
            let mut stores = self.stores.lock();
            ensure!(!self.is_closed(), QueueClosedSnafu);
            stores.insert(key, Arc::clone(&store));
        }

        debug!(cycle = key.cycle, path = ?store.path(), "Acquired cycle store");
        self.listener.on_acquired(key.cycle, store.path());
        Ok(Some(store))
    }

    /// Drops the key's creation lock once no other caller is waiting on it.
    /// Handles are only cloned under the map lock, so the count is stable
    /// here.
    fn forget_creation_lock(&self, key: RollDetails, creation: &Arc<Mutex<()>>) {
        let mut creating = self.creating.lock();
        if Arc::strong_count(creation) == 2 {
            creating.remove(&key);
        }
    }

    fn lookup(&self, key: RollDetails) -> Option<Arc<WireStore>> {
        let stores = self.stores.lock();
        stores
            .get(&key)
            .filter(|store| store.reserve())
            .map(Arc::clone)
    }

    /// Drops one reservation. Releasing more often than acquiring fails with
    /// [`crate::QueueError::StoreReleased`].
    pub fn release(&self, store: &Arc<WireStore>) -> Result<()> {
        let key = RollDetails {
            cycle: store.cycle(),
            epoch: self.epoch,
        };

        let removed = {
            let mut stores = self.stores.lock();
            if !store.release()? {
                return Ok(());
            }
            let owned = stores
                .get(&key)
                .is_some_and(|cached| Arc::ptr_eq(cached, store));
            if owned {
                stores.remove(&key);
            }
            owned
        };

        store.close()?;
        if removed {
            debug!(cycle = key.cycle, path = ?store.path(), "Released cycle store");
            self.listener.on_released(key.cycle, store.path());
        }
        Ok(())
    }

    pub fn next_cycle(&self, current: i64, direction: TailerDirection) -> Result<Option<i64>> {
        self.supplier.next_cycle(current, direction)
    }

    /// Existing cycles in `lower..=upper`.
    pub fn list_cycles_between(&self, lower: i64, upper: i64) -> Result<BTreeSet<i64>> {
        self.supplier.cycles(lower, upper)
    }

    pub fn is_cached(&self, cycle: i64) -> bool {
        self.stores.lock().contains_key(&RollDetails {
            cycle,
            epoch: self.epoch,
        })
    }

    pub fn cached_count(&self) -> usize { self.stores.lock().len() }

    #[cfg(test)]
    fn creation_lock_count(&self) -> usize { self.creating.lock().len() }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Stops handing out stores and lets go of every cached one. Holders keep
    /// their handles until they release them.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<_> = self.stores.lock().drain().collect();
        for (key, store) in drained {
            if let Err(error) = store.close() {
                warn!(cycle = key.cycle, %error, "Failed to flush cycle store on close");
            }
            self.listener.on_released(key.cycle, store.path());
        }
    }
}

impl fmt::Debug for WireStorePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireStorePool")
            .field("epoch", &self.epoch)
            .field("cached", &self.cached_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use super::*;
    use crate::{QueueConfig, roll_cycle::RollCycle, supplier::FileStoreSupplier};

    #[derive(Debug, Default)]
    struct CountingListener {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl StoreFileListener for CountingListener {
        fn on_acquired(&self, _cycle: i64, _path: &Path) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }

        fn on_released(&self, _cycle: i64, _path: &Path) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails every acquire until `recover` is called.
    #[derive(Debug)]
    struct FlakySupplier {
        inner:  FileStoreSupplier,
        broken: AtomicBool,
    }

    impl FlakySupplier {
        fn recover(&self) { self.broken.store(false, Ordering::SeqCst); }
    }

    impl WireStoreSupplier for FlakySupplier {
        fn acquire(&self, cycle: i64, create_if_absent: bool) -> Result<Option<WireStore>> {
            if self.broken.load(Ordering::SeqCst) {
                return crate::error::InternalSnafu {
                    message: "disk unavailable",
                }
                .fail();
            }
            self.inner.acquire(cycle, create_if_absent)
        }

        fn next_cycle(&self, current: i64, direction: TailerDirection) -> Result<Option<i64>> {
            self.inner.next_cycle(current, direction)
        }

        fn cycles(&self, lower: i64, upper: i64) -> Result<BTreeSet<i64>> {
            self.inner.cycles(lower, upper)
        }
    }

    fn config(dir: &TempDir) -> QueueConfig {
        QueueConfig {
            base_path: dir.path().to_path_buf(),
            block_size: 64 * 1024,
            ..Default::default()
        }
    }

    fn pool(dir: &TempDir, listener: Arc<CountingListener>) -> WireStorePool {
        WireStorePool::new(
            Arc::new(FileStoreSupplier::new(&config(dir), RollCycle::Daily, 0)),
            0,
            listener,
        )
    }

    #[test]
    fn test_acquire_twice_release_twice() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(CountingListener::default());
        let pool = pool(&dir, Arc::clone(&listener));

        let first = pool.acquire(3, true).unwrap().unwrap();
        let second = pool.acquire(3, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(listener.acquired.load(Ordering::SeqCst), 1);

        pool.release(&first).unwrap();
        assert!(pool.is_cached(3));
        assert_eq!(listener.released.load(Ordering::SeqCst), 0);

        pool.release(&second).unwrap();
        assert!(!pool.is_cached(3));
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);

        assert!(pool.release(&first).is_err());
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, Arc::new(CountingListener::default()));

        assert!(pool.acquire(7, false).unwrap().is_none());
        assert_eq!(pool.cached_count(), 0);
    }

    #[test]
    fn test_reacquire_after_full_release_reopens() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(CountingListener::default());
        let pool = pool(&dir, Arc::clone(&listener));

        let store = pool.acquire(1, true).unwrap().unwrap();
        store.append(b"kept").unwrap();
        pool.release(&store).unwrap();

        let reopened = pool.acquire(1, false).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&store, &reopened));
        assert_eq!(reopened.entry_count().unwrap(), 1);
        assert_eq!(listener.acquired.load(Ordering::SeqCst), 2);
        pool.release(&reopened).unwrap();
    }

    #[test]
    fn test_concurrent_acquire_yields_one_store() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(CountingListener::default());
        let pool = pool(&dir, Arc::clone(&listener));

        let stores: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| pool.acquire(2, true).unwrap().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(stores.iter().all(|s| Arc::ptr_eq(s, &stores[0])));
        assert_eq!(stores[0].ref_count(), 8);
        assert_eq!(listener.acquired.load(Ordering::SeqCst), 1);

        for store in &stores {
            pool.release(store).unwrap();
        }
        assert_eq!(pool.cached_count(), 0);
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_supplier_failure_leaves_pool_unchanged() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(CountingListener::default());
        let supplier = Arc::new(FlakySupplier {
            inner:  FileStoreSupplier::new(&config(&dir), RollCycle::Daily, 0),
            broken: AtomicBool::new(true),
        });
        let pool = WireStorePool::new(
            Arc::clone(&supplier) as Arc<dyn WireStoreSupplier>,
            0,
            Arc::clone(&listener) as Arc<dyn StoreFileListener>,
        );

        assert!(matches!(
            pool.acquire(6, true),
            Err(crate::QueueError::Internal { .. })
        ));
        assert_eq!(pool.cached_count(), 0);
        assert_eq!(pool.creation_lock_count(), 0);
        assert_eq!(listener.acquired.load(Ordering::SeqCst), 0);

        supplier.recover();
        let store = pool.acquire(6, true).unwrap().unwrap();
        assert_eq!(store.ref_count(), 1);
        assert_eq!(listener.acquired.load(Ordering::SeqCst), 1);
        pool.release(&store).unwrap();
        assert_eq!(pool.cached_count(), 0);
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_creation_locks_are_pruned() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, Arc::new(CountingListener::default()));

        for cycle in 0..16 {
            let store = pool.acquire(cycle, true).unwrap().unwrap();
            pool.release(&store).unwrap();
        }
        assert!(pool.acquire(99, false).unwrap().is_none());
        assert_eq!(pool.creation_lock_count(), 0);
    }

    #[test]
    fn test_close_rejects_acquire_and_notifies_once() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(CountingListener::default());
        let pool = pool(&dir, Arc::clone(&listener));

        let store = pool.acquire(4, true).unwrap().unwrap();
        pool.close();
        pool.close();
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.acquire(4, true),
            Err(crate::QueueError::QueueClosed)
        ));

        pool.release(&store).unwrap();
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);
    }
}
