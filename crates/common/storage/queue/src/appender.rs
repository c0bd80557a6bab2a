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

//! Message writer (appender) for producing to the queue.
//!
//! An [`Appender`] holds at most one cycle store at a time. Each write
//! derives the current cycle from the queue's clock; when it differs from the
//! held cycle the appender acquires (creating if needed) the new cycle's
//! store, seals the old one with an end-of-cycle marker and releases it.
//!
//! ## Concurrency
//!
//! An appender is used from one thread. Several appenders in one process
//! share the pooled store of a cycle, whose write lock gives their records a
//! total order.

use std::sync::Arc;

use bytes::BytesMut;
use snafu::{OptionExt, ensure};
use tracing::{info, warn};

use crate::{
    Result,
    document::WriteContext,
    error::{IndexBeyondEndSnafu, InternalSnafu, QueueClosedSnafu},
    pool::WireStorePool,
    roll_cycle::RollCycle,
    store::WireStore,
    time::TimeProvider,
};

/// A writer for appending messages to the queue.
pub struct Appender {
    pool:       Arc<WireStorePool>,
    roll_cycle: RollCycle,
    epoch:      i64,
    clock:      Arc<dyn TimeProvider>,
    /// Store of the cycle last written to.
    store:      Option<Arc<WireStore>>,
    last_index: Option<u64>,
}

impl Appender {
    pub(crate) fn new(
        pool: Arc<WireStorePool>,
        roll_cycle: RollCycle,
        epoch: i64,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            pool,
            roll_cycle,
            epoch,
            clock,
            store: None,
            last_index: None,
        }
    }

    /// Append `payload` to the current cycle and return its index.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed, the cycle store cannot be created or
    /// has no room left, or the cycle's sequence space is exhausted.
    pub fn write_bytes(&mut self, payload: &[u8]) -> Result<u64> {
        let store = self.store_for_now()?;
        let sequence = store.append(payload)?;
        let index = self.roll_cycle.to_index(store.cycle(), sequence)?;
        self.last_index = Some(index);
        Ok(index)
    }

    /// Append a UTF-8 text record.
    ///
    /// # Errors
    ///
    /// See [`Appender::write_bytes`].
    pub fn write_text(&mut self, text: &str) -> Result<u64> { self.write_bytes(text.as_bytes()) }

    /// Build a record with `writer` and append it. Nothing is written when
    /// `writer` fails.
    ///
    /// # Errors
    ///
    /// The writer's error, or any error of [`Appender::write_bytes`].
    pub fn write_document<F>(&mut self, writer: F) -> Result<u64>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        let mut buf = BytesMut::new();
        writer(&mut buf)?;
        self.write_bytes(&buf)
    }

    /// Open a scoped write. The record is appended by
    /// [`WriteContext::commit`]; dropping the context discards it.
    pub fn writing_document(&mut self) -> WriteContext<'_> { WriteContext::new(self) }

    /// Write `payload` at exactly `index`, e.g. when replaying a known
    /// sequence of records into another queue. A missing cycle store is only
    /// created for the cycle's first sequence, and is never sealed by this
    /// call. A rejected write leaves the appender on the store it held.
    ///
    /// # Errors
    ///
    /// [`crate::QueueError::IndexBeforeCurrent`] when the slot is already
    /// written and [`crate::QueueError::IndexBeyondEnd`] when it is not the
    /// next free slot of its cycle.
    pub fn write_bytes_at_index(&mut self, index: u64, payload: &[u8]) -> Result<()> {
        ensure!(!self.pool.is_closed(), QueueClosedSnafu);
        let (cycle, sequence) = self.roll_cycle.unpack(index);

        if let Some(store) = self.store.as_ref().filter(|store| store.cycle() == cycle) {
            store.append_at(sequence, payload)?;
            self.last_index = Some(index);
            return Ok(());
        }

        let Some(store) = self.pool.acquire(cycle, sequence == 0)? else {
            return IndexBeyondEndSnafu { index }.fail();
        };
        if let Err(error) = store.append_at(sequence, payload) {
            self.pool.release(&store)?;
            return Err(error);
        }
        if let Some(previous) = self.store.replace(store) {
            self.pool.release(&previous)?;
        }
        self.last_index = Some(index);
        Ok(())
    }

    /// Index of the last record this appender wrote.
    #[must_use]
    pub const fn last_index_appended(&self) -> Option<u64> { self.last_index }

    /// Cycle of the store currently held.
    #[must_use]
    pub fn cycle(&self) -> Option<i64> { self.store.as_ref().map(|store| store.cycle()) }

    fn store_for_now(&mut self) -> Result<Arc<WireStore>> {
        let cycle = self
            .roll_cycle
            .cycle_of(self.epoch, self.clock.current_time_millis());
        self.switch_to(cycle)
    }

    fn switch_to(&mut self, cycle: i64) -> Result<Arc<WireStore>> {
        ensure!(!self.pool.is_closed(), QueueClosedSnafu);

        if let Some(store) = &self.store
            && store.cycle() == cycle
        {
            return Ok(Arc::clone(store));
        }

        let next = self
            .pool
            .acquire(cycle, true)?
            .context(InternalSnafu {
                message: format!("no store created for cycle {cycle}"),
            })?;

        if let Some(previous) = self.store.replace(Arc::clone(&next)) {
            let sealed = if previous.cycle() < cycle {
                info!(from = previous.cycle(), to = cycle, "Rolling to new cycle");
                previous.seal().map(|_| ())
            } else {
                Ok(())
            };
            self.pool.release(&previous)?;
            sealed?;
        }

        Ok(next)
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if let Some(store) = self.store.take()
            && let Err(error) = self.pool.release(&store)
        {
            warn!(cycle = store.cycle(), %error, "Failed to release appender store");
        }
    }
}
