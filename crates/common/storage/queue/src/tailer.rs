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

//! Message reader (tailer) for consuming from the queue.
//!
//! A [`Tailer`] keeps a cursor `(cycle, sequence)` and a direction. Reads
//! never block: when the record under the cursor has not been written yet
//! the read returns `Ok(None)` and the caller decides whether to poll.
//!
//! Cycles may be sparse. Moving between cycles always goes through
//! [`WireStorePool::next_cycle`], so empty days are skipped in either
//! direction. The store of the cycle being left is released only once the
//! next one is held, and a move that finds nothing leaves the cursor where
//! it was.
//!
//! A tailer is not thread-safe; use one per reading thread.

use std::sync::Arc;

use snafu::ensure;
use tracing::{debug, trace, warn};

use crate::{
    Result,
    document::ReadContext,
    error::QueueClosedSnafu,
    message::Message,
    pool::WireStorePool,
    roll_cycle::RollCycle,
    store::{ReadAt, WireStore},
};

/// Direction a tailer moves after each read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailerDirection {
    /// Stay on the same record.
    None,
    #[default]
    Forward,
    Backward,
}

pub struct Tailer {
    pool:         Arc<WireStorePool>,
    roll_cycle:   RollCycle,
    direction:    TailerDirection,
    cycle:        i64,
    sequence:     u64,
    /// Store of `cycle`, if that cycle has one.
    store:        Option<Arc<WireStore>>,
    initialised:  bool,
    /// Reading backward went past the first record of the queue.
    before_start: bool,
}

impl Tailer {
    pub(crate) fn new(pool: Arc<WireStorePool>, roll_cycle: RollCycle) -> Self {
        Self {
            pool,
            roll_cycle,
            direction: TailerDirection::Forward,
            cycle: 0,
            sequence: 0,
            store: None,
            initialised: false,
            before_start: false,
        }
    }

    /// Read the record under the cursor and move past it.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed, a store cannot be opened, or the
    /// record fails its checksum.
    pub fn read_next(&mut self) -> Result<Option<Message>> {
        let Some(message) = self.locate()? else {
            return Ok(None);
        };
        self.advance()?;
        Ok(Some(message))
    }

    /// Open a scoped read of the record under the cursor. The cursor moves
    /// past the record when the context is dropped.
    ///
    /// # Errors
    ///
    /// See [`Tailer::read_next`].
    pub fn reading_document(&mut self) -> Result<ReadContext<'_>> {
        let message = self.locate()?;
        Ok(ReadContext::new(self, message))
    }

    /// Hand the record under the cursor to `reader`. The cursor only moves
    /// when `reader` succeeds.
    ///
    /// # Errors
    ///
    /// The reader's error, or any error of [`Tailer::read_next`].
    pub fn read_document<T, F>(&mut self, reader: F) -> Result<Option<T>>
    where
        F: FnOnce(&Message) -> Result<T>,
    {
        let Some(message) = self.locate()? else {
            return Ok(None);
        };
        let value = reader(&message)?;
        self.advance()?;
        Ok(Some(value))
    }

    /// Position the cursor just past the record at `index`, so the next read
    /// returns its neighbour in the current direction.
    ///
    /// Returns `false`, without moving, when the cycle has no store or the
    /// record has not been written.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or a store cannot be opened.
    pub fn move_to_index(&mut self, index: u64) -> Result<bool> {
        let (cycle, sequence) = self.roll_cycle.unpack(index);
        if self
            .position_at(cycle, sequence, |count| sequence < count)?
            .is_none()
        {
            return Ok(false);
        }
        self.advance()?;
        Ok(true)
    }

    /// Position the cursor on `index`, so the next read returns that record.
    ///
    /// Returns `true` when the record exists or is the next one to be
    /// written in its cycle. Otherwise the cursor stays put.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or a store cannot be opened.
    pub fn seek(&mut self, index: u64) -> Result<bool> {
        let (cycle, sequence) = self.roll_cycle.unpack(index);
        Ok(self
            .position_at(cycle, sequence, |count| sequence <= count)?
            .is_some())
    }

    /// Move to the first record of the first cycle.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or a store cannot be opened.
    pub fn to_start(&mut self) -> Result<()> {
        let mut from = i64::MIN;
        while let Some(first) = self.pool.next_cycle(from, TailerDirection::Forward)? {
            if self.position_at(first, 0, |_| true)?.is_some() {
                return Ok(());
            }
            from = first;
        }
        self.reset();
        Ok(())
    }

    /// Move past the last record of the last cycle. Reading backward from
    /// here returns the last record first.
    ///
    /// # Errors
    ///
    /// Fails when the queue is closed or a store cannot be opened.
    pub fn to_end(&mut self) -> Result<()> {
        let mut from = i64::MAX;
        while let Some(last) = self.pool.next_cycle(from, TailerDirection::Backward)? {
            if let Some(count) = self.position_at(last, 0, |_| true)? {
                self.sequence = count;
                return Ok(());
            }
            from = last;
        }
        self.reset();
        Ok(())
    }

    pub fn direction(&mut self, direction: TailerDirection) -> &mut Self {
        if direction == TailerDirection::Forward {
            self.before_start = false;
        }
        self.direction = direction;
        self
    }

    #[must_use]
    pub const fn current_direction(&self) -> TailerDirection { self.direction }

    /// Index of the cursor.
    ///
    /// # Errors
    ///
    /// Fails when the cursor does not fit the roll cycle's index layout.
    pub fn index(&self) -> Result<u64> { self.roll_cycle.to_index(self.cycle, self.sequence) }

    #[must_use]
    pub const fn current_cycle(&self) -> i64 { self.cycle }

    /// Finds the record under the cursor without moving past it, rolling
    /// across cycles where the cursor has run off the end of one.
    fn locate(&mut self) -> Result<Option<Message>> {
        ensure!(!self.pool.is_closed(), QueueClosedSnafu);

        if !self.initialised {
            if self.direction == TailerDirection::Backward {
                self.to_end()?;
            } else {
                self.to_start()?;
            }
            if !self.initialised {
                return Ok(None);
            }
        }

        loop {
            if self.before_start {
                return Ok(None);
            }

            let store = match &self.store {
                Some(store) => Arc::clone(store),
                None => {
                    let Some(store) = self.pool.acquire(self.cycle, false)? else {
                        if self.roll(self.reading_direction())? {
                            continue;
                        }
                        return Ok(None);
                    };
                    self.store = Some(Arc::clone(&store));
                    store
                }
            };

            match store.read_at(self.sequence)? {
                ReadAt::Record(payload) => {
                    let index = self.roll_cycle.to_index(self.cycle, self.sequence)?;
                    return Ok(Some(Message { index, payload }));
                }
                outcome => {
                    if self.direction == TailerDirection::Backward {
                        let count = store.entry_count()?;
                        if count > 0 && self.sequence >= count {
                            self.sequence = count - 1;
                            continue;
                        }
                        if !self.roll(TailerDirection::Backward)? {
                            self.before_start = true;
                            return Ok(None);
                        }
                        continue;
                    }

                    // an unsealed cycle may still grow, so only move on once
                    // a later cycle exists
                    if !self.roll(TailerDirection::Forward)? {
                        trace!(
                            cycle = self.cycle,
                            sequence = self.sequence,
                            ?outcome,
                            "End of data"
                        );
                        return Ok(None);
                    }
                }
            }
        }
    }

    const fn reading_direction(&self) -> TailerDirection {
        match self.direction {
            TailerDirection::Backward => TailerDirection::Backward,
            TailerDirection::Forward | TailerDirection::None => TailerDirection::Forward,
        }
    }

    /// Moves the cursor past the record it is on.
    pub(crate) fn advance(&mut self) -> Result<()> {
        match self.direction {
            TailerDirection::Forward => self.sequence += 1,
            TailerDirection::None => {}
            TailerDirection::Backward => {
                if self.sequence > 0 {
                    self.sequence -= 1;
                } else if !self.roll(TailerDirection::Backward)? {
                    self.before_start = true;
                }
            }
        }
        Ok(())
    }

    /// Moves to the nearest cycle with a store in `direction`: its first
    /// record going forward, its last record going backward. Leaves the
    /// cursor alone and returns `false` when there is none.
    fn roll(&mut self, direction: TailerDirection) -> Result<bool> {
        let mut from = self.cycle;
        while let Some(next) = self.pool.next_cycle(from, direction)? {
            // skips files that vanished after listing or have no header
            if let Some(count) = self.position_at(next, 0, |_| true)? {
                debug!(from, to = next, ?direction, "Tailer rolled cycle");
                if direction == TailerDirection::Backward {
                    self.sequence = count.saturating_sub(1);
                }
                return Ok(true);
            }
            from = next;
        }
        Ok(false)
    }

    /// Puts the cursor on `(cycle, sequence)` if `cycle` has a store whose
    /// record count satisfies `accept`, and returns that count. Otherwise
    /// returns `None` with the cursor and the held store untouched.
    fn position_at(
        &mut self,
        cycle: i64,
        sequence: u64,
        accept: impl FnOnce(u64) -> bool,
    ) -> Result<Option<u64>> {
        let held = self
            .store
            .as_ref()
            .filter(|store| store.cycle() == cycle)
            .map(Arc::clone);
        let (store, acquired) = match held {
            Some(store) => (store, false),
            None => match self.pool.acquire(cycle, false)? {
                Some(store) => (store, true),
                None => return Ok(None),
            },
        };

        let count = store.entry_count();
        if !count.as_ref().is_ok_and(|&count| accept(count)) {
            if acquired {
                self.pool.release(&store)?;
            }
            return count.map(|_| None);
        }

        if acquired {
            self.release_store();
            self.store = Some(store);
        }
        self.cycle = cycle;
        self.sequence = sequence;
        self.initialised = true;
        self.before_start = false;
        count.map(Some)
    }

    fn reset(&mut self) {
        self.release_store();
        self.cycle = 0;
        self.sequence = 0;
        self.initialised = false;
        self.before_start = false;
    }

    fn release_store(&mut self) {
        if let Some(store) = self.store.take()
            && let Err(error) = self.pool.release(&store)
        {
            warn!(cycle = store.cycle(), %error, "Failed to release tailer store");
        }
    }
}

impl Iterator for Tailer {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> { self.read_next().transpose() }
}

impl Drop for Tailer {
    fn drop(&mut self) { self.release_store(); }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::{Queue, QueueBuilder, time::SetTimeProvider};

    const DAY_MS: i64 = 86_400_000;

    fn queue(dir: &TempDir, clock: &Arc<SetTimeProvider>) -> Queue {
        QueueBuilder::new(dir.path())
            .roll_cycle(RollCycle::TestDaily)
            .block_size(64 * 1024)
            .time_provider(Arc::clone(clock) as Arc<dyn crate::time::TimeProvider>)
            .build()
            .unwrap()
    }

    fn text(message: &Message) -> String { String::from_utf8_lossy(&message.payload).into_owned() }

    fn drain(tailer: &mut Tailer) -> Vec<String> {
        tailer.map(|m| text(&m.unwrap())).collect()
    }

    #[test]
    fn test_empty_queue_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut tailer = queue.create_tailer().unwrap();

        assert!(tailer.read_next().unwrap().is_none());

        queue.acquire_appender().unwrap().write_text("late").unwrap();
        assert_eq!(text(&tailer.read_next().unwrap().unwrap()), "late");
    }

    #[test]
    fn test_not_present_then_visible() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();
        let mut tailer = queue.create_tailer().unwrap();

        appender.write_text("one").unwrap();
        assert_eq!(drain(&mut tailer), vec!["one"]);
        assert!(tailer.read_next().unwrap().is_none());

        appender.write_text("two").unwrap();
        assert_eq!(drain(&mut tailer), vec!["two"]);
    }

    #[test]
    fn test_backward_across_sparse_cycles() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();

        appender.write_text("1a").unwrap();
        appender.write_text("1b").unwrap();
        clock.advance(Duration::from_millis(4 * DAY_MS as u64));
        appender.write_text("5a").unwrap();

        let mut tailer = queue.create_tailer().unwrap();
        tailer.direction(TailerDirection::Backward);
        assert_eq!(drain(&mut tailer), vec!["5a", "1b", "1a"]);
        assert!(tailer.read_next().unwrap().is_none());

        tailer.direction(TailerDirection::Forward);
        assert_eq!(drain(&mut tailer), vec!["1a", "1b", "5a"]);
    }

    #[test]
    fn test_move_to_index_and_seek() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();
        let indices: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|t| appender.write_text(t).unwrap())
            .collect();

        let mut tailer = queue.create_tailer().unwrap();
        assert!(tailer.move_to_index(indices[0]).unwrap());
        assert_eq!(text(&tailer.read_next().unwrap().unwrap()), "b");

        assert!(tailer.seek(indices[0]).unwrap());
        assert_eq!(text(&tailer.read_next().unwrap().unwrap()), "a");

        assert!(tailer.seek(indices[2] + 1).unwrap());
        assert!(tailer.read_next().unwrap().is_none());
        assert!(!tailer.move_to_index(indices[2] + 1).unwrap());
        assert!(!tailer.move_to_index(RollCycle::TestDaily.to_index(9, 0).unwrap()).unwrap());
    }

    #[test]
    fn test_failed_move_keeps_cursor() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();
        appender.write_text("a").unwrap();
        let last = appender.write_text("b").unwrap();
        appender.write_text("c").unwrap();

        let mut tailer = queue.create_tailer().unwrap();
        assert_eq!(text(&tailer.read_next().unwrap().unwrap()), "a");

        let missing_cycle = RollCycle::TestDaily.to_index(9, 0).unwrap();
        assert!(!tailer.move_to_index(missing_cycle).unwrap());
        assert!(!tailer.seek(missing_cycle).unwrap());
        assert!(!tailer.move_to_index(last + 5).unwrap());
        assert!(!tailer.seek(last + 5).unwrap());
        assert_eq!(tailer.current_cycle(), 1);

        assert_eq!(text(&tailer.read_next().unwrap().unwrap()), "b");
        assert_eq!(drain(&mut tailer), vec!["c"]);
    }

    #[test]
    fn test_headerless_next_cycle_is_not_entered() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();
        appender.write_text("a").unwrap();

        let mut tailer = queue.create_tailer().unwrap();
        assert_eq!(drain(&mut tailer), vec!["a"]);

        let next = queue.file_for_cycle(3).unwrap();
        drop(crate::file::DataFile::create(&next, 64 * 1024).unwrap());
        assert!(tailer.read_next().unwrap().is_none());
        assert_eq!(tailer.current_cycle(), 1);

        appender.write_text("b").unwrap();
        assert_eq!(drain(&mut tailer), vec!["b"]);

        clock.advance(Duration::from_millis(2 * DAY_MS as u64));
        appender.write_text("c").unwrap();
        assert_eq!(drain(&mut tailer), vec!["c"]);
        assert_eq!(tailer.current_cycle(), 3);
    }

    #[test]
    fn test_reading_document_rollback() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();
        appender.write_text("x").unwrap();
        appender.write_text("y").unwrap();

        let mut tailer = queue.create_tailer().unwrap();
        {
            let mut ctx = tailer.reading_document().unwrap();
            assert!(ctx.is_present());
            ctx.rollback_on_close();
        }
        {
            let ctx = tailer.reading_document().unwrap();
            assert_eq!(ctx.payload().unwrap().as_ref(), b"x");
        }
        let failed: Result<Option<()>> = tailer.read_document(|_| {
            crate::error::InvalidArgumentSnafu { message: "reject" }.fail()
        });
        assert!(failed.is_err());
        assert_eq!(
            tailer.read_document(|m| Ok(text(m))).unwrap().as_deref(),
            Some("y")
        );
        assert!(!tailer.reading_document().unwrap().is_present());
    }

    #[test]
    fn test_to_end_then_tail() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        let mut appender = queue.acquire_appender().unwrap();
        appender.write_text("old").unwrap();

        let mut tailer = queue.create_tailer().unwrap();
        tailer.to_end().unwrap();
        assert!(tailer.read_next().unwrap().is_none());

        appender.write_text("new").unwrap();
        assert_eq!(drain(&mut tailer), vec!["new"]);
    }

    #[test]
    fn test_tailer_releases_store_on_drop() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(SetTimeProvider::new(DAY_MS));
        let queue = queue(&dir, &clock);
        queue.acquire_appender().unwrap().write_text("r").unwrap();

        let mut tailer = queue.create_tailer().unwrap();
        tailer.read_next().unwrap();
        assert_eq!(queue.pool().cached_count(), 1);
        drop(tailer);
        assert_eq!(queue.pool().cached_count(), 0);
    }
}
