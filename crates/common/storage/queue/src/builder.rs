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

use std::{path::PathBuf, sync::Arc};

use crate::{
    FlushMode, Queue, QueueConfig, Result,
    pool::{NoopStoreFileListener, StoreFileListener},
    roll_cycle::RollCycle,
    time::{SystemTimeProvider, TimeProvider},
};

pub struct QueueBuilder {
    config:   QueueConfig,
    clock:    Arc<dyn TimeProvider>,
    listener: Arc<dyn StoreFileListener>,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            config:   QueueConfig {
                base_path: base_path.into(),
                ..Default::default()
            },
            clock:    Arc::new(SystemTimeProvider),
            listener: Arc::new(NoopStoreFileListener),
        }
    }

    /// Use `roll_cycle`. Opening files written with another roll cycle then
    /// fails instead of adopting theirs.
    #[must_use]
    pub fn roll_cycle(mut self, roll_cycle: RollCycle) -> Self {
        self.config.roll_cycle = Some(roll_cycle);
        self
    }

    /// Use `epoch_ms`. Like [`QueueBuilder::roll_cycle`], opening files
    /// written with another epoch then fails.
    #[must_use]
    pub fn epoch(mut self, epoch_ms: i64) -> Self {
        self.config.epoch = Some(epoch_ms);
        self
    }

    #[must_use]
    pub fn block_size(mut self, size: u64) -> Self {
        self.config.block_size = size;
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn verify_on_startup(mut self, verify: bool) -> Self {
        self.config.verify_on_startup = verify;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    #[must_use]
    pub fn time_provider(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn store_file_listener(mut self, listener: Arc<dyn StoreFileListener>) -> Self {
        self.listener = listener;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig { &self.config }

    /// Open (or create) the queue.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created or existing files were
    /// written with a different roll cycle or epoch.
    pub fn build(self) -> Result<Queue> { Queue::open(self.config, self.clock, self.listener) }
}
