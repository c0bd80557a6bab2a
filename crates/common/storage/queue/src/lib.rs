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

//! Persisted append-only queue backed by time-rolled, memory-mapped cycle
//! files.
//!
//! Every record is addressed by a 64-bit index packing the cycle (time
//! bucket) in the high bits and the sequence within the cycle in the low
//! bits; the split is fixed by the [`RollCycle`].

pub mod appender;
pub mod builder;
pub mod config;
pub mod document;
pub mod error;
pub mod file;
pub mod message;
pub mod path;
pub mod pool;
pub mod queue;
pub mod reader;
pub mod roll_cycle;
pub mod store;
pub mod supplier;
pub mod tailer;
pub mod time;

pub use appender::Appender;
pub use builder::QueueBuilder;
pub use config::{FlushMode, QueueConfig};
pub use document::{ReadContext, WriteContext};
pub use error::{QueueError, Result};
pub use message::{Message, RecordEncoding};
pub use pool::{NoopStoreFileListener, RollDetails, StoreFileListener, WireStorePool};
pub use queue::Queue;
pub use reader::QueueReader;
pub use roll_cycle::RollCycle;
pub use store::{ReadAt, WireStore};
pub use supplier::{FileStoreSupplier, WireStoreSupplier};
pub use tailer::{Tailer, TailerDirection};
pub use time::{SetTimeProvider, SystemTimeProvider, TimeProvider};
