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

//! # Panic Hook and Deadlock Detection
//!
//! Panics are logged as structured tracing events with a backtrace before the
//! previous hook runs. With the `deadlock_detection` feature a background
//! thread reports `parking_lot` deadlocks, which covers the queue's store
//! pool and write locks.

#[cfg(feature = "deadlock_detection")]
use std::time::Duration;
use std::{
    panic,
    sync::atomic::{AtomicU64, Ordering},
};

use backtrace::Backtrace;

static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of panics seen since [`set_panic_hook`] was installed.
#[must_use]
pub fn panic_count() -> u64 { PANIC_COUNT.load(Ordering::Relaxed) }

/// Replace the panic handler with one that logs the panic, its location and
/// a backtrace through `tracing`, then defers to the previous handler.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic| {
        let backtrace = Backtrace::new();
        let backtrace = format!("{backtrace:?}");
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic, backtrace = %backtrace);
        }
        PANIC_COUNT.fetch_add(1, Ordering::Relaxed);
        default_hook(panic);
    }));

    #[cfg(feature = "deadlock_detection")]
    let _ = std::thread::Builder::new()
        .name("deadlock-detector".into())
        .spawn(move || {
            loop {
                std::thread::sleep(Duration::from_secs(5));
                let deadlocks = parking_lot::deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }

                tracing::warn!(count = deadlocks.len(), "Deadlocks detected");
                for (i, threads) in deadlocks.iter().enumerate() {
                    for t in threads {
                        tracing::warn!(
                            deadlock = i,
                            thread_id = ?t.thread_id(),
                            backtrace = ?t.backtrace(),
                            "Deadlocked thread"
                        );
                    }
                }
            }
        });
}
