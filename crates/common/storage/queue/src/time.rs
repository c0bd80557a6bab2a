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

//! Clock capability used for roll decisions.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use chrono::Utc;

/// Supplies wall-clock milliseconds since the Unix epoch.
pub trait TimeProvider: Send + Sync + fmt::Debug {
    fn current_time_millis(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn current_time_millis(&self) -> i64 { Utc::now().timestamp_millis() }
}

/// A virtual clock that only moves when told to.
#[derive(Debug, Default)]
pub struct SetTimeProvider {
    millis: AtomicI64,
}

impl SetTimeProvider {
    #[must_use]
    pub const fn new(initial_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(initial_millis),
        }
    }

    /// Starts the virtual clock at the current wall-clock time.
    #[must_use]
    pub fn now() -> Self { Self::new(SystemTimeProvider.current_time_millis()) }

    pub fn set(&self, millis: i64) { self.millis.store(millis, Ordering::Release); }

    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl TimeProvider for SetTimeProvider {
    fn current_time_millis(&self) -> i64 { self.millis.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_time_provider_advances() {
        let clock = SetTimeProvider::new(1_000);
        assert_eq!(clock.current_time_millis(), 1_000);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.current_time_millis(), 3_000);

        clock.set(42);
        assert_eq!(clock.current_time_millis(), 42);
    }

    #[test]
    fn test_system_time_provider_is_positive() {
        assert!(SystemTimeProvider.current_time_millis() > 0);
    }
}
