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

//! Roll cycles and the 64-bit index layout.
//!
//! A [`RollCycle`] decides which time bucket ("cycle") a timestamp belongs to
//! and how a record index is split between the cycle and the in-cycle
//! sequence number:
//!
//! ```text
//! ┌──────────────────────────────┬─────────────────────────────────┐
//! │ cycle (64 - sequence_bits)   │ sequence (sequence_bits)        │
//! └──────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! With [`RollCycle::Daily`] (32 sequence bits) the index `0x421d_0000_0001`
//! is the second record of cycle `0x421d`, i.e. 2016-05-04.
//!
//! Cycle files are named after the UTC start of the cycle measured from the
//! Unix epoch, so renaming never depends on the queue's epoch offset. The
//! epoch only shifts which timestamps fall into which cycle.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use snafu::{OptionExt, ensure};

use crate::{
    Result,
    error::{IndexOverflowSnafu, InvalidArgumentSnafu},
};

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// File extension of cycle files.
pub const CYCLE_FILE_SUFFIX: &str = "cq4";

/// Policy deciding cycle duration, file naming and index bit layout.
///
/// Immutable once chosen for a queue; the name is written into every cycle
/// file header so a reopen with a different policy is detected.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RollCycle {
    TestSecondly,
    Minutely,
    Hourly,
    #[default]
    Daily,
    TestDaily,
    SmallDaily,
    LargeDaily,
    HugeDaily,
}

impl RollCycle {
    /// chrono format of the cycle file stem.
    #[must_use]
    pub const fn format(self) -> &'static str {
        match self {
            Self::TestSecondly => "%Y%m%d-%H%M%S",
            Self::Minutely => "%Y%m%d-%H%M",
            Self::Hourly => "%Y%m%d-%H",
            Self::Daily | Self::TestDaily | Self::SmallDaily | Self::LargeDaily | Self::HugeDaily => {
                "%Y%m%d"
            }
        }
    }

    /// Cycle duration in milliseconds.
    #[must_use]
    pub const fn length_ms(self) -> i64 {
        match self {
            Self::TestSecondly => SECOND_MS,
            Self::Minutely => MINUTE_MS,
            Self::Hourly => HOUR_MS,
            Self::Daily | Self::TestDaily | Self::SmallDaily | Self::LargeDaily | Self::HugeDaily => {
                DAY_MS
            }
        }
    }

    /// Number of low index bits holding the sequence.
    #[must_use]
    pub const fn sequence_bits(self) -> u32 {
        match self {
            Self::SmallDaily => 24,
            Self::LargeDaily => 40,
            Self::HugeDaily => 48,
            Self::TestSecondly | Self::Minutely | Self::Hourly | Self::Daily | Self::TestDaily => {
                32
            }
        }
    }

    #[must_use]
    pub const fn max_sequence(self) -> u64 { (1u64 << self.sequence_bits()) - 1 }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn max_cycle(self) -> i64 { ((1u64 << (64 - self.sequence_bits())) - 1) as i64 }

    /// Cycle containing `timestamp_ms` for a queue whose cycles start at
    /// `epoch_ms`. Floor division, so timestamps before the epoch yield
    /// negative cycles instead of wrapping.
    #[must_use]
    pub const fn cycle_of(self, epoch_ms: i64, timestamp_ms: i64) -> i64 {
        timestamp_ms.saturating_sub(epoch_ms).div_euclid(self.length_ms())
    }

    /// Packs `(cycle, sequence)` into an index.
    ///
    /// Fails with `IndexOverflow` instead of truncating when either field is
    /// outside the layout.
    #[allow(clippy::cast_sign_loss)]
    pub fn to_index(self, cycle: i64, sequence: u64) -> Result<u64> {
        ensure!(
            (0..=self.max_cycle()).contains(&cycle) && sequence <= self.max_sequence(),
            IndexOverflowSnafu {
                roll_cycle: self.to_string(),
                cycle,
                sequence,
            }
        );
        Ok(((cycle as u64) << self.sequence_bits()) | sequence)
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_cycle(self, index: u64) -> i64 { (index >> self.sequence_bits()) as i64 }

    #[must_use]
    pub const fn to_sequence(self, index: u64) -> u64 { index & self.max_sequence() }

    /// Splits an index into `(cycle, sequence)`.
    #[must_use]
    pub const fn unpack(self, index: u64) -> (i64, u64) {
        (self.to_cycle(index), self.to_sequence(index))
    }

    /// File name (including extension) of `cycle`.
    pub fn file_name(self, cycle: i64) -> Result<String> {
        let start = cycle
            .checked_mul(self.length_ms())
            .and_then(DateTime::from_timestamp_millis)
            .context(InvalidArgumentSnafu {
                message: format!("cycle {cycle} has no calendar representation"),
            })?;
        Ok(format!(
            "{}.{CYCLE_FILE_SUFFIX}",
            start.format(self.format())
        ))
    }

    /// Inverse of [`file_name`](Self::file_name); `None` for names this roll
    /// cycle could not have produced.
    #[must_use]
    pub fn parse_cycle(self, file_name: &str) -> Option<i64> {
        let stem = file_name.strip_suffix(CYCLE_FILE_SUFFIX)?.strip_suffix('.')?;
        let start = match self.length_ms() {
            DAY_MS => NaiveDate::parse_from_str(stem, self.format())
                .ok()?
                .and_hms_opt(0, 0, 0)?,
            // chrono needs a minute to build a time of day
            HOUR_MS => {
                NaiveDateTime::parse_from_str(&format!("{stem}00"), &format!("{}%M", self.format()))
                    .ok()?
            }
            _ => NaiveDateTime::parse_from_str(stem, self.format()).ok()?,
        };
        let cycle = start
            .and_utc()
            .timestamp_millis()
            .div_euclid(self.length_ms());

        // chrono parses leniently (e.g. unpadded fields), only accept
        // canonical names
        (self.file_name(cycle).ok()? == file_name).then_some(cycle)
    }
}
