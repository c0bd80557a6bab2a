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

//! Dumps queue records as text lines.
//!
//! Each record becomes one line `0x<index>: <text>`. Text payloads are
//! decoded as UTF-8; binary payloads (first byte with the high bit set) are
//! rendered as hex. Lines pass through inclusion and exclusion regexes
//! before reaching the sink.

use std::{
    fmt::Write as _,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use regex::Regex;
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::{
    Queue, QueueBuilder, Result,
    error::{InvalidArgumentSnafu, InvalidPatternSnafu},
    message::{Message, RecordEncoding},
    roll_cycle::RollCycle,
    tailer::{Tailer, TailerDirection},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type MessageSink = Box<dyn FnMut(String)>;

pub struct QueueReader {
    base_path:       PathBuf,
    roll_cycle:      Option<RollCycle>,
    inclusion:       Vec<Regex>,
    exclusion:       Vec<Regex>,
    start_index:     Option<u64>,
    history_records: Option<u64>,
    tail:            bool,
    poll_interval:   Duration,
    stop:            Arc<AtomicBool>,
    sink:            MessageSink,
}

impl Default for QueueReader {
    fn default() -> Self {
        Self {
            base_path:       PathBuf::from("."),
            roll_cycle:      None,
            inclusion:       Vec::new(),
            exclusion:       Vec::new(),
            start_index:     None,
            history_records: None,
            tail:            false,
            poll_interval:   DEFAULT_POLL_INTERVAL,
            stop:            Arc::new(AtomicBool::new(false)),
            sink:            Box::new(|line| println!("{line}")),
        }
    }
}

impl QueueReader {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn with_base_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base_path = path.into();
        self
    }

    #[must_use]
    pub const fn with_roll_cycle(mut self, roll_cycle: RollCycle) -> Self {
        self.roll_cycle = Some(roll_cycle);
        self
    }

    /// Only print records whose text matches `pattern`. Repeatable; every
    /// pattern must match.
    ///
    /// # Errors
    ///
    /// Fails when `pattern` is not a valid regex.
    pub fn with_inclusion_regex(mut self, pattern: &str) -> Result<Self> {
        self.inclusion.push(compile(pattern)?);
        Ok(self)
    }

    /// Skip records whose text matches `pattern`. Repeatable.
    ///
    /// # Errors
    ///
    /// Fails when `pattern` is not a valid regex.
    pub fn with_exclusion_regex(mut self, pattern: &str) -> Result<Self> {
        self.exclusion.push(compile(pattern)?);
        Ok(self)
    }

    #[must_use]
    pub const fn with_start_index(mut self, index: u64) -> Self {
        self.start_index = Some(index);
        self
    }

    /// Only print the last `count` records present when reading starts.
    #[must_use]
    pub const fn history_records(mut self, count: u64) -> Self {
        self.history_records = Some(count);
        self
    }

    /// Keep polling for new records at the end of data instead of stopping.
    #[must_use]
    pub const fn tail(mut self, tail: bool) -> Self {
        self.tail = tail;
        self
    }

    #[must_use]
    pub fn with_message_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(String) + 'static,
    {
        self.sink = Box::new(sink);
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Flag that ends polling once set.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Read the queue and feed matching lines to the sink.
    ///
    /// # Errors
    ///
    /// [`crate::QueueError::InvalidArgument`] when the start index lies
    /// before the first record, or past the end of data without tailing.
    /// Queue open and read errors are passed through.
    pub fn execute(mut self) -> Result<()> {
        let mut builder = QueueBuilder::new(&self.base_path).read_only(true);
        if let Some(roll_cycle) = self.roll_cycle {
            builder = builder.roll_cycle(roll_cycle);
        }
        let queue = builder.build()?;
        let mut tailer = queue.create_tailer()?;

        if !self.position(&queue, &mut tailer)? {
            return Ok(());
        }

        while !self.stopped() {
            match tailer.read_next()? {
                Some(message) => self.emit(&message),
                None if self.tail => std::thread::sleep(self.poll_interval),
                None => break,
            }
        }
        Ok(())
    }

    /// Places the tailer where output starts. Returns `false` when stopped
    /// while waiting for the start index.
    fn position(&mut self, queue: &Queue, tailer: &mut Tailer) -> Result<bool> {
        if let Some(count) = self.history_records {
            position_for_history(tailer, count)?;
            return Ok(true);
        }

        let Some(index) = self.start_index else {
            return Ok(true);
        };

        if let Some(first) = queue.first_index()? {
            ensure!(
                index >= first,
                InvalidArgumentSnafu {
                    message: format!("index {index:#x} is before the first index {first:#x}"),
                }
            );
        }
        if !self.tail {
            let end = queue.last_index()?.map_or(0, |last| last + 1);
            ensure!(
                index <= end,
                InvalidArgumentSnafu {
                    message: format!("index {index:#x} is after the last index"),
                }
            );
        }

        let mut announced = false;
        while !tailer.seek(index)? {
            if self.stopped() {
                return Ok(false);
            }
            if !announced {
                (self.sink)(format!("Waiting for index {index:#x}"));
                announced = true;
            }
            std::thread::sleep(self.poll_interval);
        }
        debug!(index, "Reader positioned");
        Ok(true)
    }

    fn emit(&mut self, message: &Message) {
        let text = render(message);
        if self.inclusion.iter().all(|re| re.is_match(&text))
            && !self.exclusion.iter().any(|re| re.is_match(&text))
        {
            (self.sink)(format!("{:#x}: {text}", message.index));
        }
    }

    fn stopped(&self) -> bool { self.stop.load(Ordering::Acquire) }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).context(InvalidPatternSnafu { pattern })
}

fn position_for_history(tailer: &mut Tailer, count: u64) -> Result<()> {
    tailer.direction(TailerDirection::Backward);
    tailer.to_end()?;

    let mut start = None;
    for _ in 0..count {
        match tailer.read_next()? {
            Some(message) => start = Some(message.index),
            None => break,
        }
    }

    tailer.direction(TailerDirection::Forward);
    match start {
        Some(index) => {
            tailer.seek(index)?;
        }
        None => tailer.to_end()?,
    }
    Ok(())
}

/// Text form of a record's payload.
#[must_use]
pub fn render(message: &Message) -> String {
    match message.encoding() {
        RecordEncoding::Text => String::from_utf8_lossy(&message.payload).into_owned(),
        RecordEncoding::Binary => {
            let mut out = String::with_capacity(message.payload.len() * 3);
            for (i, byte) in message.payload.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
    }
}
