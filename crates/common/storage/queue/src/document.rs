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

//! Scoped record transactions.
//!
//! A [`WriteContext`] buffers one record and appends it only on
//! [`WriteContext::commit`]; every other way out of the scope (early return,
//! `?`, panic) discards the buffer, so nothing partial ever reaches the
//! cycle file.
//!
//! A [`ReadContext`] exposes the record under a tailer's cursor and moves
//! the cursor past it when the context is dropped, unless the read was
//! rolled back or the thread is unwinding.

use std::ops::{Deref, DerefMut};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{Result, appender::Appender, message::Message, tailer::Tailer};

pub struct WriteContext<'a> {
    appender: &'a mut Appender,
    buf:      BytesMut,
}

impl<'a> WriteContext<'a> {
    pub(crate) fn new(appender: &'a mut Appender) -> Self {
        Self {
            appender,
            buf: BytesMut::new(),
        }
    }

    /// Append the buffered record and return its index.
    ///
    /// # Errors
    ///
    /// Any error of [`Appender::write_bytes`]; the record is not written.
    pub fn commit(mut self) -> Result<u64> {
        let buf = std::mem::take(&mut self.buf);
        self.appender.write_bytes(&buf)
    }

    /// Discard the buffered record.
    pub fn rollback(self) {}
}

impl Deref for WriteContext<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target { &self.buf }
}

impl DerefMut for WriteContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.buf }
}

impl Drop for WriteContext<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            debug!(len = self.buf.len(), "Discarding uncommitted record");
        }
    }
}

pub struct ReadContext<'a> {
    tailer:   &'a mut Tailer,
    message:  Option<Message>,
    rollback: bool,
}

impl<'a> ReadContext<'a> {
    pub(crate) fn new(tailer: &'a mut Tailer, message: Option<Message>) -> Self {
        Self {
            tailer,
            message,
            rollback: false,
        }
    }

    /// Whether a complete record is under the cursor.
    #[must_use]
    pub const fn is_present(&self) -> bool { self.message.is_some() }

    #[must_use]
    pub fn index(&self) -> Option<u64> { self.message.as_ref().map(|m| m.index) }

    #[must_use]
    pub fn payload(&self) -> Option<&Bytes> { self.message.as_ref().map(|m| &m.payload) }

    #[must_use]
    pub const fn message(&self) -> Option<&Message> { self.message.as_ref() }

    /// Leave the cursor on this record when the context closes.
    pub const fn rollback_on_close(&mut self) { self.rollback = true; }
}

impl Drop for ReadContext<'_> {
    fn drop(&mut self) {
        if self.message.is_none() || self.rollback || std::thread::panicking() {
            return;
        }
        if let Err(error) = self.tailer.advance() {
            warn!(%error, "Failed to advance tailer past record");
        }
    }
}
