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

//! Memory-mapped cycle file operations using mmap-io.

use std::path::{Path, PathBuf};

use mmap_io::MemoryMappedFile;

use crate::{QueueError, Result};

/// Memory-mapped file backing one cycle.
///
/// The mapping is shared: every appender and tailer in the process that
/// holds the cycle's store reads and writes through the same pages, and
/// other processes mapping the file observe the same bytes.
pub struct DataFile {
    mmap:     MemoryMappedFile,
    path:     PathBuf,
    size:     u64,
    writable: bool,
}

impl DataFile {
    /// Create a new data file with pre-allocation.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mmap = MemoryMappedFile::create_rw(&path, size).map_err(|e| mmap_failed(&path, &e))?;

        Ok(Self {
            mmap,
            path,
            size,
            writable: true,
        })
    }

    /// Open an existing data file, read-write unless `writable` is false.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mmap = if writable {
            MemoryMappedFile::open_rw(&path)
        } else {
            MemoryMappedFile::open_ro(&path)
        }
        .map_err(|e| mmap_failed(&path, &e))?;

        let size = mmap.len();

        Ok(Self {
            mmap,
            path,
            size,
            writable,
        })
    }

    /// Write data at the specified offset.
    #[inline]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.mmap
            .update_region(offset, data)
            .map_err(|e| mmap_failed(&self.path, &e))
    }

    /// Read data from the specified offset into the provided buffer.
    #[inline]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.mmap
            .read_into(offset, buf)
            .map_err(|e| mmap_failed(&self.path, &e))
    }

    #[inline]
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    #[inline]
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Get file size.
    pub const fn size(&self) -> u64 { self.size }

    /// Get file path.
    pub fn path(&self) -> &Path { &self.path }

    pub const fn is_writable(&self) -> bool { self.writable }

    /// Flush the whole mapping to disk.
    pub fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.mmap.flush().map_err(|e| mmap_failed(&self.path, &e))
    }
}

fn mmap_failed(path: &Path, err: &impl std::fmt::Display) -> QueueError {
    QueueError::MmapFailed {
        path:    path.to_path_buf(),
        message: err.to_string(),
    }
}
