// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage backend interface and reference implementations
//!
//! Paths handed to a backend are always normalized, slash-separated and
//! absolute. The lock discipline in [`crate::ShareFs`] guarantees that
//! `remove` and `rename` are never called while anything beneath the
//! affected path is open through the filesystem.

mod fault;
mod host;
mod memory;

use std::sync::Arc;

use crate::config::{BackstoreMode, FsConfig};
use crate::error::FsResult;
use crate::fault::FaultInjector;
use crate::options::OpenFlags;
use crate::types::Metadata;

pub use fault::FaultInjectingBackend;
pub use host::HostFsBackend;
pub use memory::InMemoryBackend;

/// Path-level operations of a storage backend
#[cfg_attr(test, mockall::automock)]
pub trait Backend: Send + Sync {
    fn open_file(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Box<dyn BackendFile>>;
    fn stat(&self, path: &str) -> FsResult<Metadata>;
    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()>;
    /// Replaces an existing target the way POSIX `rename` does.
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;
    fn remove(&self, path: &str) -> FsResult<()>;
}

/// An open file or directory of a storage backend
#[cfg_attr(test, mockall::automock)]
pub trait BackendFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize>;
    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize>;
    fn truncate(&self, size: u64) -> FsResult<()>;
    fn sync(&self) -> FsResult<()>;
    /// Children of a directory, in no particular order.
    fn readdir(&self) -> FsResult<Vec<Metadata>>;
    fn stat(&self) -> FsResult<Metadata>;
    fn close(&self) -> FsResult<()>;

    /// Write at the current end of file.
    ///
    /// The default looks the size up first, so two concurrent appends through
    /// it may overlap. Backends that can append atomically should override it.
    fn append(&self, data: &[u8]) -> FsResult<usize> {
        let size = self.stat()?.len;
        self.write_at(data, size)
    }

    /// Write without ever extending the file; data past the end is dropped.
    fn constrained_write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        let size = self.stat()?.len;
        if offset >= size {
            return Ok(0);
        }
        let room = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let data = &data[..data.len().min(room)];
        self.write_at(data, offset)
    }

    /// Truncate only if that makes the file smaller.
    fn shrink(&self, size: u64) -> FsResult<()> {
        if self.stat()?.len > size {
            self.truncate(size)?;
        }
        Ok(())
    }
}

/// Build the backend described by `config`, wrapped in fault injection when
/// the fault policy is enabled.
pub fn create_backend(config: &FsConfig) -> FsResult<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match &config.backstore {
        BackstoreMode::InMemory => {
            Arc::new(InMemoryBackend::with_max_file_size(config.volume.total_size))
        }
        BackstoreMode::HostFs { root } => Arc::new(HostFsBackend::new(root.clone())?),
    };
    if config.faults.enabled {
        let injector = Arc::new(FaultInjector::with_policy(config.faults.clone()));
        return Ok(Arc::new(FaultInjectingBackend::new(backend, injector)));
    }
    Ok(backend)
}

/// Last component of a normalized path, empty for the root.
pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}
