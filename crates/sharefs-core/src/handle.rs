// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-open-handle state

use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sha2::{Digest, Sha256};
use sharefs_pathlock::{NormalizedPath, PathLock};
use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::options::OpenFlags;
use crate::storage::BackendFile;
use crate::types::{DirEntryInfo, HandleId};

/// Identity number reported for an open path.
///
/// XOR-fold of the SHA-256 of the normalized path. Two paths may collide, so
/// this is not a unique file id; it only stays stable for a handle's life.
pub fn index_number(path: &NormalizedPath) -> u64 {
    let digest = Sha256::digest(path.as_str().as_bytes());
    digest
        .chunks_exact(8)
        .map(|word| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(word);
            u64::from_be_bytes(bytes)
        })
        .fold(0, |acc, word| acc ^ word)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Active,
    /// The object is removed at cleanup.
    PendingDelete,
}

pub(crate) struct HandleState {
    /// Path lock owned by the handle; swapped on rename.
    pub lock: PathLock,
    /// `None` once cleaned up or closed.
    pub file: Option<Box<dyn BackendFile>>,
    /// Data access, reused when the object has to be reopened.
    pub flags: OpenFlags,
    pub is_dir: bool,
    /// Delete access or delete-on-close was requested at open.
    pub retain_exclusive: bool,
    pub phase: Phase,
}

impl HandleState {
    pub fn path(&self) -> &NormalizedPath {
        self.lock.path()
    }

    pub fn file(&self) -> FsResult<&dyn BackendFile> {
        self.file.as_deref().ok_or(FsError::InvalidHandle)
    }

    /// Close the backend object if still open. Errors are only logged.
    pub fn close_file(&mut self, id: HandleId) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.close() {
                warn!(handle = %id, path = %self.lock.path(), error = %err, "backend close failed");
            }
        }
    }
}

pub(crate) struct Handle {
    pub index_number: u64,
    state: RwLock<HandleState>,
    /// Sorted snapshot of a directory, refreshed when enumeration restarts.
    cursor: Mutex<Option<Arc<Vec<DirEntryInfo>>>>,
}

impl Handle {
    pub fn new(index_number: u64, state: HandleState) -> Self {
        Self {
            index_number,
            state: RwLock::new(state),
            cursor: Mutex::new(None),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HandleState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, HandleState> {
        self.state.write()
    }

    /// Run `op` against the open backend object under the shared handle lock.
    pub fn with_file<T>(
        &self,
        op: impl FnOnce(&HandleState, &dyn BackendFile) -> FsResult<T>,
    ) -> FsResult<T> {
        let state = self.state.read();
        let file = state.file()?;
        op(&state, file)
    }

    pub fn cursor(&self) -> Option<Arc<Vec<DirEntryInfo>>> {
        self.cursor.lock().clone()
    }

    pub fn set_cursor(&self, entries: Option<Arc<Vec<DirEntryInfo>>>) {
        *self.cursor.lock() = entries;
    }
}
