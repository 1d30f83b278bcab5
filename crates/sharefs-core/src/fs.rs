// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle table and the open / rename / cleanup / close state machine
//!
//! Every handle owns a hierarchical [`PathLock`] on its path. Ordinary opens
//! hold it shared; opens that may delete, rename or supersede the object hold
//! it exclusively, which fails with a sharing violation while anyone else has
//! the path (or anything beneath it) open. The backend is only asked to remove
//! or rename a path while that exclusive lock is held.
//!
//! Each handle additionally carries its own read/write lock guarding the
//! backend object, so concurrent I/O on one handle cannot race with cleanup,
//! rename or close of that same handle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use sharefs_pathlock::{LockMode, NormalizedPath, PathLock, PathLocker};
use tracing::{debug, trace, warn};

use crate::config::{FsConfig, MAX_LABEL_UNITS};
use crate::error::{FsError, FsResult};
use crate::handle::{index_number, Handle, HandleState, Phase};
use crate::options::{Disposition, KindConstraint, OpenFlags, OpenRequest};
use crate::storage::{create_backend, Backend, BackendFile};
use crate::types::{
    CleanupFlags, DirEntryInfo, FileInfo, FsStats, HandleId, VolumeInfo, WriteMode,
};

/// User-space filesystem core enforcing sharing semantics over a [`Backend`]
pub struct ShareFs {
    backend: Arc<dyn Backend>,
    locker: PathLocker,
    handles: DashMap<HandleId, Arc<Handle>>,
    /// Handle slots taken, counting opens still in progress.
    reserved: AtomicUsize,
    next_id: AtomicU64,
    config: FsConfig,
    label: RwLock<String>,
}

fn truncate_label(label: &str) -> String {
    let units: Vec<u16> = label.encode_utf16().take(MAX_LABEL_UNITS).collect();
    String::from_utf16_lossy(&units)
}

/// Close a backend object that never made it into a handle.
fn discard(file: Box<dyn BackendFile>, err: FsError) -> FsError {
    if let Err(close_err) = file.close() {
        warn!(error = %close_err, "closing abandoned backend object failed");
    }
    err
}

impl ShareFs {
    /// Build the backend described by `config` and mount over it.
    pub fn new(config: FsConfig) -> FsResult<Self> {
        let backend = create_backend(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: FsConfig, backend: Arc<dyn Backend>) -> Self {
        let locker = PathLocker::with_pool_capacity(config.locking.slot_pool_capacity);
        Self::with_parts(config, backend, locker)
    }

    /// Mount with an existing locker, e.g. one shared with other components.
    pub fn with_parts(config: FsConfig, backend: Arc<dyn Backend>, locker: PathLocker) -> Self {
        let label = truncate_label(&config.volume.label);
        Self {
            backend,
            locker,
            handles: DashMap::new(),
            reserved: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            config,
            label: RwLock::new(label),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn locker(&self) -> &PathLocker {
        &self.locker
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> FsStats {
        FsStats {
            open_handles: self.handles.len(),
            locked_paths: self.locker.table().len(),
            pooled_lock_slots: self.locker.table().pooled_slots(),
        }
    }

    fn load(&self, id: HandleId) -> FsResult<Arc<Handle>> {
        self.handles
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(FsError::InvalidHandle)
    }

    /// Open or create `path` (a native or slash path).
    pub fn open(&self, path: &str, request: &OpenRequest) -> FsResult<(HandleId, FileInfo)> {
        let limit = self.config.limits.max_open_handles;
        if self.reserved.fetch_add(1, Ordering::AcqRel) >= limit {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            return Err(FsError::TooManyOpenFiles);
        }
        let result = self.open_reserved(path, request);
        if result.is_err() {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    fn open_reserved(&self, path: &str, request: &OpenRequest) -> FsResult<(HandleId, FileInfo)> {
        let path = NormalizedPath::from_native(path);
        let exclusive = request.needs_exclusive();
        let mut lock = if exclusive {
            self.locker.write_normalized(&path)
        } else {
            self.locker.read_normalized(&path)
        }
        .map_err(|busy| {
            trace!(%path, exclusive, "open refused by path lock");
            busy
        })?;

        let mut flags = OpenFlags::for_request(request);
        let mut mode = request.mode;
        let mut kind = request.kind;

        if kind == KindConstraint::Directory && flags.create {
            if flags.truncate {
                return Err(FsError::InvalidParameter);
            }
            match self.backend.mkdir(path.as_str(), mode | 0o111) {
                Ok(()) => {}
                Err(FsError::AlreadyExists) if !flags.exclusive => {}
                Err(err) => return Err(err),
            }
            flags = OpenFlags::read_only();
            mode = 0;
        }

        let mut kind_mismatch = FsError::NotADirectory;
        let file = match self.backend.open_file(path.as_str(), flags, mode) {
            Ok(file) => file,
            Err(FsError::IsADirectory) if kind != KindConstraint::NonDirectory => {
                // Directories only open with plain read access; re-check the
                // kind afterwards in case the path changed under us.
                flags = OpenFlags::read_only();
                kind = KindConstraint::Directory;
                kind_mismatch = FsError::NotFound;
                self.backend.open_file(path.as_str(), flags, 0)?
            }
            Err(err) => return Err(err),
        };

        let meta = match file.stat() {
            Ok(meta) => meta,
            Err(err) => return Err(discard(file, err)),
        };
        match kind {
            KindConstraint::Directory if !meta.is_dir => return Err(discard(file, kind_mismatch)),
            KindConstraint::NonDirectory if meta.is_dir => {
                return Err(discard(file, FsError::IsADirectory))
            }
            _ => {}
        }

        let retain_exclusive = request.retains_exclusive();
        if request.disposition == Disposition::Supersede && !retain_exclusive {
            lock.downgrade();
        }

        let index = index_number(&path);
        let info = FileInfo::from_metadata(&meta, index);
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let phase = if request.delete_on_close {
            Phase::PendingDelete
        } else {
            Phase::Active
        };
        debug!(
            handle = %id,
            %path,
            exclusive = lock.is_exclusive(),
            delete_on_close = request.delete_on_close,
            "opened"
        );
        let state = HandleState {
            lock,
            file: Some(file),
            flags: flags.reopen(),
            is_dir: meta.is_dir,
            retain_exclusive,
            phase,
        };
        self.handles.insert(id, Arc::new(Handle::new(index, state)));
        Ok((id, info))
    }

    /// Create entry point: the permission bits come from the attribute word.
    pub fn create(
        &self,
        path: &str,
        request: &OpenRequest,
        file_attributes: u32,
    ) -> FsResult<(HandleId, FileInfo)> {
        let request = OpenRequest {
            mode: OpenRequest::mode_from_attributes(file_attributes),
            ..request.clone()
        };
        self.open(path, &request)
    }

    /// Truncate to zero. A supersede gives up exclusivity afterwards unless
    /// the handle was opened for deletion.
    pub fn overwrite(&self, id: HandleId, supersede: bool) -> FsResult<FileInfo> {
        let handle = self.load(id)?;
        let mut state = handle.write();
        let file = state.file()?;
        file.truncate(0)?;
        let meta = file.stat()?;
        if supersede && !state.retain_exclusive && state.lock.is_exclusive() {
            state.lock.downgrade();
            debug!(handle = %id, path = %state.path(), "superseded; lock downgraded");
        }
        Ok(FileInfo::from_metadata(&meta, handle.index_number))
    }

    pub fn read(&self, id: HandleId, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let handle = self.load(id)?;
        handle.with_file(|_, file| {
            let n = file.read_at(buf, offset)?;
            if n == 0 && !buf.is_empty() {
                return Err(FsError::EndOfFile);
            }
            Ok(n)
        })
    }

    pub fn write(
        &self,
        id: HandleId,
        data: &[u8],
        offset: u64,
        mode: WriteMode,
    ) -> FsResult<(usize, FileInfo)> {
        let handle = self.load(id)?;
        handle.with_file(|state, file| {
            if state.flags.append && !mode.to_end_of_file {
                return Err(FsError::AccessDenied);
            }
            let written = match (mode.to_end_of_file, mode.constrained) {
                (true, true) => 0,
                (true, false) => file.append(data)?,
                (false, true) => file.constrained_write_at(data, offset)?,
                (false, false) => file.write_at(data, offset)?,
            };
            let meta = file.stat()?;
            Ok((written, FileInfo::from_metadata(&meta, handle.index_number)))
        })
    }

    /// Sync one handle; `None` addresses the whole volume and does nothing.
    pub fn flush(&self, id: Option<HandleId>) -> FsResult<Option<FileInfo>> {
        let Some(id) = id else {
            return Ok(None);
        };
        let handle = self.load(id)?;
        handle.with_file(|_, file| {
            file.sync()?;
            let meta = file.stat()?;
            Ok(Some(FileInfo::from_metadata(&meta, handle.index_number)))
        })
    }

    pub fn get_file_info(&self, id: HandleId) -> FsResult<FileInfo> {
        let handle = self.load(id)?;
        handle.with_file(|_, file| {
            let meta = file.stat()?;
            Ok(FileInfo::from_metadata(&meta, handle.index_number))
        })
    }

    /// Set the file size; setting the allocation size only ever shrinks.
    pub fn set_file_size(&self, id: HandleId, size: u64, allocation: bool) -> FsResult<FileInfo> {
        let handle = self.load(id)?;
        handle.with_file(|_, file| {
            if allocation {
                file.shrink(size)?;
            } else {
                file.truncate(size)?;
            }
            let meta = file.stat()?;
            Ok(FileInfo::from_metadata(&meta, handle.index_number))
        })
    }

    /// Directory entries sorted by name that come after `marker`. A `None`
    /// marker restarts the enumeration from a fresh listing.
    pub fn read_directory(&self, id: HandleId, marker: Option<&str>) -> FsResult<Vec<DirEntryInfo>> {
        let handle = self.load(id)?;
        handle.with_file(|_, file| {
            let entries = match (marker, handle.cursor()) {
                (Some(_), Some(entries)) => entries,
                _ => {
                    let mut listing: Vec<DirEntryInfo> = file
                        .readdir()?
                        .into_iter()
                        .map(|meta| DirEntryInfo {
                            info: FileInfo::from_metadata(&meta, 0),
                            name: meta.name,
                        })
                        .collect();
                    listing.sort_by(|a, b| a.name.cmp(&b.name));
                    let listing = Arc::new(listing);
                    handle.set_cursor(Some(Arc::clone(&listing)));
                    listing
                }
            };
            let start = match marker {
                Some(marker) => entries.partition_point(|entry| entry.name.as_str() <= marker),
                None => 0,
            };
            Ok(entries[start..].to_vec())
        })
    }

    fn check_deletable(state: &HandleState) -> FsResult<()> {
        if !state.lock.is_exclusive() {
            return Err(FsError::AccessDenied);
        }
        let file = state.file()?;
        if file.stat()?.is_dir && !file.readdir()?.is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }
        Ok(())
    }

    /// Whether the handle could delete its object right now.
    pub fn can_delete(&self, id: HandleId) -> FsResult<()> {
        let handle = self.load(id)?;
        let state = handle.read();
        Self::check_deletable(&state)
    }

    /// Set or clear the delete disposition.
    pub fn set_delete(&self, id: HandleId, delete: bool) -> FsResult<()> {
        let handle = self.load(id)?;
        let mut state = handle.write();
        if delete {
            Self::check_deletable(&state)?;
            state.phase = Phase::PendingDelete;
        } else {
            state.phase = Phase::Active;
        }
        Ok(())
    }

    pub fn is_pending_delete(&self, id: HandleId) -> FsResult<bool> {
        Ok(self.load(id)?.read().phase == Phase::PendingDelete)
    }

    /// Last-handle cleanup. Deletes the object when asked to or when the
    /// handle is pending deletion; the path stays locked until close.
    pub fn cleanup(&self, id: HandleId, flags: CleanupFlags) -> FsResult<()> {
        let handle = self.load(id)?;
        let mut state = handle.write();
        if !flags.delete && state.phase != Phase::PendingDelete {
            return Ok(());
        }
        if !state.lock.is_exclusive() {
            return Err(FsError::AccessDenied);
        }
        if state.file.is_none() {
            return Ok(());
        }
        state.close_file(id);
        let path = state.path().clone();
        match self.backend.remove(path.as_str()) {
            Ok(()) => {
                debug!(handle = %id, %path, "deleted on cleanup");
                Ok(())
            }
            Err(err) => {
                warn!(handle = %id, %path, error = %err, "delete on cleanup failed");
                Err(err)
            }
        }
    }

    /// Rename the handle's object to `target` (a native or slash path).
    ///
    /// The handle must hold its path exclusively. Exactly one of the old and
    /// new path locks survives: the new one if the backend rename succeeded,
    /// the old one otherwise. The backend object is reopened at whichever
    /// path the handle ends up owning.
    pub fn rename(&self, id: HandleId, target: &str, replace_existing: bool) -> FsResult<()> {
        let handle = self.load(id)?;
        let mut state = handle.write();
        if !state.lock.is_exclusive() {
            return Err(FsError::AccessDenied);
        }
        state.file()?;

        let target = NormalizedPath::from_native(target);
        let mut other: PathLock = self.locker.write_normalized(&target).map_err(|busy| {
            trace!(handle = %id, %target, "rename target busy");
            busy
        })?;

        if !replace_existing {
            match self.backend.stat(target.as_str()) {
                Ok(_) => return Err(FsError::AlreadyExists),
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        state.close_file(id);
        let source = state.path().clone();
        let result = self.backend.rename(source.as_str(), target.as_str());
        match &result {
            Ok(()) => {
                std::mem::swap(&mut state.lock, &mut other);
                debug!(handle = %id, from = %source, to = %target, "renamed");
            }
            Err(err) => {
                warn!(handle = %id, from = %source, to = %target, error = %err, "rename failed; keeping source");
            }
        }

        let owned = state.path().clone();
        match self.backend.open_file(owned.as_str(), state.flags, 0) {
            Ok(file) => state.file = Some(file),
            Err(err) => {
                warn!(handle = %id, path = %owned, error = %err, "reopen after rename failed");
            }
        }
        handle.set_cursor(None);
        drop(state);
        other.unlock();
        result
    }

    /// Close a handle. Unknown or already closed ids are ignored.
    pub fn close(&self, id: HandleId) {
        let Some((_, handle)) = self.handles.remove(&id) else {
            return;
        };
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        let mut state = handle.write();
        state.close_file(id);
        state.lock.unlock();
        handle.set_cursor(None);
        debug!(handle = %id, path = %state.path(), "closed");
    }

    /// Path currently owned by a handle.
    pub fn handle_path(&self, id: HandleId) -> FsResult<NormalizedPath> {
        Ok(self.load(id)?.read().path().clone())
    }

    /// Mode of the path lock held by a handle.
    pub fn lock_mode(&self, id: HandleId) -> FsResult<LockMode> {
        Ok(self.load(id)?.read().lock.mode())
    }

    pub fn is_directory(&self, id: HandleId) -> FsResult<bool> {
        Ok(self.load(id)?.read().is_dir)
    }

    /// Attribute word of a path, without opening it.
    pub fn attributes_by_name(&self, path: &str) -> FsResult<u32> {
        let path = NormalizedPath::from_native(path);
        Ok(self.backend.stat(path.as_str())?.attributes())
    }

    pub fn volume_info(&self) -> VolumeInfo {
        let total = self.config.volume.total_size;
        VolumeInfo {
            total_size: total,
            free_size: total,
            label: self.label.read().clone(),
        }
    }

    /// Set the label, truncated to 32 UTF-16 code units.
    pub fn set_volume_label(&self, label: &str) -> VolumeInfo {
        *self.label.write() = truncate_label(label);
        self.volume_info()
    }
}

impl Drop for ShareFs {
    fn drop(&mut self) {
        let leaked: Vec<HandleId> = self.handles.iter().map(|entry| *entry.key()).collect();
        for id in leaked {
            if let Ok(path) = self.handle_path(id) {
                warn!(handle = %id, %path, "handle still open at unmount; closing");
            }
            self.close(id);
        }
    }
}
