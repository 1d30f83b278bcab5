// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle lifecycle and sharing semantics for the sharefs user-space filesystem
//!
//! [`ShareFs`] sits between a filesystem driver boundary and a storage
//! [`Backend`](storage::Backend). It keeps the table of open handles and
//! guards every path with the hierarchical locks of [`sharefs_pathlock`], so
//! an object can't be deleted or renamed while it, or anything beneath it,
//! is open elsewhere.

pub mod config;
pub mod error;
pub mod fault;
pub mod fs;
mod handle;
pub mod options;
pub mod storage;
pub mod types;

pub use config::{BackstoreMode, FsConfig, FsLimits, LockingConfig, VolumeConfig};
pub use error::{FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule};
pub use fs::ShareFs;
pub use handle::index_number;
pub use options::{Access, Disposition, KindConstraint, OpenFlags, OpenRequest};
pub use sharefs_pathlock::{LockMode, NormalizedPath};
pub use storage::{Backend, BackendFile, FaultInjectingBackend, HostFsBackend, InMemoryBackend};
pub use types::{
    CleanupFlags, DirEntryInfo, FileInfo, FsStats, HandleId, Metadata, VolumeInfo, WriteMode,
};
