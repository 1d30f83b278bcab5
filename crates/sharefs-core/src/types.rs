// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for sharefs

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;

const ALLOCATION_UNIT: u64 = 4096;

/// Metadata reported by a storage backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// Final path component; empty for the root.
    pub name: String,
    pub len: u64,
    pub is_dir: bool,
    /// POSIX permission bits.
    pub mode: u32,
    pub modified: SystemTime,
}

impl Metadata {
    /// Windows attribute word derived from the kind and permission bits.
    pub fn attributes(&self) -> u32 {
        let mut attributes = 0;
        if self.is_dir {
            attributes |= FILE_ATTRIBUTE_DIRECTORY;
        }
        if self.mode & 0o200 == 0 {
            attributes |= FILE_ATTRIBUTE_READONLY;
        }
        if attributes == 0 {
            attributes = FILE_ATTRIBUTE_NORMAL;
        }
        attributes
    }
}

/// File information returned to the driver for an open handle or a directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub file_attributes: u32,
    pub file_size: u64,
    pub allocation_size: u64,
    pub last_write_time: SystemTime,
    /// Path-derived identity; zero for directory entries. Not guaranteed unique.
    pub index_number: u64,
}

impl FileInfo {
    pub fn from_metadata(meta: &Metadata, index_number: u64) -> Self {
        Self {
            file_attributes: meta.attributes(),
            file_size: meta.len,
            allocation_size: meta.len.div_ceil(ALLOCATION_UNIT) * ALLOCATION_UNIT,
            last_write_time: meta.modified,
            index_number,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

/// Directory entry produced by an enumeration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub info: FileInfo,
}

/// Volume information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_size: u64,
    pub free_size: u64,
    pub label: String,
}

/// Flags passed to cleanup by the driver
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupFlags {
    pub delete: bool,
}

impl CleanupFlags {
    pub const DELETE: u32 = 0x01;

    pub fn from_raw(flags: u32) -> Self {
        Self {
            delete: flags & Self::DELETE != 0,
        }
    }
}

/// How a write is positioned
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteMode {
    /// Ignore the offset and append at the current end of file.
    pub to_end_of_file: bool,
    /// Never extend the file; the write is clipped at the current size.
    pub constrained: bool,
}

/// Filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub open_handles: usize,
    pub locked_paths: usize,
    pub pooled_lock_slots: usize,
}
