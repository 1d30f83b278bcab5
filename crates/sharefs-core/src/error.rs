// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for sharefs core

use std::io;

use sharefs_pathlock::Busy;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("sharing violation")]
    SharingViolation,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("end of file")]
    EndOfFile,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("no space left")]
    NoSpace,
    #[error("unsupported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl From<Busy> for FsError {
    fn from(_: Busy) -> Self {
        FsError::SharingViolation
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => return FsError::NotFound,
            io::ErrorKind::AlreadyExists => return FsError::AlreadyExists,
            io::ErrorKind::PermissionDenied => return FsError::AccessDenied,
            io::ErrorKind::InvalidInput => return FsError::InvalidParameter,
            io::ErrorKind::UnexpectedEof => return FsError::EndOfFile,
            _ => {}
        }
        match err.raw_os_error() {
            Some(libc::ENOTDIR) => FsError::NotADirectory,
            Some(libc::EISDIR) => FsError::IsADirectory,
            Some(libc::ENOTEMPTY) => FsError::DirectoryNotEmpty,
            Some(libc::ENOSPC) => FsError::NoSpace,
            Some(libc::EMFILE) | Some(libc::ENFILE) => FsError::TooManyOpenFiles,
            Some(libc::EPERM) => FsError::AccessDenied,
            _ => FsError::Io(err),
        }
    }
}

impl FsError {
    /// NTSTATUS value reported to the driver for this error.
    pub fn nt_status(&self) -> u32 {
        match self {
            FsError::SharingViolation => 0xC000_0043,
            FsError::InvalidHandle => 0xC000_0008,
            FsError::NotFound => 0xC000_0034,
            FsError::AlreadyExists => 0xC000_0035,
            FsError::AccessDenied => 0xC000_0022,
            FsError::InvalidParameter => 0xC000_000D,
            FsError::NotADirectory => 0xC000_0103,
            FsError::IsADirectory => 0xC000_00BA,
            FsError::DirectoryNotEmpty => 0xC000_0101,
            FsError::EndOfFile => 0xC000_0011,
            FsError::TooManyOpenFiles => 0xC000_011F,
            FsError::NoSpace => 0xC000_007F,
            FsError::Unsupported => 0xC000_00BB,
            FsError::Io(_) => 0xC000_00E5,
        }
    }

    /// Conflicts are routine under sharing semantics and are not worth an error log.
    pub fn is_sharing_violation(&self) -> bool {
        matches!(self, FsError::SharingViolation)
    }
}
