// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open requests and their decoding from the driver's raw option words

use crate::error::{FsError, FsResult};

/// Raw `CreateOptions` bits understood by the decoder.
pub mod create_options {
    pub const FILE_DIRECTORY_FILE: u32 = 0x0000_0001;
    pub const FILE_WRITE_THROUGH: u32 = 0x0000_0002;
    pub const FILE_NON_DIRECTORY_FILE: u32 = 0x0000_0040;
    pub const FILE_CREATE_TREE_CONNECTION: u32 = 0x0000_0080;
    pub const FILE_COMPLETE_IF_OPLOCKED: u32 = 0x0000_0100;
    pub const FILE_NO_EA_KNOWLEDGE: u32 = 0x0000_0200;
    pub const FILE_DELETE_ON_CLOSE: u32 = 0x0000_1000;
    pub const FILE_OPEN_BY_FILE_ID: u32 = 0x0000_2000;
    pub const FILE_RESERVE_OPFILTER: u32 = 0x0010_0000;
    pub const FILE_OPEN_REQUIRING_OPLOCK: u32 = 0x0001_0000;
    pub const FILE_OPEN_NO_RECALL: u32 = 0x0040_0000;

    pub const UNSUPPORTED: u32 = FILE_WRITE_THROUGH
        | FILE_CREATE_TREE_CONNECTION
        | FILE_NO_EA_KNOWLEDGE
        | FILE_OPEN_BY_FILE_ID
        | FILE_RESERVE_OPFILTER
        | FILE_OPEN_REQUIRING_OPLOCK
        | FILE_COMPLETE_IF_OPLOCKED
        | FILE_OPEN_NO_RECALL;

    pub const BOTH_DIRECTORY_FLAGS: u32 = FILE_DIRECTORY_FILE | FILE_NON_DIRECTORY_FILE;
}

/// Raw `GrantedAccess` bits understood by the decoder.
pub mod access_mask {
    pub const FILE_READ_DATA: u32 = 0x0000_0001;
    pub const FILE_WRITE_DATA: u32 = 0x0000_0002;
    pub const FILE_APPEND_DATA: u32 = 0x0000_0004;
    pub const DELETE: u32 = 0x0001_0000;
}

/// What to do when the target does or does not exist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Disposition {
    Supersede,
    Create,
    #[default]
    Open,
    OpenIf,
    Overwrite,
    OverwriteIf,
}

impl Disposition {
    pub fn from_raw(value: u32) -> FsResult<Self> {
        Ok(match value {
            0 => Disposition::Supersede,
            1 => Disposition::Open,
            2 => Disposition::Create,
            3 => Disposition::OpenIf,
            4 => Disposition::Overwrite,
            5 => Disposition::OverwriteIf,
            _ => return Err(FsError::InvalidParameter),
        })
    }

    pub fn creates(self) -> bool {
        matches!(
            self,
            Disposition::Supersede | Disposition::Create | Disposition::OpenIf | Disposition::OverwriteIf
        )
    }

    pub fn create_exclusive(self) -> bool {
        self == Disposition::Create
    }

    pub fn truncates(self) -> bool {
        matches!(
            self,
            Disposition::Supersede | Disposition::Overwrite | Disposition::OverwriteIf
        )
    }
}

/// Which kind of object the caller insists on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KindConstraint {
    #[default]
    Any,
    Directory,
    NonDirectory,
}

/// Data access requested on the handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    /// Writes only ever land at the end of file.
    pub append: bool,
    /// The handle may be deleted or renamed.
    pub delete: bool,
}

impl Access {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn with_delete(mut self) -> Self {
        self.delete = true;
        self
    }
}

/// A decoded open/create request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub access: Access,
    pub disposition: Disposition,
    pub kind: KindConstraint,
    pub delete_on_close: bool,
    /// Permission bits used when the object gets created.
    pub mode: u32,
}

impl Default for OpenRequest {
    fn default() -> Self {
        Self {
            access: Access::read_only(),
            disposition: Disposition::Open,
            kind: KindConstraint::Any,
            delete_on_close: false,
            mode: 0,
        }
    }
}

impl OpenRequest {
    pub fn open(access: Access) -> Self {
        Self {
            access,
            ..Self::default()
        }
    }

    pub fn create_file(access: Access, disposition: Disposition) -> Self {
        Self {
            access,
            disposition,
            kind: KindConstraint::NonDirectory,
            mode: 0o666,
            ..Self::default()
        }
    }

    pub fn create_dir() -> Self {
        Self {
            access: Access::read_only(),
            disposition: Disposition::Create,
            kind: KindConstraint::Directory,
            mode: 0o777,
            ..Self::default()
        }
    }

    pub fn delete_on_close(mut self) -> Self {
        self.delete_on_close = true;
        self
    }

    pub fn with_kind(mut self, kind: KindConstraint) -> Self {
        self.kind = kind;
        self
    }

    /// Decode the driver's `CreateOptions` (disposition in the top byte) and
    /// `GrantedAccess` words.
    pub fn from_raw(raw_options: u32, granted_access: u32) -> FsResult<Self> {
        use access_mask::*;
        use create_options::*;

        if raw_options & UNSUPPORTED != 0 {
            return Err(FsError::InvalidParameter);
        }
        let kind = match raw_options & BOTH_DIRECTORY_FLAGS {
            0 => KindConstraint::Any,
            FILE_DIRECTORY_FILE => KindConstraint::Directory,
            FILE_NON_DIRECTORY_FILE => KindConstraint::NonDirectory,
            _ => return Err(FsError::InvalidParameter),
        };
        let write_bits = granted_access & (FILE_WRITE_DATA | FILE_APPEND_DATA);
        let access = Access {
            read: granted_access & FILE_READ_DATA != 0,
            write: write_bits != 0,
            append: write_bits == FILE_APPEND_DATA,
            delete: granted_access & DELETE != 0,
        };
        Ok(Self {
            access,
            disposition: Disposition::from_raw((raw_options >> 24) & 0xff)?,
            kind,
            delete_on_close: raw_options & FILE_DELETE_ON_CLOSE != 0,
            mode: 0,
        })
    }

    /// Permission bits for `Create` derived from the requested attribute word.
    pub fn mode_from_attributes(file_attributes: u32) -> u32 {
        use crate::types::{FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_READONLY};

        let mut mode = 0o444;
        if file_attributes & FILE_ATTRIBUTE_READONLY == 0 {
            mode |= 0o666;
        }
        if file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
            mode |= 0o111;
        }
        mode
    }

    /// Whether the handle must hold its path exclusively from the start.
    pub fn needs_exclusive(&self) -> bool {
        self.delete_on_close || self.access.delete || self.disposition == Disposition::Supersede
    }

    /// Whether exclusivity must outlive a supersede.
    pub fn retains_exclusive(&self) -> bool {
        self.delete_on_close || self.access.delete
    }
}

/// Flags handed to [`crate::storage::Backend::open_file`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Backend flags for a request, before any directory handling.
    pub fn for_request(request: &OpenRequest) -> Self {
        let disposition = request.disposition;
        Self {
            read: request.access.read,
            write: request.access.write,
            append: request.access.append,
            create: disposition.creates(),
            exclusive: disposition.create_exclusive(),
            truncate: disposition.truncates(),
        }
    }

    /// Flags used to reopen an existing object with the same data access.
    pub fn reopen(self) -> Self {
        Self {
            read: self.read,
            write: self.write,
            append: self.append,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::access_mask::*;
    use super::create_options::*;
    use super::*;

    fn raw(disposition: u32, options: u32) -> u32 {
        (disposition << 24) | options
    }

    #[test]
    fn rejects_unsupported_options() {
        for bad in [FILE_WRITE_THROUGH, FILE_OPEN_BY_FILE_ID, FILE_OPEN_NO_RECALL] {
            assert!(matches!(
                OpenRequest::from_raw(raw(1, bad), FILE_READ_DATA),
                Err(FsError::InvalidParameter)
            ));
        }
    }

    #[test]
    fn rejects_both_directory_flags() {
        assert!(matches!(
            OpenRequest::from_raw(raw(1, BOTH_DIRECTORY_FLAGS), FILE_READ_DATA),
            Err(FsError::InvalidParameter)
        ));
    }

    #[test]
    fn rejects_unknown_disposition() {
        assert!(matches!(
            OpenRequest::from_raw(raw(6, 0), FILE_READ_DATA),
            Err(FsError::InvalidParameter)
        ));
    }

    #[test]
    fn decodes_access_and_kind() {
        let request =
            OpenRequest::from_raw(raw(3, FILE_NON_DIRECTORY_FILE), FILE_APPEND_DATA | DELETE)
                .unwrap();
        assert_eq!(request.disposition, Disposition::OpenIf);
        assert_eq!(request.kind, KindConstraint::NonDirectory);
        assert!(!request.access.read);
        assert!(request.access.write);
        assert!(request.access.append);
        assert!(request.access.delete);
        assert!(request.needs_exclusive());

        let request =
            OpenRequest::from_raw(raw(1, 0), FILE_READ_DATA | FILE_WRITE_DATA | FILE_APPEND_DATA)
                .unwrap();
        assert!(request.access.read && request.access.write);
        assert!(!request.access.append);
        assert!(!request.needs_exclusive());
    }

    #[test]
    fn supersede_needs_but_does_not_retain_exclusive() {
        let request = OpenRequest::from_raw(raw(0, 0), FILE_WRITE_DATA).unwrap();
        assert_eq!(request.disposition, Disposition::Supersede);
        assert!(request.needs_exclusive());
        assert!(!request.retains_exclusive());

        let request =
            OpenRequest::from_raw(raw(0, FILE_DELETE_ON_CLOSE), FILE_WRITE_DATA).unwrap();
        assert!(request.retains_exclusive());
    }

    #[test]
    fn disposition_flag_table() {
        let flags = |d| OpenFlags::for_request(&OpenRequest::create_file(Access::read_write(), d));
        let f = flags(Disposition::Supersede);
        assert!(f.create && f.truncate && !f.exclusive);
        let f = flags(Disposition::Create);
        assert!(f.create && f.exclusive && !f.truncate);
        let f = flags(Disposition::Open);
        assert!(!f.create && !f.exclusive && !f.truncate);
        let f = flags(Disposition::OpenIf);
        assert!(f.create && !f.truncate);
        let f = flags(Disposition::Overwrite);
        assert!(!f.create && f.truncate);
        let f = flags(Disposition::OverwriteIf);
        assert!(f.create && f.truncate);
    }

    #[test]
    fn mode_from_attributes_matches_readonly_and_directory_bits() {
        assert_eq!(OpenRequest::mode_from_attributes(0), 0o666);
        assert_eq!(OpenRequest::mode_from_attributes(0x1), 0o444);
        assert_eq!(OpenRequest::mode_from_attributes(0x10), 0o777);
    }
}
