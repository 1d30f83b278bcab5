// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend decorator that fails operations according to a [`FaultPolicy`]
//!
//! [`FaultPolicy`]: crate::fault::FaultPolicy

use std::sync::Arc;

use super::{Backend, BackendFile};
use crate::error::FsResult;
use crate::fault::{FaultInjector, FaultOp};
use crate::options::OpenFlags;
use crate::types::Metadata;

pub struct FaultInjectingBackend {
    inner: Arc<dyn Backend>,
    injector: Arc<FaultInjector>,
}

impl FaultInjectingBackend {
    pub fn new(inner: Arc<dyn Backend>, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    /// Live controller; policy changes apply to files already open.
    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }

    fn check(&self, op: FaultOp, path: &str) -> FsResult<()> {
        match self.injector.should_fault(op, path) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Backend for FaultInjectingBackend {
    fn open_file(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Box<dyn BackendFile>> {
        self.check(FaultOp::Open, path)?;
        let inner = self.inner.open_file(path, flags, mode)?;
        Ok(Box::new(FaultFile {
            inner,
            path: path.to_string(),
            injector: Arc::clone(&self.injector),
        }))
    }

    fn stat(&self, path: &str) -> FsResult<Metadata> {
        self.check(FaultOp::Stat, path)?;
        self.inner.stat(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.check(FaultOp::Mkdir, path)?;
        self.inner.mkdir(path, mode)
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.check(FaultOp::Rename, from)?;
        self.inner.rename(from, to)
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.check(FaultOp::Remove, path)?;
        self.inner.remove(path)
    }
}

struct FaultFile {
    inner: Box<dyn BackendFile>,
    path: String,
    injector: Arc<FaultInjector>,
}

impl FaultFile {
    fn check(&self, op: FaultOp) -> FsResult<()> {
        match self.injector.should_fault(op, &self.path) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl BackendFile for FaultFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.check(FaultOp::Read)?;
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.check(FaultOp::Write)?;
        self.inner.write_at(data, offset)
    }

    fn truncate(&self, size: u64) -> FsResult<()> {
        self.check(FaultOp::Truncate)?;
        self.inner.truncate(size)
    }

    fn sync(&self) -> FsResult<()> {
        self.check(FaultOp::Sync)?;
        self.inner.sync()
    }

    fn readdir(&self) -> FsResult<Vec<Metadata>> {
        self.check(FaultOp::Readdir)?;
        self.inner.readdir()
    }

    fn stat(&self) -> FsResult<Metadata> {
        self.check(FaultOp::Stat)?;
        self.inner.stat()
    }

    fn close(&self) -> FsResult<()> {
        self.inner.close()
    }

    fn append(&self, data: &[u8]) -> FsResult<usize> {
        self.check(FaultOp::Write)?;
        self.inner.append(data)
    }

    fn constrained_write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.check(FaultOp::Write)?;
        self.inner.constrained_write_at(data, offset)
    }

    fn shrink(&self, size: u64) -> FsResult<()> {
        self.check(FaultOp::Truncate)?;
        self.inner.shrink(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::fault::{FaultErrno, FaultPolicy, FaultRule};
    use crate::storage::InMemoryBackend;

    #[test]
    fn file_operations_fail_after_policy_change() {
        let injector = Arc::new(FaultInjector::new());
        let backend =
            FaultInjectingBackend::new(Arc::new(InMemoryBackend::new()), Arc::clone(&injector));
        let flags = OpenFlags {
            read: true,
            write: true,
            create: true,
            ..OpenFlags::default()
        };
        let file = backend.open_file("/f", flags, 0o644).unwrap();
        file.write_at(b"ok", 0).unwrap();

        injector.set_policy(FaultPolicy {
            enabled: true,
            rules: vec![FaultRule {
                op: FaultOp::Write,
                errno: FaultErrno::Enospc,
                max_faults: Some(1),
                ..FaultRule::default()
            }],
        });
        assert!(matches!(file.append(b"!"), Err(FsError::NoSpace)));
        assert_eq!(file.append(b"!").unwrap(), 1);
        assert_eq!(file.stat().unwrap().len, 3);
        assert_eq!(backend.injector().injected(), 1);
    }
}
