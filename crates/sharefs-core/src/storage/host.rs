// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage backend over a directory of the host filesystem

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{base_name, Backend, BackendFile};
use crate::error::{FsError, FsResult};
use crate::options::OpenFlags;
use crate::types::Metadata;

/// Serves paths relative to `root`
pub struct HostFsBackend {
    root: PathBuf,
}

impl HostFsBackend {
    pub fn new(root: PathBuf) -> FsResult<Self> {
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "host backend ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn metadata_of(name: &str, meta: &fs::Metadata) -> FsResult<Metadata> {
    Ok(Metadata {
        name: name.to_string(),
        len: if meta.is_dir() { 0 } else { meta.len() },
        is_dir: meta.is_dir(),
        mode: permission_bits(meta),
        modified: meta.modified()?,
    })
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    let base = if meta.permissions().readonly() { 0o444 } else { 0o666 };
    if meta.is_dir() {
        base | 0o111
    } else {
        base
    }
}

#[cfg(unix)]
fn with_mode(options: &mut OpenOptions, mode: u32) {
    use std::os::unix::fs::OpenOptionsExt;
    if mode != 0 {
        options.mode(mode);
    }
}

#[cfg(windows)]
fn with_mode(options: &mut OpenOptions, _mode: u32) {
    // Directories can only be opened with backup semantics.
    use std::os::windows::fs::OpenOptionsExt;
    options.custom_flags(0x0200_0000);
}

impl Backend for HostFsBackend {
    fn open_file(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Box<dyn BackendFile>> {
        let host_path = self.resolve(path);

        // Creating or truncating needs a plain writable descriptor; do it up
        // front when the handle itself won't be writable or is append-only,
        // since append and truncate can't be combined in one open.
        let prepared = (flags.create || flags.truncate) && (!flags.write || flags.append);
        if prepared {
            let mut options = OpenOptions::new();
            options
                .write(true)
                .create(flags.create && !flags.exclusive)
                .create_new(flags.create && flags.exclusive)
                .truncate(flags.truncate);
            with_mode(&mut options, mode);
            options.open(&host_path)?;
        }

        let mut options = OpenOptions::new();
        options
            .read(flags.read || !(flags.write || flags.append))
            .write(flags.write && !flags.append)
            .append(flags.append);
        if !prepared {
            options
                .create(flags.create && !flags.exclusive)
                .create_new(flags.create && flags.exclusive)
                .truncate(flags.truncate);
        }
        with_mode(&mut options, mode);
        let file = options.open(&host_path)?;
        Ok(Box::new(HostFile {
            file,
            host_path,
            name: base_name(path).to_string(),
            append: flags.append,
        }))
    }

    fn stat(&self, path: &str) -> FsResult<Metadata> {
        let meta = fs::metadata(self.resolve(path))?;
        metadata_of(base_name(path), &meta)
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder.create(self.resolve(path))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        fs::rename(self.resolve(from), self.resolve(to))?;
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let host_path = self.resolve(path);
        if fs::symlink_metadata(&host_path)?.is_dir() {
            fs::remove_dir(&host_path)?;
        } else {
            fs::remove_file(&host_path)?;
        }
        Ok(())
    }
}

struct HostFile {
    file: File,
    host_path: PathBuf,
    name: String,
    append: bool,
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, data, offset)
}

#[cfg(windows)]
fn write_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, data, offset)
}

impl BackendFile for HostFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match read_at(&self.file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut written = 0;
        while written < data.len() {
            let n = write_at(&self.file, &data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(FsError::NoSpace);
            }
            written += n;
        }
        Ok(written)
    }

    fn truncate(&self, size: u64) -> FsResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&self) -> FsResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn readdir(&self) -> FsResult<Vec<Metadata>> {
        if !self.file.metadata()?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.host_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(metadata_of(&name, &entry.metadata()?)?);
        }
        Ok(entries)
    }

    fn stat(&self) -> FsResult<Metadata> {
        metadata_of(&self.name, &self.file.metadata()?)
    }

    fn close(&self) -> FsResult<()> {
        Ok(())
    }

    fn append(&self, data: &[u8]) -> FsResult<usize> {
        if self.append {
            (&self.file).write_all(data)?;
            return Ok(data.len());
        }
        let size = self.file.metadata()?.len();
        self.write_at(data, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_create() -> OpenFlags {
        OpenFlags {
            read: true,
            write: true,
            create: true,
            ..OpenFlags::default()
        }
    }

    #[test]
    fn read_write_and_stat_under_root() {
        let temp = tempfile::tempdir().unwrap();
        let backend = HostFsBackend::new(temp.path().join("store")).unwrap();
        backend.mkdir("/d", 0o755).unwrap();
        let file = backend.open_file("/d/f.txt", rw_create(), 0o644).unwrap();
        assert_eq!(file.write_at(b"hello world", 0).unwrap(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        let meta = backend.stat("/d/f.txt").unwrap();
        assert_eq!(meta.name, "f.txt");
        assert_eq!(meta.len, 11);
        assert!(temp.path().join("store/d/f.txt").exists());
    }

    #[test]
    fn read_only_create_and_truncate_work() {
        let temp = tempfile::tempdir().unwrap();
        let backend = HostFsBackend::new(temp.path().to_path_buf()).unwrap();
        let flags = OpenFlags {
            read: true,
            create: true,
            ..OpenFlags::default()
        };
        let file = backend.open_file("/new", flags, 0o644).unwrap();
        assert_eq!(file.stat().unwrap().len, 0);

        std::fs::write(temp.path().join("full"), b"data").unwrap();
        let flags = OpenFlags {
            read: true,
            truncate: true,
            ..OpenFlags::default()
        };
        backend.open_file("/full", flags, 0).unwrap();
        assert_eq!(backend.stat("/full").unwrap().len, 0);
    }

    #[test]
    fn missing_and_existing_paths_map_to_typed_errors() {
        let temp = tempfile::tempdir().unwrap();
        let backend = HostFsBackend::new(temp.path().to_path_buf()).unwrap();
        assert!(matches!(
            backend.open_file("/nope", OpenFlags::read_only(), 0),
            Err(FsError::NotFound)
        ));
        backend.mkdir("/d", 0o755).unwrap();
        assert!(matches!(backend.mkdir("/d", 0o755), Err(FsError::AlreadyExists)));
        backend.open_file("/d/x", rw_create(), 0o644).unwrap();
        assert!(matches!(backend.remove("/d"), Err(FsError::DirectoryNotEmpty)));
    }

    #[test]
    fn readdir_and_rename() {
        let temp = tempfile::tempdir().unwrap();
        let backend = HostFsBackend::new(temp.path().to_path_buf()).unwrap();
        backend.mkdir("/d", 0o755).unwrap();
        backend.open_file("/d/a", rw_create(), 0o644).unwrap();
        backend.open_file("/d/b", rw_create(), 0o644).unwrap();
        let dir = backend.open_file("/d", OpenFlags::read_only(), 0).unwrap();
        let mut names: Vec<_> = dir.readdir().unwrap().into_iter().map(|m| m.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        backend.rename("/d/a", "/d/c").unwrap();
        assert!(backend.stat("/d/a").is_err());
        assert!(backend.stat("/d/c").is_ok());
        backend.remove("/d/c").unwrap();
        backend.remove("/d/b").unwrap();
        backend.remove("/d").unwrap();
    }

    #[test]
    fn append_handle_writes_at_end() {
        let temp = tempfile::tempdir().unwrap();
        let backend = HostFsBackend::new(temp.path().to_path_buf()).unwrap();
        let file = backend.open_file("/log", rw_create(), 0o644).unwrap();
        file.write_at(b"one ", 0).unwrap();
        let flags = OpenFlags {
            append: true,
            write: true,
            ..OpenFlags::default()
        };
        let appender = backend.open_file("/log", flags, 0).unwrap();
        appender.append(b"two").unwrap();
        assert_eq!(std::fs::read(temp.path().join("log")).unwrap(), b"one two");
    }

    #[test]
    fn append_only_handle_can_overwrite_and_supersede() {
        let temp = tempfile::tempdir().unwrap();
        let backend = HostFsBackend::new(temp.path().to_path_buf()).unwrap();
        let file = backend.open_file("/log", rw_create(), 0o644).unwrap();
        file.write_at(b"stale contents", 0).unwrap();

        let overwrite_if = OpenFlags {
            write: true,
            append: true,
            create: true,
            truncate: true,
            ..OpenFlags::default()
        };
        let appender = backend.open_file("/log", overwrite_if, 0o644).unwrap();
        assert_eq!(appender.stat().unwrap().len, 0);
        appender.append(b"fresh").unwrap();
        assert_eq!(std::fs::read(temp.path().join("log")).unwrap(), b"fresh");

        let overwrite = OpenFlags {
            create: false,
            ..overwrite_if
        };
        let appender = backend.open_file("/log", overwrite, 0).unwrap();
        assert_eq!(appender.stat().unwrap().len, 0);

        let append_only_supersede = OpenFlags {
            write: false,
            ..overwrite_if
        };
        let appender = backend.open_file("/new", append_only_supersede, 0o644).unwrap();
        appender.append(b"x").unwrap();
        assert_eq!(std::fs::read(temp.path().join("new")).unwrap(), b"x");
    }
}
