// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory storage backend

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use sharefs_pathlock::NormalizedPath;

use super::{base_name, Backend, BackendFile};
use crate::error::{FsError, FsResult};
use crate::options::OpenFlags;
use crate::types::Metadata;

struct Node {
    is_dir: bool,
    mode: u32,
    data: RwLock<Vec<u8>>,
    modified: Mutex<SystemTime>,
}

impl Node {
    fn new(is_dir: bool, mode: u32) -> Arc<Self> {
        Arc::new(Self {
            is_dir,
            mode,
            data: RwLock::new(Vec::new()),
            modified: Mutex::new(SystemTime::now()),
        })
    }

    fn metadata(&self, name: &str) -> Metadata {
        Metadata {
            name: name.to_string(),
            len: if self.is_dir { 0 } else { self.data.read().len() as u64 },
            is_dir: self.is_dir,
            mode: self.mode,
            modified: *self.modified.lock(),
        }
    }

    fn touch(&self) {
        *self.modified.lock() = SystemTime::now();
    }
}

type Tree = BTreeMap<String, Arc<Node>>;

/// Direct children of `dir`, in name order.
fn children<'a>(tree: &'a Tree, dir: &str) -> impl Iterator<Item = (&'a String, &'a Arc<Node>)> + 'a {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
    let skip = prefix.len();
    tree.range(prefix.clone()..)
        .take_while(move |(key, _)| key.starts_with(&prefix))
        .filter(move |(key, _)| key.len() > skip && !key[skip..].contains('/'))
}

/// Tree of files and directories kept in memory
pub struct InMemoryBackend {
    tree: Arc<RwLock<Tree>>,
    max_file_size: usize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let mut tree = Tree::new();
        tree.insert("/".to_string(), Node::new(true, 0o755));
        Self {
            tree: Arc::new(RwLock::new(tree)),
            max_file_size: isize::MAX as usize,
        }
    }

    /// Refuse to grow any file past `limit` bytes.
    pub fn with_max_file_size(limit: u64) -> Self {
        Self {
            max_file_size: usize::try_from(limit).unwrap_or(usize::MAX).min(isize::MAX as usize),
            ..Self::new()
        }
    }

    /// Number of objects stored, the root included.
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn check_parent(tree: &Tree, path: &NormalizedPath) -> FsResult<()> {
        let parent = path.parent().ok_or(FsError::InvalidParameter)?;
        match tree.get(parent.as_str()) {
            Some(node) if node.is_dir => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => Err(FsError::NotFound),
        }
    }
}

impl Backend for InMemoryBackend {
    fn open_file(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Box<dyn BackendFile>> {
        let path = NormalizedPath::new(path);
        let node = {
            let mut tree = self.tree.write();
            match tree.get(path.as_str()).cloned() {
                Some(_) if flags.create && flags.exclusive => return Err(FsError::AlreadyExists),
                Some(node) => {
                    if node.is_dir && (flags.write || flags.append || flags.truncate) {
                        return Err(FsError::IsADirectory);
                    }
                    node
                }
                None if flags.create => {
                    Self::check_parent(&tree, &path)?;
                    let node = Node::new(false, mode & 0o7777);
                    tree.insert(path.as_str().to_string(), Arc::clone(&node));
                    node
                }
                None => return Err(FsError::NotFound),
            }
        };
        if flags.truncate {
            node.data.write().clear();
            node.touch();
        }
        Ok(Box::new(MemFile {
            tree: Arc::clone(&self.tree),
            path,
            node,
            readable: flags.read || !flags.write,
            writable: flags.write || flags.append,
            max_len: self.max_file_size,
        }))
    }

    fn stat(&self, path: &str) -> FsResult<Metadata> {
        let path = NormalizedPath::new(path);
        let tree = self.tree.read();
        let node = tree.get(path.as_str()).ok_or(FsError::NotFound)?;
        Ok(node.metadata(base_name(path.as_str())))
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let path = NormalizedPath::new(path);
        let mut tree = self.tree.write();
        if tree.contains_key(path.as_str()) {
            return Err(FsError::AlreadyExists);
        }
        Self::check_parent(&tree, &path)?;
        tree.insert(path.as_str().to_string(), Node::new(true, mode & 0o7777));
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from = NormalizedPath::new(from);
        let to = NormalizedPath::new(to);
        if from.is_root() || to.is_root() {
            return Err(FsError::AccessDenied);
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(FsError::InvalidParameter);
        }
        let mut tree = self.tree.write();
        let source = tree.get(from.as_str()).cloned().ok_or(FsError::NotFound)?;
        Self::check_parent(&tree, &to)?;
        if let Some(target) = tree.get(to.as_str()) {
            match (source.is_dir, target.is_dir) {
                (false, true) => return Err(FsError::IsADirectory),
                (true, false) => return Err(FsError::NotADirectory),
                (true, true) if children(&tree, to.as_str()).next().is_some() => {
                    return Err(FsError::DirectoryNotEmpty)
                }
                _ => {}
            }
        }

        let prefix = format!("{}/", from.as_str());
        let moved: Vec<(String, Arc<Node>)> = tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, node)| (key.clone(), Arc::clone(node)))
            .collect();
        tree.remove(from.as_str());
        tree.insert(to.as_str().to_string(), source);
        for (key, node) in moved {
            tree.remove(&key);
            let suffix = &key[from.as_str().len()..];
            tree.insert(format!("{}{}", to.as_str(), suffix), node);
        }
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let path = NormalizedPath::new(path);
        if path.is_root() {
            return Err(FsError::AccessDenied);
        }
        let mut tree = self.tree.write();
        let node = tree.get(path.as_str()).ok_or(FsError::NotFound)?;
        if node.is_dir && children(&tree, path.as_str()).next().is_some() {
            return Err(FsError::DirectoryNotEmpty);
        }
        tree.remove(path.as_str());
        Ok(())
    }
}

struct MemFile {
    tree: Arc<RwLock<Tree>>,
    path: NormalizedPath,
    node: Arc<Node>,
    readable: bool,
    writable: bool,
    max_len: usize,
}

impl MemFile {
    fn file_data(&self) -> FsResult<&RwLock<Vec<u8>>> {
        if self.node.is_dir {
            return Err(FsError::IsADirectory);
        }
        Ok(&self.node.data)
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FsError::AccessDenied)
        }
    }
}

fn offset_to_index(offset: u64) -> FsResult<usize> {
    usize::try_from(offset).map_err(|_| FsError::InvalidParameter)
}

/// Resize `content` to `len`, failing with `NoSpace` past `max_len` or when
/// the allocation can't be made.
fn resize_bounded(content: &mut Vec<u8>, len: usize, max_len: usize) -> FsResult<()> {
    if len > max_len {
        return Err(FsError::NoSpace);
    }
    if let Some(extra) = len.checked_sub(content.len()) {
        content.try_reserve(extra).map_err(|_| FsError::NoSpace)?;
    }
    content.resize(len, 0);
    Ok(())
}

impl BackendFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if !self.readable {
            return Err(FsError::AccessDenied);
        }
        let data = self.file_data()?.read();
        let start = offset_to_index(offset)?;
        if start >= data.len() {
            return Ok(0);
        }
        let end = data.len().min(start + buf.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.check_writable()?;
        let mut content = self.file_data()?.write();
        let start = offset_to_index(offset)?;
        let end = start.checked_add(data.len()).ok_or(FsError::NoSpace)?;
        if end > content.len() {
            resize_bounded(&mut content, end, self.max_len)?;
        }
        content[start..end].copy_from_slice(data);
        self.node.touch();
        Ok(data.len())
    }

    fn truncate(&self, size: u64) -> FsResult<()> {
        self.check_writable()?;
        let size = usize::try_from(size).map_err(|_| FsError::NoSpace)?;
        resize_bounded(&mut self.file_data()?.write(), size, self.max_len)?;
        self.node.touch();
        Ok(())
    }

    fn sync(&self) -> FsResult<()> {
        Ok(())
    }

    fn readdir(&self) -> FsResult<Vec<Metadata>> {
        if !self.node.is_dir {
            return Err(FsError::NotADirectory);
        }
        let tree = self.tree.read();
        Ok(children(&tree, self.path.as_str())
            .map(|(key, node)| node.metadata(base_name(key)))
            .collect())
    }

    fn stat(&self) -> FsResult<Metadata> {
        Ok(self.node.metadata(base_name(self.path.as_str())))
    }

    fn close(&self) -> FsResult<()> {
        Ok(())
    }

    fn append(&self, data: &[u8]) -> FsResult<usize> {
        self.check_writable()?;
        let mut content = self.file_data()?.write();
        let end = content.len().checked_add(data.len()).ok_or(FsError::NoSpace)?;
        if end > self.max_len {
            return Err(FsError::NoSpace);
        }
        content.try_reserve(data.len()).map_err(|_| FsError::NoSpace)?;
        content.extend_from_slice(data);
        self.node.touch();
        Ok(data.len())
    }

    fn constrained_write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.check_writable()?;
        let mut content = self.file_data()?.write();
        let start = offset_to_index(offset)?;
        if start >= content.len() {
            return Ok(0);
        }
        let n = data.len().min(content.len() - start);
        content[start..start + n].copy_from_slice(&data[..n]);
        self.node.touch();
        Ok(n)
    }
}
