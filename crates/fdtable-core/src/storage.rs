// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage-layer seam consumed by open files, plus an in-memory backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{FdError, FdResult};
use crate::sync::lock;
use crate::{OpenFlags, StorageHandle};

/// Storage backend trait: path resolution and positioned byte I/O
///
/// Every handle returned by `resolve_and_open` is released exactly once.
#[cfg_attr(test, mockall::automock)]
pub trait StorageLayer: Send + Sync {
    /// Resolve `path` according to the create/exclusive/truncate bits of `flags`
    fn resolve_and_open(&self, path: &str, flags: OpenFlags, mode: u32)
        -> FdResult<StorageHandle>;
    fn read(&self, handle: StorageHandle, offset: u64, buf: &mut [u8]) -> FdResult<usize>;
    fn write(&self, handle: StorageHandle, offset: u64, data: &[u8]) -> FdResult<usize>;
    /// Current length in bytes of the object behind `handle`
    fn size(&self, handle: StorageHandle) -> FdResult<u64>;
    fn release(&self, handle: StorageHandle);
}

#[derive(Clone, Debug)]
enum NodeKind {
    File { data: Vec<u8> },
    Directory,
}

#[derive(Clone, Debug)]
struct Node {
    kind: NodeKind,
    mode: u32,
}

/// In-memory storage backend implementation
///
/// A flat namespace keyed by absolute path. Directories exist only so that
/// parent lookups and `IsADirectory` behave like a real tree.
pub struct InMemoryStorage {
    next_id: Mutex<u64>,
    nodes: Mutex<HashMap<String, Node>>,
    open: Mutex<HashMap<StorageHandle, String>>,
    releases: AtomicU64,
}

impl InMemoryStorage {
    /// Writes that would grow a file past this many bytes fail with `NoSpace`
    pub const MAX_FILE_SIZE: u64 = 1 << 30;

    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                kind: NodeKind::Directory,
                mode: 0o755,
            },
        );
        Self {
            next_id: Mutex::new(1),
            nodes: Mutex::new(nodes),
            open: Mutex::new(HashMap::new()),
            releases: AtomicU64::new(0),
        }
    }

    fn get_next_id(&self) -> StorageHandle {
        let mut next_id = lock(&self.next_id);
        let id = StorageHandle::new(*next_id);
        *next_id += 1;
        id
    }

    fn parent_of(path: &str) -> Option<&str> {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) => Some("/"),
            Some(idx) => Some(&trimmed[..idx]),
            None => None,
        }
    }

    fn check_parent(nodes: &HashMap<String, Node>, path: &str) -> FdResult<()> {
        let Some(parent) = Self::parent_of(path) else {
            return Err(FdError::InvalidArgument);
        };
        match nodes.get(parent) {
            Some(Node {
                kind: NodeKind::Directory,
                ..
            }) => Ok(()),
            Some(_) => Err(FdError::NotADirectory),
            None => Err(FdError::NotFound),
        }
    }

    fn path_for(&self, handle: StorageHandle) -> FdResult<String> {
        lock(&self.open).get(&handle).cloned().ok_or(FdError::InvalidArgument)
    }

    /// Create a directory; the parent must already exist
    pub fn mkdir(&self, path: &str) -> FdResult<()> {
        let mut nodes = lock(&self.nodes);
        if path == "/" || !path.starts_with('/') {
            return Err(FdError::InvalidArgument);
        }
        Self::check_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(FdError::AlreadyExists);
        }
        nodes.insert(
            path.to_string(),
            Node {
                kind: NodeKind::Directory,
                mode: 0o755,
            },
        );
        Ok(())
    }

    /// Seed a regular file, replacing any previous content
    pub fn insert_file(&self, path: &str, contents: &[u8], mode: u32) -> FdResult<()> {
        let mut nodes = lock(&self.nodes);
        Self::check_parent(&nodes, path)?;
        nodes.insert(
            path.to_string(),
            Node {
                kind: NodeKind::File {
                    data: contents.to_vec(),
                },
                mode: mode & 0o777,
            },
        );
        Ok(())
    }

    /// Snapshot of a regular file's bytes
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match &lock(&self.nodes).get(path)?.kind {
            NodeKind::File { data } => Some(data.clone()),
            NodeKind::Directory => None,
        }
    }

    /// Handles resolved but not yet released
    pub fn open_handle_count(&self) -> usize {
        lock(&self.open).len()
    }

    /// Total number of `release` calls that matched a live handle
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl StorageLayer for InMemoryStorage {
    fn resolve_and_open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> FdResult<StorageHandle> {
        if !path.starts_with('/') {
            return Err(FdError::InvalidArgument);
        }
        let access = flags.access_mode()?;

        let mut nodes = lock(&self.nodes);
        if let Some(node) = nodes.get_mut(path) {
            if flags.create() && flags.exclusive() {
                return Err(FdError::AlreadyExists);
            }
            let node_mode = node.mode;
            match &mut node.kind {
                NodeKind::Directory if access.can_write() => return Err(FdError::IsADirectory),
                NodeKind::Directory => {}
                NodeKind::File { data } => {
                    if (access.can_read() && node_mode & 0o400 == 0)
                        || (access.can_write() && node_mode & 0o200 == 0)
                    {
                        return Err(FdError::AccessDenied);
                    }
                    if flags.truncate() && access.can_write() {
                        data.clear();
                    }
                }
            }
        } else {
            Self::check_parent(&nodes, path)?;
            if !flags.create() {
                return Err(FdError::NotFound);
            }
            nodes.insert(
                path.to_string(),
                Node {
                    kind: NodeKind::File { data: Vec::new() },
                    mode: mode & 0o777,
                },
            );
        }
        drop(nodes);

        let handle = self.get_next_id();
        lock(&self.open).insert(handle, path.to_string());
        Ok(handle)
    }

    fn read(&self, handle: StorageHandle, offset: u64, buf: &mut [u8]) -> FdResult<usize> {
        let path = self.path_for(handle)?;
        let nodes = lock(&self.nodes);
        let node = nodes.get(&path).ok_or(FdError::NotFound)?;
        let content = match &node.kind {
            NodeKind::File { data } => data,
            NodeKind::Directory => return Err(FdError::IsADirectory),
        };

        let start = offset as usize;
        if start >= content.len() {
            return Ok(0);
        }

        let end = std::cmp::min(start + buf.len(), content.len());
        let bytes_to_copy = end - start;
        buf[..bytes_to_copy].copy_from_slice(&content[start..end]);
        Ok(bytes_to_copy)
    }

    fn write(&self, handle: StorageHandle, offset: u64, data: &[u8]) -> FdResult<usize> {
        let path = self.path_for(handle)?;
        let mut nodes = lock(&self.nodes);
        let node = nodes.get_mut(&path).ok_or(FdError::NotFound)?;
        let content = match &mut node.kind {
            NodeKind::File { data } => data,
            NodeKind::Directory => return Err(FdError::IsADirectory),
        };

        let start = usize::try_from(offset).map_err(|_| FdError::NoSpace)?;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end as u64 <= Self::MAX_FILE_SIZE)
            .ok_or(FdError::NoSpace)?;

        if end > content.len() {
            content
                .try_reserve(end - content.len())
                .map_err(|_| FdError::NoSpace)?;
            content.resize(end, 0);
        }

        content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn size(&self, handle: StorageHandle) -> FdResult<u64> {
        let path = self.path_for(handle)?;
        let nodes = lock(&self.nodes);
        match &nodes.get(&path).ok_or(FdError::NotFound)?.kind {
            NodeKind::File { data } => Ok(data.len() as u64),
            NodeKind::Directory => Ok(0),
        }
    }

    fn release(&self, handle: StorageHandle) {
        if lock(&self.open).remove(&handle).is_some() {
            self.releases.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::warn!(%handle, "release of unknown storage handle");
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}
