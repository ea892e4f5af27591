// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared open-file objects
//!
//! An [`OpenFile`] is one instance of a file opened against the storage
//! layer. Descriptor-table slots never hold it directly: each slot owns one
//! [`OpenFileRef`], and the object's reference count is the number of live
//! `OpenFileRef`s. The storage handle is released when the last one goes
//! away, and never before.
//!
//! Offset-affecting operations (`read`, `write`, `seek`) take the object's
//! offset lock for the whole storage call, so descriptors that share one
//! `OpenFile` (by duplication or inheritance) observe a single total order
//! over their I/O.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{FdError, FdResult};
use crate::storage::StorageLayer;
use crate::sync::lock;
use crate::{AccessMode, OpenFlags, StorageHandle};

#[derive(Debug)]
struct OffsetState {
    offset: u64,
    /// `None` once the final reference has been released
    handle: Option<StorageHandle>,
}

/// One open instance of a storage object, shared by every descriptor that
/// refers to it
pub struct OpenFile {
    storage: Arc<dyn StorageLayer>,
    path: String,
    access_mode: AccessMode,
    append: bool,
    state: Mutex<OffsetState>,
    refs: AtomicUsize,
}

impl OpenFile {
    /// Resolve `path` through the storage layer and wrap the result.
    ///
    /// The returned reference is the only one; installing it in a table moves
    /// it there. Append-mode files start positioned at end-of-file.
    pub fn open(
        storage: Arc<dyn StorageLayer>,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> FdResult<OpenFileRef> {
        let access_mode = flags.access_mode()?;
        let handle = storage.resolve_and_open(path, flags, mode)?;

        let offset = if flags.append() {
            match storage.size(handle) {
                Ok(size) => size,
                Err(err) => {
                    storage.release(handle);
                    return Err(err);
                }
            }
        } else {
            0
        };

        tracing::debug!(path, %handle, mode = %access_mode, append = flags.append(), "opened file");

        Ok(OpenFileRef {
            file: Arc::new(OpenFile {
                storage,
                path: path.to_string(),
                access_mode,
                append: flags.append(),
                state: Mutex::new(OffsetState {
                    offset,
                    handle: Some(handle),
                }),
                refs: AtomicUsize::new(1),
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn is_append(&self) -> bool {
        self.append
    }

    /// Number of owning references (table slots plus references in transit)
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> u64 {
        lock(&self.state).offset
    }

    /// Read at the shared offset and advance it by the bytes transferred.
    /// Zero means end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> FdResult<usize> {
        if !self.access_mode.can_read() {
            return Err(FdError::WrongAccessMode);
        }

        let mut state = lock(&self.state);
        let handle = state.handle.ok_or(FdError::BadFileDescriptor)?;
        let read = self.storage.read(handle, state.offset, buf)?;
        state.offset += read as u64;

        tracing::trace!(path = %self.path, read, offset = state.offset, "read");
        Ok(read)
    }

    /// Write at the shared offset (end-of-file for append files) and advance
    /// it by the bytes written
    pub fn write(&self, data: &[u8]) -> FdResult<usize> {
        if !self.access_mode.can_write() {
            return Err(FdError::WrongAccessMode);
        }

        let mut state = lock(&self.state);
        let handle = state.handle.ok_or(FdError::BadFileDescriptor)?;
        let position = if self.append {
            self.storage.size(handle)?
        } else {
            state.offset
        };
        let written = self.storage.write(handle, position, data)?;
        state.offset = position + written as u64;

        tracing::trace!(path = %self.path, written, offset = state.offset, "write");
        Ok(written)
    }

    /// Reposition the shared offset. Positions before the start of the file
    /// are rejected; positions past the end are allowed.
    pub fn seek(&self, pos: SeekFrom) -> FdResult<u64> {
        let mut state = lock(&self.state);
        let handle = state.handle.ok_or(FdError::BadFileDescriptor)?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => state.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => self.storage.size(handle)?.checked_add_signed(delta),
        }
        .ok_or(FdError::InvalidArgument)?;
        state.offset = target;

        tracing::trace!(path = %self.path, offset = target, "seek");
        Ok(target)
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn drop_ref(&self) {
        // Only the decrement that observes 1 may release the handle
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let handle = lock(&self.state).handle.take();
        if let Some(handle) = handle {
            tracing::debug!(path = %self.path, %handle, "last reference closed, releasing storage");
            self.storage.release(handle);
        }
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("path", &self.path)
            .field("access_mode", &self.access_mode)
            .field("append", &self.append)
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// One unit of ownership of an [`OpenFile`]
///
/// Not `Clone`: a second owner is made with [`OpenFileRef::duplicate`], which
/// bumps the reference count. Dropping (or [`OpenFileRef::release`]) gives the
/// unit back.
#[derive(Debug)]
pub struct OpenFileRef {
    file: Arc<OpenFile>,
}

impl OpenFileRef {
    pub fn duplicate(&self) -> OpenFileRef {
        self.file.add_ref();
        OpenFileRef {
            file: Arc::clone(&self.file),
        }
    }

    pub fn release(self) {
        drop(self);
    }

    /// Non-owning handle to the shared object
    pub fn borrow(&self) -> Arc<OpenFile> {
        Arc::clone(&self.file)
    }

    pub fn same_file(&self, other: &OpenFileRef) -> bool {
        Arc::ptr_eq(&self.file, &other.file)
    }
}

impl std::ops::Deref for OpenFileRef {
    type Target = OpenFile;

    fn deref(&self) -> &OpenFile {
        &self.file
    }
}

impl Drop for OpenFileRef {
    fn drop(&mut self) {
        self.file.drop_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, MockStorageLayer};
    use crate::types::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_WRONLY};
    use mockall::predicate::eq;
    use std::sync::atomic::AtomicU64;

    fn flags(raw: u32) -> OpenFlags {
        OpenFlags::parse(raw).unwrap()
    }

    fn counting_mock(handle: StorageHandle, releases: Arc<AtomicU64>) -> MockStorageLayer {
        let mut mock = MockStorageLayer::new();
        mock.expect_resolve_and_open().returning(move |_, _, _| Ok(handle));
        mock.expect_release().with(eq(handle)).returning(move |_| {
            releases.fetch_add(1, Ordering::SeqCst);
        });
        mock
    }

    #[test]
    fn test_release_fires_once_after_last_reference() {
        let releases = Arc::new(AtomicU64::new(0));
        let storage: Arc<dyn StorageLayer> =
            Arc::new(counting_mock(StorageHandle::new(7), releases.clone()));

        let first = OpenFile::open(storage, "/f", flags(O_RDONLY), 0).unwrap();
        assert_eq!(first.ref_count(), 1);

        let second = first.duplicate();
        assert_eq!(first.ref_count(), 2);
        assert!(first.same_file(&second));

        first.release();
        assert_eq!(second.ref_count(), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        second.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_access_mode_never_reaches_storage() {
        let mut mock = MockStorageLayer::new();
        mock.expect_resolve_and_open().returning(|_, _, _| Ok(StorageHandle::new(1)));
        mock.expect_read().never();
        mock.expect_write().never();
        mock.expect_release().times(2).return_const(());
        let storage: Arc<dyn StorageLayer> = Arc::new(mock);

        let ro = OpenFile::open(storage.clone(), "/f", flags(O_RDONLY), 0).unwrap();
        assert!(matches!(ro.write(b"x"), Err(FdError::WrongAccessMode)));

        let wo = OpenFile::open(storage, "/f", flags(O_WRONLY), 0).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(wo.read(&mut buf), Err(FdError::WrongAccessMode)));
        assert_eq!(wo.offset(), 0);
    }

    #[test]
    fn test_failed_read_leaves_offset_unchanged() {
        let mut mock = MockStorageLayer::new();
        mock.expect_resolve_and_open().returning(|_, _, _| Ok(StorageHandle::new(3)));
        let mut calls = 0;
        mock.expect_read().returning(move |_, offset, buf: &mut [u8]| {
            calls += 1;
            if calls == 2 {
                return Err(FdError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
            }
            // The failed second call must not have moved the offset
            assert_eq!(offset, if calls == 1 { 0 } else { 4 });
            buf[..4].copy_from_slice(b"abcd");
            Ok(4)
        });
        mock.expect_release().times(1).return_const(());

        let file = OpenFile::open(Arc::new(mock), "/f", flags(O_RDONLY), 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(file.offset(), 4);
        assert!(matches!(file.read(&mut buf), Err(FdError::Io(_))));
        assert_eq!(file.offset(), 4);
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(file.offset(), 8);
    }

    #[test]
    fn test_failed_open_produces_nothing_to_release() {
        let mut mock = MockStorageLayer::new();
        mock.expect_resolve_and_open()
            .returning(|_, _, _| Err(FdError::AlreadyExists));
        mock.expect_release().never();

        let result = OpenFile::open(Arc::new(mock), "/f", flags(O_RDWR | O_CREAT | O_EXCL), 0o644);
        assert!(matches!(result, Err(FdError::AlreadyExists)));
    }

    #[test]
    fn test_append_writes_land_at_end_of_file() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_file("/log", b"head", 0o644).unwrap();

        let file = OpenFile::open(storage.clone(), "/log", flags(O_WRONLY | O_APPEND), 0).unwrap();
        assert_eq!(file.offset(), 4);
        assert!(file.is_append());

        // Someone else grows the file between our writes
        storage.insert_file("/log", b"head-and-more", 0o644).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(file.write(b"!").unwrap(), 1);
        assert_eq!(file.offset(), 14);
        assert_eq!(storage.contents("/log").unwrap(), b"head-and-more!");
    }

    #[test]
    fn test_seek_variants() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_file("/f", b"0123456789", 0o644).unwrap();
        let file = OpenFile::open(storage, "/f", flags(O_RDONLY), 0).unwrap();

        assert_eq!(file.seek(SeekFrom::Start(3)).unwrap(), 3);
        assert_eq!(file.seek(SeekFrom::Current(2)).unwrap(), 5);
        assert_eq!(file.seek(SeekFrom::End(-1)).unwrap(), 9);
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'9');

        assert!(matches!(file.seek(SeekFrom::Current(-100)), Err(FdError::InvalidArgument)));
        assert_eq!(file.offset(), 10);
        assert_eq!(file.seek(SeekFrom::End(5)).unwrap(), 15);
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stale_borrow_after_final_release() {
        let storage = Arc::new(InMemoryStorage::new());
        let owner = OpenFile::open(storage.clone(), "/f", flags(O_RDWR | O_CREAT), 0o644).unwrap();
        let borrowed = owner.borrow();
        assert_eq!(borrowed.ref_count(), 1);

        owner.release();
        assert_eq!(storage.release_count(), 1);
        assert_eq!(borrowed.ref_count(), 0);
        assert!(matches!(borrowed.write(b"x"), Err(FdError::BadFileDescriptor)));
        let mut buf = [0u8; 1];
        assert!(matches!(borrowed.read(&mut buf), Err(FdError::BadFileDescriptor)));
        assert_eq!(storage.release_count(), 1);
    }

    #[test]
    fn test_append_size_failure_releases_handle() {
        let mut mock = MockStorageLayer::new();
        mock.expect_resolve_and_open().returning(|_, _, _| Ok(StorageHandle::new(5)));
        mock.expect_size().returning(|_| Err(FdError::NoSpace));
        mock.expect_release().with(eq(StorageHandle::new(5))).times(1).return_const(());

        let result = OpenFile::open(Arc::new(mock), "/f", flags(O_WRONLY | O_APPEND), 0);
        assert!(matches!(result, Err(FdError::NoSpace)));
    }
}
