// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-process descriptor tables
//!
//! A table is a fixed number of slots, each empty or owning one
//! [`OpenFileRef`]. Every slot mutation happens under a single table-wide
//! lock; references removed from a slot are released only after that lock is
//! dropped, so storage work never runs while the table is locked.

use std::sync::{Arc, Mutex};

use crate::config::FdTableConfig;
use crate::error::{FdError, FdResult};
use crate::open_file::{OpenFile, OpenFileRef};
use crate::sync::lock;
use crate::RawFd;

pub struct FileDescriptorTable {
    slots: Mutex<Vec<Option<OpenFileRef>>>,
}

impl FileDescriptorTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn with_config(config: &FdTableConfig) -> Self {
        Self::new(config.limits.max_open_files)
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Number of occupied slots
    pub fn open_count(&self) -> usize {
        lock(&self.slots).iter().filter(|slot| slot.is_some()).count()
    }

    fn slot_index(fd: RawFd, len: usize) -> FdResult<usize> {
        usize::try_from(fd)
            .ok()
            .filter(|&idx| idx < len)
            .ok_or(FdError::BadFileDescriptor)
    }

    fn lowest_free(slots: &[Option<OpenFileRef>]) -> Option<usize> {
        slots.iter().position(Option::is_none)
    }

    /// Install `file` in the lowest-numbered empty slot.
    ///
    /// Ownership moves into the table. When the table is full the reference
    /// is released and `TooManyOpenFiles` returned.
    pub fn place(&self, file: OpenFileRef) -> FdResult<RawFd> {
        let mut slots = lock(&self.slots);
        match Self::lowest_free(&slots) {
            Some(idx) => {
                tracing::debug!(fd = idx, path = file.path(), refs = file.ref_count(), "installed descriptor");
                slots[idx] = Some(file);
                Ok(idx as RawFd)
            }
            None => {
                let capacity = slots.len();
                drop(slots);
                tracing::warn!(capacity, path = file.path(), "descriptor table full");
                file.release();
                Err(FdError::TooManyOpenFiles)
            }
        }
    }

    /// Swap the content of slot `fd` with `file` and hand back whatever was
    /// there. The caller owns the returned reference and must release it.
    pub fn place_at(&self, file: Option<OpenFileRef>, fd: RawFd) -> FdResult<Option<OpenFileRef>> {
        let mut slots = lock(&self.slots);
        let idx = Self::slot_index(fd, slots.len())?;
        Ok(std::mem::replace(&mut slots[idx], file))
    }

    /// Borrow the open file behind `fd`. The borrow does not count as a
    /// reference; the table keeps ownership.
    pub fn get(&self, fd: RawFd) -> FdResult<Arc<OpenFile>> {
        let slots = lock(&self.slots);
        let idx = Self::slot_index(fd, slots.len())?;
        slots[idx]
            .as_ref()
            .map(OpenFileRef::borrow)
            .ok_or(FdError::BadFileDescriptor)
    }

    pub fn is_valid(&self, fd: RawFd) -> bool {
        let slots = lock(&self.slots);
        Self::slot_index(fd, slots.len())
            .map(|idx| slots[idx].is_some())
            .unwrap_or(false)
    }

    pub fn close(&self, fd: RawFd) -> FdResult<()> {
        match self.place_at(None, fd)? {
            Some(previous) => {
                tracing::debug!(fd, path = previous.path(), refs = previous.ref_count() - 1, "closed descriptor");
                previous.release();
                Ok(())
            }
            None => Err(FdError::BadFileDescriptor),
        }
    }

    /// Install a second reference to the file behind `fd` in the lowest free
    /// slot
    pub fn duplicate(&self, fd: RawFd) -> FdResult<RawFd> {
        let mut slots = lock(&self.slots);
        let src = Self::slot_index(fd, slots.len())?;
        let copy = slots[src]
            .as_ref()
            .map(OpenFileRef::duplicate)
            .ok_or(FdError::BadFileDescriptor)?;
        match Self::lowest_free(&slots) {
            Some(idx) => {
                tracing::debug!(from = fd, to = idx, refs = copy.ref_count(), "duplicated descriptor");
                slots[idx] = Some(copy);
                Ok(idx as RawFd)
            }
            None => {
                let capacity = slots.len();
                drop(slots);
                tracing::warn!(capacity, fd, "descriptor table full");
                copy.release();
                Err(FdError::TooManyOpenFiles)
            }
        }
    }

    /// Make `new_fd` refer to the same open file as `old_fd`, closing
    /// whatever `new_fd` held. Duplicating a descriptor onto itself is a
    /// no-op.
    pub fn duplicate_onto(&self, old_fd: RawFd, new_fd: RawFd) -> FdResult<RawFd> {
        let mut slots = lock(&self.slots);
        let src = Self::slot_index(old_fd, slots.len())?;
        let dst = Self::slot_index(new_fd, slots.len())?;
        let source = slots[src].as_ref().ok_or(FdError::BadFileDescriptor)?;
        if src == dst {
            return Ok(new_fd);
        }

        let copy = source.duplicate();
        tracing::debug!(from = old_fd, to = new_fd, refs = copy.ref_count(), "duplicated descriptor onto slot");
        let previous = std::mem::replace(&mut slots[dst], Some(copy));
        drop(slots);

        if let Some(previous) = previous {
            previous.release();
        }
        Ok(new_fd)
    }

    /// Table for a child process: same capacity, every open descriptor
    /// shared with this one
    pub fn inherit(&self) -> FileDescriptorTable {
        let slots = lock(&self.slots);
        let inherited = slots
            .iter()
            .map(|slot| slot.as_ref().map(OpenFileRef::duplicate))
            .collect();
        FileDescriptorTable {
            slots: Mutex::new(inherited),
        }
    }

    /// Release every occupied slot as if each were closed. Returns how many
    /// descriptors were open.
    pub fn close_all(&self) -> usize {
        let taken: Vec<OpenFileRef> = {
            let mut slots = lock(&self.slots);
            slots.iter_mut().filter_map(Option::take).collect()
        };
        let count = taken.len();
        for file in taken {
            file.release();
        }
        count
    }
}

impl std::fmt::Debug for FileDescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = lock(&self.slots);
        let open: Vec<(usize, &str)> = slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|file| (idx, file.path())))
            .collect();
        f.debug_struct("FileDescriptorTable")
            .field("capacity", &slots.len())
            .field("open", &open)
            .finish()
    }
}
