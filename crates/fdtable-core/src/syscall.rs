// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File syscalls for one process
//!
//! A [`Process`] is the explicit context every call runs against: its own
//! descriptor table plus the storage layer shared by all processes. The
//! calls resolve a descriptor through the table and then perform the I/O on
//! the borrowed open file, so the table lock is never held across storage
//! work while the open file's offset lock is held for all of it.

use std::io::SeekFrom;
use std::sync::Arc;

use tracing::instrument;

use crate::config::FdTableConfig;
use crate::error::{FdError, FdResult};
use crate::fd_table::FileDescriptorTable;
use crate::open_file::OpenFile;
use crate::storage::StorageLayer;
use crate::usercopy::{UserMemory, UserPtr};
use crate::{OpenFlags, Pid, RawFd};

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

pub struct Process {
    pid: Pid,
    table: FileDescriptorTable,
    storage: Arc<dyn StorageLayer>,
    config: FdTableConfig,
}

impl Process {
    pub fn new(pid: Pid, storage: Arc<dyn StorageLayer>, config: FdTableConfig) -> Self {
        Self {
            pid,
            table: FileDescriptorTable::with_config(&config),
            storage,
            config,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn table(&self) -> &FileDescriptorTable {
        &self.table
    }

    /// `open(2)` with the path still in user memory
    #[instrument(level = "debug", skip(self, mem), fields(pid = %self.pid))]
    pub fn sys_open(
        &self,
        mem: &dyn UserMemory,
        upath: UserPtr,
        flags: u32,
        mode: u32,
    ) -> FdResult<RawFd> {
        let flags = OpenFlags::parse(flags)?;
        let path = mem.copy_in_string(upath, self.config.limits.max_path_len)?;
        self.open_with(&path, flags, mode)
    }

    /// `open(2)` with a path already in kernel memory
    #[instrument(level = "debug", skip(self), fields(pid = %self.pid))]
    pub fn open(&self, path: &str, flags: u32, mode: u32) -> FdResult<RawFd> {
        let flags = OpenFlags::parse(flags)?;
        if path.len() >= self.config.limits.max_path_len {
            return Err(FdError::NameTooLong);
        }
        self.open_with(path, flags, mode)
    }

    fn open_with(&self, path: &str, flags: OpenFlags, mode: u32) -> FdResult<RawFd> {
        let file = OpenFile::open(Arc::clone(&self.storage), path, flags, mode)?;
        let fd = self.table.place(file)?;
        tracing::debug!(pid = %self.pid, fd, path, "open");
        Ok(fd)
    }

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> FdResult<usize> {
        if !self.table.is_valid(fd) {
            return Err(FdError::BadFileDescriptor);
        }
        self.table.get(fd)?.read(buf)
    }

    pub fn write(&self, fd: RawFd, data: &[u8]) -> FdResult<usize> {
        if !self.table.is_valid(fd) {
            return Err(FdError::BadFileDescriptor);
        }
        self.table.get(fd)?.write(data)
    }

    /// `lseek(2)`; `whence` is one of `SEEK_SET`, `SEEK_CUR`, `SEEK_END`
    pub fn lseek(&self, fd: RawFd, offset: i64, whence: i32) -> FdResult<u64> {
        let file = self.table.get(fd)?;
        let pos = match whence {
            SEEK_SET => SeekFrom::Start(u64::try_from(offset).map_err(|_| FdError::InvalidArgument)?),
            SEEK_CUR => SeekFrom::Current(offset),
            SEEK_END => SeekFrom::End(offset),
            _ => return Err(FdError::InvalidArgument),
        };
        file.seek(pos)
    }

    #[instrument(level = "debug", skip(self), fields(pid = %self.pid))]
    pub fn close(&self, fd: RawFd) -> FdResult<()> {
        self.table.close(fd)
    }

    pub fn dup(&self, fd: RawFd) -> FdResult<RawFd> {
        self.table.duplicate(fd)
    }

    /// `dup2(2)`: duplicate `old_fd` onto exactly `new_fd`
    #[instrument(level = "debug", skip(self), fields(pid = %self.pid))]
    pub fn dup2(&self, old_fd: RawFd, new_fd: RawFd) -> FdResult<RawFd> {
        self.table.duplicate_onto(old_fd, new_fd)
    }

    /// Create a child whose table shares every open file with this process
    pub fn fork(&self, child: Pid) -> Process {
        let table = self.table.inherit();
        tracing::debug!(parent = %self.pid, child = %child, inherited = table.open_count(), "fork");
        Process {
            pid: child,
            table,
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
        }
    }

    /// Tear the process down, closing every descriptor. Returns how many
    /// were open.
    pub fn exit(self) -> usize {
        let closed = self.table.close_all();
        tracing::debug!(pid = %self.pid, closed, "exit");
        closed
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
