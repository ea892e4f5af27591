// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the descriptor-table core

use std::io;

/// Core descriptor-table error type
#[derive(thiserror::Error, Debug)]
pub enum FdError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("is a directory")]
    IsADirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("name too long")]
    NameTooLong,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("file not opened for this kind of access")]
    WrongAccessMode,
    #[error("no space left")]
    NoSpace,
    #[error("bad user address")]
    Fault,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FdError {
    /// Errno value the syscall ABI reports for this error.
    ///
    /// An access-mode mismatch is reported as `EBADF`, matching what POSIX
    /// requires of `read(2)` on a write-only descriptor.
    pub fn errno(&self) -> i32 {
        match self {
            FdError::InvalidArgument => libc::EINVAL,
            FdError::NotFound => libc::ENOENT,
            FdError::AlreadyExists => libc::EEXIST,
            FdError::AccessDenied => libc::EACCES,
            FdError::IsADirectory => libc::EISDIR,
            FdError::NotADirectory => libc::ENOTDIR,
            FdError::NameTooLong => libc::ENAMETOOLONG,
            FdError::BadFileDescriptor | FdError::WrongAccessMode => libc::EBADF,
            FdError::TooManyOpenFiles => libc::EMFILE,
            FdError::NoSpace => libc::ENOSPC,
            FdError::Fault => libc::EFAULT,
            FdError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type FdResult<T> = Result<T, FdError>;
