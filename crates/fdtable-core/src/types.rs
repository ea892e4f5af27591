// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions shared by the table, the open-file objects and the
//! storage seam

use serde::{Deserialize, Serialize};

use crate::error::{FdError, FdResult};

/// Descriptor number as seen by the syscall ABI
pub type RawFd = i32;

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque storage-layer object handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageHandle(pub u64);

impl StorageHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sh#{}", self.0)
    }
}

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_ACCMODE: u32 = 3;
pub const O_CREAT: u32 = 4;
pub const O_EXCL: u32 = 8;
pub const O_TRUNC: u32 = 16;
pub const O_APPEND: u32 = 32;
pub const O_NOCTTY: u32 = 64;

bitflags::bitflags! {
    /// Flag bits accepted by `open`.
    ///
    /// Read-only access is the absence of both access bits, so it has no
    /// named flag of its own.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = O_WRONLY;
        const RDWR = O_RDWR;
        const CREAT = O_CREAT;
        const EXCL = O_EXCL;
        const TRUNC = O_TRUNC;
        const APPEND = O_APPEND;
        const NOCTTY = O_NOCTTY;
    }
}

impl OpenFlags {
    /// Validate raw ABI flags: any bit outside the supported set, or both
    /// access bits at once, is an invalid argument.
    pub fn parse(raw: u32) -> FdResult<Self> {
        let flags = Self::from_bits(raw).ok_or(FdError::InvalidArgument)?;
        AccessMode::from_flags(flags)?;
        Ok(flags)
    }

    pub fn access_mode(&self) -> FdResult<AccessMode> {
        AccessMode::from_flags(*self)
    }

    pub fn create(&self) -> bool {
        self.contains(Self::CREAT)
    }

    pub fn exclusive(&self) -> bool {
        self.contains(Self::EXCL)
    }

    pub fn truncate(&self) -> bool {
        self.contains(Self::TRUNC)
    }

    pub fn append(&self) -> bool {
        self.contains(Self::APPEND)
    }
}

/// Access mode an open file was created with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn from_flags(flags: OpenFlags) -> FdResult<Self> {
        match flags.bits() & O_ACCMODE {
            O_RDONLY => Ok(AccessMode::ReadOnly),
            O_WRONLY => Ok(AccessMode::WriteOnly),
            O_RDWR => Ok(AccessMode::ReadWrite),
            _ => Err(FdError::InvalidArgument),
        }
    }

    pub fn can_read(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "rdonly"),
            AccessMode::WriteOnly => write!(f, "wronly"),
            AccessMode::ReadWrite => write!(f, "rdwr"),
        }
    }
}
