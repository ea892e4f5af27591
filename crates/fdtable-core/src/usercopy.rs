// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! User-memory copy seam used by `sys_open` to fetch path arguments

use crate::error::{FdError, FdResult};

/// Address in a process's user address space
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserPtr(pub u64);

impl UserPtr {
    pub fn addr(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Copy primitives between user and kernel memory
#[cfg_attr(test, mockall::automock)]
pub trait UserMemory: Send + Sync {
    /// Copy a NUL-terminated string of at most `max_len` bytes (terminator
    /// included) out of user memory.
    ///
    /// Unmapped or null addresses fail with `Fault`; a string with no
    /// terminator inside `max_len` fails with `NameTooLong`.
    fn copy_in_string(&self, src: UserPtr, max_len: usize) -> FdResult<String>;
}

#[derive(Clone, Debug)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.bytes.len() as u64
    }
}

/// A process address space made of explicitly mapped byte regions
#[derive(Clone, Debug, Default)]
pub struct UserSpace {
    regions: Vec<Region>,
    next_base: u64,
}

impl UserSpace {
    const FIRST_BASE: u64 = 0x1000;
    const PAGE: u64 = 0x1000;

    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at the next free page-aligned address
    pub fn map(&mut self, bytes: &[u8]) -> UserPtr {
        let base = self.next_base.max(Self::FIRST_BASE);
        let pages = (bytes.len() as u64).div_ceil(Self::PAGE).max(1);
        self.next_base = base + pages * Self::PAGE + Self::PAGE;
        self.regions.push(Region {
            base,
            bytes: bytes.to_vec(),
        });
        UserPtr(base)
    }

    /// Map `s` followed by a NUL terminator
    pub fn map_str(&mut self, s: &str) -> UserPtr {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.map(&bytes)
    }
}

impl UserMemory for UserSpace {
    fn copy_in_string(&self, src: UserPtr, max_len: usize) -> FdResult<String> {
        if src.is_null() {
            return Err(FdError::Fault);
        }
        let region = self
            .regions
            .iter()
            .find(|region| region.contains(src.addr()))
            .ok_or(FdError::Fault)?;

        let start = (src.addr() - region.base) as usize;
        let available = &region.bytes[start..];
        let window = &available[..available.len().min(max_len)];
        match window.iter().position(|&b| b == 0) {
            Some(nul) => String::from_utf8(window[..nul].to_vec()).map_err(|_| FdError::InvalidArgument),
            // Ran off the end of the mapping before the limit
            None if window.len() < max_len => Err(FdError::Fault),
            None => Err(FdError::NameTooLong),
        }
    }
}
