// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-process file descriptor tables over shared, reference-counted open files
//!
//! The crate is layered bottom-up:
//!
//! - [`storage`]: the object store behind every open file ([`StorageLayer`])
//! - [`open_file`]: [`OpenFile`], the shared open-file object with its offset lock
//! - [`fd_table`]: [`FileDescriptorTable`], lowest-free descriptor allocation
//! - [`syscall`]: [`Process`], the `open`/`read`/`write`/`close`/`dup2` entry points

pub mod config;
pub mod error;
pub mod fd_table;
pub mod open_file;
pub mod storage;
mod sync;
pub mod syscall;
pub mod testing;
pub mod types;
pub mod usercopy;

pub use config::{FdLimits, FdTableConfig};
pub use error::{FdError, FdResult};
pub use fd_table::FileDescriptorTable;
pub use open_file::{OpenFile, OpenFileRef};
pub use storage::{InMemoryStorage, StorageLayer};
pub use syscall::{Process, SEEK_CUR, SEEK_END, SEEK_SET};
pub use types::*;
pub use usercopy::{UserMemory, UserPtr, UserSpace};
