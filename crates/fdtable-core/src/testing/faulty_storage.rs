// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault-injecting storage layer
//!
//! [`FaultyStorage`] wraps another [`StorageLayer`] and fails selected calls
//! according to a [`FailureBehavior`]. Every call is counted per operation,
//! including `release`, which cannot fail and is always forwarded so handle
//! accounting in the inner layer stays exact.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{FdError, FdResult};
use crate::storage::StorageLayer;
use crate::sync::lock;
use crate::{OpenFlags, StorageHandle};

/// Storage operations a fault can target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Open,
    Read,
    Write,
    Size,
    Release,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageOp::Open => "open",
            StorageOp::Read => "read",
            StorageOp::Write => "write",
            StorageOp::Size => "size",
            StorageOp::Release => "release",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageOp {
    type Err = FdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(StorageOp::Open),
            "read" => Ok(StorageOp::Read),
            "write" => Ok(StorageOp::Write),
            "size" => Ok(StorageOp::Size),
            "release" => Ok(StorageOp::Release),
            _ => Err(FdError::InvalidArgument),
        }
    }
}

pub type ErrorFn = Arc<dyn Fn() -> FdError + Send + Sync>;

/// Receives the operation and its zero-based call index; `Some` fails the call
pub type FaultPredicate = Arc<dyn Fn(StorageOp, u64) -> Option<FdError> + Send + Sync>;

#[derive(Clone, Default)]
pub enum FailureBehavior {
    #[default]
    AlwaysSucceed,
    /// The first `count` calls to `op` succeed, every later one fails
    FailAfter {
        op: StorageOp,
        count: u64,
        error_fn: ErrorFn,
    },
    /// The first `count` calls to `op` fail
    FailFor {
        op: StorageOp,
        count: u64,
        error_fn: ErrorFn,
    },
    AlwaysFail {
        op: StorageOp,
        error_fn: ErrorFn,
    },
    Custom(FaultPredicate),
}

impl FailureBehavior {
    fn verdict(&self, op: StorageOp, call: u64) -> Option<FdError> {
        match self {
            FailureBehavior::AlwaysSucceed => None,
            FailureBehavior::FailAfter {
                op: target,
                count,
                error_fn,
            } => (op == *target && call >= *count).then(|| error_fn()),
            FailureBehavior::FailFor {
                op: target,
                count,
                error_fn,
            } => (op == *target && call < *count).then(|| error_fn()),
            FailureBehavior::AlwaysFail { op: target, error_fn } => {
                (op == *target).then(|| error_fn())
            }
            FailureBehavior::Custom(predicate) => predicate(op, call),
        }
    }
}

impl fmt::Debug for FailureBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureBehavior::AlwaysSucceed => f.write_str("AlwaysSucceed"),
            FailureBehavior::FailAfter { op, count, .. } => {
                write!(f, "FailAfter({op}, {count})")
            }
            FailureBehavior::FailFor { op, count, .. } => write!(f, "FailFor({op}, {count})"),
            FailureBehavior::AlwaysFail { op, .. } => write!(f, "AlwaysFail({op})"),
            FailureBehavior::Custom(_) => f.write_str("Custom"),
        }
    }
}

pub struct FaultyStorage {
    inner: Arc<dyn StorageLayer>,
    behavior: Mutex<FailureBehavior>,
    calls: Mutex<HashMap<StorageOp, u64>>,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn StorageLayer>) -> Self {
        Self::with_behavior(inner, FailureBehavior::AlwaysSucceed)
    }

    pub fn with_behavior(inner: Arc<dyn StorageLayer>, behavior: FailureBehavior) -> Self {
        Self {
            inner,
            behavior: Mutex::new(behavior),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_behavior(&self, behavior: FailureBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn call_count(&self, op: StorageOp) -> u64 {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        lock(&self.calls).clear();
    }

    fn check_fault(&self, op: StorageOp) -> FdResult<()> {
        let call = {
            let mut calls = lock(&self.calls);
            let counter = calls.entry(op).or_insert(0);
            let call = *counter;
            *counter += 1;
            call
        };
        match lock(&self.behavior).verdict(op, call) {
            Some(err) => {
                tracing::debug!(%op, call, error = %err, "injecting storage fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl StorageLayer for FaultyStorage {
    fn resolve_and_open(&self, path: &str, flags: OpenFlags, mode: u32) -> FdResult<StorageHandle> {
        self.check_fault(StorageOp::Open)?;
        self.inner.resolve_and_open(path, flags, mode)
    }

    fn read(&self, handle: StorageHandle, offset: u64, buf: &mut [u8]) -> FdResult<usize> {
        self.check_fault(StorageOp::Read)?;
        self.inner.read(handle, offset, buf)
    }

    fn write(&self, handle: StorageHandle, offset: u64, data: &[u8]) -> FdResult<usize> {
        self.check_fault(StorageOp::Write)?;
        self.inner.write(handle, offset, data)
    }

    fn size(&self, handle: StorageHandle) -> FdResult<u64> {
        self.check_fault(StorageOp::Size)?;
        self.inner.size(handle)
    }

    fn release(&self, handle: StorageHandle) {
        if let Err(err) = self.check_fault(StorageOp::Release) {
            tracing::debug!(%handle, error = %err, "release cannot fail; forwarding anyway");
        }
        self.inner.release(handle);
    }
}

impl fmt::Debug for FaultyStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyStorage")
            .field("behavior", &*lock(&self.behavior))
            .finish_non_exhaustive()
    }
}

pub fn eio_error() -> FdError {
    FdError::Io(io::Error::from_raw_os_error(libc::EIO))
}

pub fn enospc_error() -> FdError {
    FdError::NoSpace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{O_CREAT, O_RDWR};

    fn rdwr_create() -> OpenFlags {
        OpenFlags::parse(O_RDWR | O_CREAT).unwrap()
    }

    #[test]
    fn passes_through_and_counts() {
        let base = Arc::new(InMemoryStorage::new());
        let faulty = FaultyStorage::new(base.clone());

        let h = faulty.resolve_and_open("/a", rdwr_create(), 0o644).unwrap();
        faulty.write(h, 0, b"data").unwrap();
        assert_eq!(faulty.size(h).unwrap(), 4);
        faulty.release(h);

        assert_eq!(faulty.call_count(StorageOp::Open), 1);
        assert_eq!(faulty.call_count(StorageOp::Write), 1);
        assert_eq!(faulty.call_count(StorageOp::Release), 1);
        assert_eq!(faulty.call_count(StorageOp::Read), 0);
        assert_eq!(base.open_handle_count(), 0);
    }

    #[test]
    fn fail_after_lets_first_calls_through() {
        let base = Arc::new(InMemoryStorage::new());
        let faulty = FaultyStorage::with_behavior(
            base,
            FailureBehavior::FailAfter {
                op: StorageOp::Write,
                count: 2,
                error_fn: Arc::new(enospc_error),
            },
        );
        let h = faulty.resolve_and_open("/a", rdwr_create(), 0o644).unwrap();
        assert!(faulty.write(h, 0, b"a").is_ok());
        assert!(faulty.write(h, 1, b"b").is_ok());
        assert!(matches!(faulty.write(h, 2, b"c"), Err(FdError::NoSpace)));
        assert!(matches!(faulty.write(h, 2, b"c"), Err(FdError::NoSpace)));
        assert_eq!(faulty.call_count(StorageOp::Write), 4);
    }

    #[test]
    fn fail_for_recovers() {
        let base = Arc::new(InMemoryStorage::new());
        let faulty = FaultyStorage::with_behavior(
            base.clone(),
            FailureBehavior::FailFor {
                op: StorageOp::Open,
                count: 1,
                error_fn: Arc::new(eio_error),
            },
        );
        assert!(matches!(
            faulty.resolve_and_open("/a", rdwr_create(), 0o644),
            Err(FdError::Io(_))
        ));
        assert!(faulty.resolve_and_open("/a", rdwr_create(), 0o644).is_ok());
        assert_eq!(base.open_handle_count(), 1);
    }

    #[test]
    fn release_is_forwarded_even_when_targeted() {
        let base = Arc::new(InMemoryStorage::new());
        let faulty = FaultyStorage::with_behavior(
            base.clone(),
            FailureBehavior::AlwaysFail {
                op: StorageOp::Release,
                error_fn: Arc::new(eio_error),
            },
        );
        let h = faulty.resolve_and_open("/a", rdwr_create(), 0o644).unwrap();
        faulty.release(h);
        assert_eq!(base.open_handle_count(), 0);
        assert_eq!(base.release_count(), 1);
    }

    #[test]
    fn custom_predicate_and_runtime_changes() {
        let base = Arc::new(InMemoryStorage::new());
        base.insert_file("/f", b"0123456789", 0o644).unwrap();
        let faulty = FaultyStorage::new(base);
        let h = faulty
            .resolve_and_open("/f", OpenFlags::parse(O_RDWR).unwrap(), 0)
            .unwrap();
        let mut buf = [0u8; 2];

        faulty.set_behavior(FailureBehavior::Custom(Arc::new(|op, call| {
            (op == StorageOp::Read && call % 2 == 1).then(eio_error)
        })));
        assert!(faulty.read(h, 0, &mut buf).is_ok());
        assert!(faulty.read(h, 0, &mut buf).is_err());
        assert!(faulty.read(h, 0, &mut buf).is_ok());

        faulty.reset_counters();
        assert_eq!(faulty.call_count(StorageOp::Read), 0);
        faulty.set_behavior(FailureBehavior::AlwaysSucceed);
        assert!(faulty.read(h, 0, &mut buf).is_ok());
    }

    #[test]
    fn op_names_round_trip() {
        for op in [
            StorageOp::Open,
            StorageOp::Read,
            StorageOp::Write,
            StorageOp::Size,
            StorageOp::Release,
        ] {
            assert_eq!(op.to_string().parse::<StorageOp>().unwrap(), op);
        }
        assert!("seek".parse::<StorageOp>().is_err());
    }
}
