// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage decorators for exercising error paths in tests

pub mod faulty_storage;

pub use faulty_storage::{eio_error, enospc_error, FailureBehavior, FaultyStorage, StorageOp};
