// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for descriptor tables and the syscall layer

use serde::{Deserialize, Serialize};

use crate::error::{FdError, FdResult};

/// Per-process limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FdLimits {
    /// Number of slots in every descriptor table
    pub max_open_files: usize,
    /// Longest path `sys_open` will copy in from user memory, including the NUL
    pub max_path_len: usize,
}

impl Default for FdLimits {
    fn default() -> Self {
        Self {
            max_open_files: 128,
            max_path_len: 1024,
        }
    }
}

/// Top-level configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FdTableConfig {
    pub limits: FdLimits,
}

impl FdTableConfig {
    /// Parse a TOML document; absent keys fall back to defaults
    pub fn from_toml_str(input: &str) -> FdResult<Self> {
        let config: Self = toml::from_str(input).map_err(|err| {
            tracing::warn!(error = %err, "rejecting malformed descriptor-table config");
            FdError::InvalidArgument
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FdResult<()> {
        if self.limits.max_open_files == 0 || self.limits.max_path_len == 0 {
            return Err(FdError::InvalidArgument);
        }
        // Descriptors must stay representable as a non-negative RawFd
        if self.limits.max_open_files > i32::MAX as usize {
            return Err(FdError::InvalidArgument);
        }
        Ok(())
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.limits.max_open_files = max_open_files;
        self
    }
}
