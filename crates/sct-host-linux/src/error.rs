// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("table {0} has no entries")]
    EmptyTable(String),

    #[error("symbol {0} is already registered")]
    DuplicateSymbol(String),
}

impl HostError {
    /// Capture `errno` for a failed libc call.
    pub(crate) fn last_os(op: &'static str) -> Self {
        HostError::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
