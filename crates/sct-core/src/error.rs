// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for table location and entry patching.

use thiserror::Error;

/// Errors that can occur while locating tables or patching their entries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("null replacement function for {syscall}")]
    NullFunction { syscall: &'static str },

    #[error("cannot get page for {syscall} ({nr}) at {addr:#x}")]
    PageUnavailable {
        syscall: &'static str,
        nr: usize,
        addr: usize,
    },

    #[error("temporary writable mapping failed for {syscall} ({nr})")]
    MapFailed { syscall: &'static str, nr: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("hook runtime has not been registered")]
    NotRegistered,

    #[error("hook runtime is already registered")]
    AlreadyRegistered,
}

pub type Result<T> = std::result::Result<T, HookError>;
