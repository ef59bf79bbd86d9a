// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dispatch-table interposition core
//!
//! This crate reroutes a fixed set of entries in a live, host-owned syscall
//! dispatch table (process execution, access checks, file status and reboot,
//! plus their 32-bit compatibility variants) through interception wrappers.
//! It consists of:
//! - a table locator that resolves the primary and the optional compatibility
//!   table through the host's symbol service,
//! - an entry patcher that writes one slot through a temporary writable
//!   mapping with preemption and interrupts suppressed,
//! - a write-once registry of the original entries,
//! - wrappers that consult an external policy and then delegate to the
//!   original implementation,
//! - the initialization sequence tying it together.
//!
//! Everything the host provides (symbols, page mappings, name capture,
//! address-limit switching) is reached through the traits in [`host`], and
//! every interception decision through [`policy::InterceptPolicy`].

pub mod config;
pub mod error;
pub mod host;
pub mod init;
pub mod patcher;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod table;
pub mod wrappers;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{HookConfig, SyscallNumbers};
pub use error::{HookError, Result};
pub use host::{AddrLimit, FilenameHandle, Host, IrqFlags, PageFrame};
pub use init::{init, install, install_with, InitReport, InitState, SlotReport};
pub use patcher::{replace_entry, PatchOutcome};
pub use policy::InterceptPolicy;
pub use registry::{HookedSyscall, OriginalCell, Registry, ORIGINALS};
pub use table::{DispatchTable, TableKind};
