// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! User-space Linux host for `sct-core`.
//!
//! Dispatch tables live in read-only pages of the current process, so the
//! whole patching sequence runs for real: locating tables by symbol,
//! aliasing or unprotecting their pages, the atomic store, and calls
//! through patched slots into the interception wrappers.

pub mod error;
pub mod policy;
pub mod process;
pub mod region;

pub use error::{HostError, Result};
pub use policy::{RedirectPolicy, DEFAULT_SH_PATH, DEFAULT_SU_PATH};
pub use process::{current_limit, irqs_disabled, preempt_depth, HostTable, ProcessHost, KERNEL_LIMIT, USER_LIMIT};
pub use region::RegionKind;
