// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-wide collaborators of the slot entry points.
//!
//! A patched slot calls a plain `extern "C"` function, so the host and the
//! policy it needs are registered once, before [`crate::init`] runs.

use std::sync::OnceLock;

use tracing::info;

use crate::config::HookConfig;
use crate::error::{HookError, Result};
use crate::host::Host;
use crate::policy::InterceptPolicy;

pub struct Runtime {
    pub host: &'static dyn Host,
    pub policy: &'static dyn InterceptPolicy,
    pub config: HookConfig,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Register the host, the policy and the configuration used by [`crate::init`]
/// and by every wrapper. Registration happens at most once per process.
pub fn register(
    host: &'static dyn Host,
    policy: &'static dyn InterceptPolicy,
    config: HookConfig,
) -> Result<()> {
    config.validate()?;
    RUNTIME
        .set(Runtime {
            host,
            policy,
            config,
        })
        .map_err(|_| HookError::AlreadyRegistered)?;
    info!("hook runtime registered");
    Ok(())
}

pub fn get() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Like [`get`], for callers that report a missing registration.
pub fn require() -> Result<&'static Runtime> {
    get().ok_or(HookError::NotRegistered)
}
