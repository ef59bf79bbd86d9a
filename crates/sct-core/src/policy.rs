// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Policy hooks consulted by the interception wrappers.
//!
//! The policy only ever sees mutable references to the wrapper's own copies
//! of the arguments. Whatever it leaves behind is what the original
//! implementation receives.

use libc::{c_char, c_int, c_uint, c_void};

use crate::host::FilenameHandle;

/// Which metadata call a [`InterceptPolicy::decide_check`] invocation is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// `faccessat`; `flags` carries the access mode
    Access,
    /// `newfstatat` / `fstatat64`; `flags` carries the `AT_*` flags
    Stat,
}

/// External privilege-management policy
pub trait InterceptPolicy: Send + Sync {
    /// Observe an execution request and optionally substitute the filename.
    ///
    /// To substitute, replace `*filename` with a handle owned by the policy
    /// layer; it must stay valid until the wrapper returns. `flags` is `None`
    /// for the flag-less `execve` variants.
    fn decide_exec(
        &self,
        dfd: &mut c_int,
        filename: &mut FilenameHandle,
        argv: *const c_void,
        envp: *const c_void,
        flags: Option<&mut c_int>,
    );

    /// Observe or rewrite an access/status check in place.
    fn decide_check(
        &self,
        kind: CheckKind,
        dfd: &mut c_int,
        filename: &mut *const c_char,
        flags: &mut c_int,
    );

    /// Observe a reboot request; the policy may replace `arg`.
    fn decide_reboot(&self, magic1: c_int, magic2: c_int, cmd: c_uint, arg: &mut *mut c_void);
}

/// A policy that leaves every argument untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl InterceptPolicy for PassThrough {
    fn decide_exec(
        &self,
        _dfd: &mut c_int,
        _filename: &mut FilenameHandle,
        _argv: *const c_void,
        _envp: *const c_void,
        _flags: Option<&mut c_int>,
    ) {
    }

    fn decide_check(
        &self,
        _kind: CheckKind,
        _dfd: &mut c_int,
        _filename: &mut *const c_char,
        _flags: &mut c_int,
    ) {
    }

    fn decide_reboot(&self, _magic1: c_int, _magic2: c_int, _cmd: c_uint, _arg: &mut *mut c_void) {}
}
