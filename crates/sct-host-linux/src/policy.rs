// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! A path-redirecting policy: requests for one path are served by another.
//!
//! This is the classic `su` compatibility trick. Executing or probing
//! `/system/bin/su` is answered by the shell instead.

use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_uint, c_void};
use tracing::{debug, info};

use sct_core::policy::CheckKind;
use sct_core::{FilenameHandle, InterceptPolicy};

pub const DEFAULT_SU_PATH: &str = "/system/bin/su";
pub const DEFAULT_SH_PATH: &str = "/system/bin/sh";

pub struct RedirectPolicy {
    from: CString,
    // Boxed so the handle identity stays stable for the policy's lifetime.
    to: Box<CString>,
    exec_redirects: AtomicUsize,
    check_redirects: AtomicUsize,
    reboots: AtomicUsize,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::new(c"/system/bin/su", c"/system/bin/sh")
    }
}

impl RedirectPolicy {
    pub fn new(from: &CStr, to: &CStr) -> Self {
        Self {
            from: from.to_owned(),
            to: Box::new(to.to_owned()),
            exec_redirects: AtomicUsize::new(0),
            check_redirects: AtomicUsize::new(0),
            reboots: AtomicUsize::new(0),
        }
    }

    pub fn from_paths(from: &str, to: &str) -> Result<Self, std::ffi::NulError> {
        Ok(Self::new(&CString::new(from)?, &CString::new(to)?))
    }

    /// Handle under which the replacement path is substituted.
    pub fn replacement(&self) -> FilenameHandle {
        let raw = NonNull::from(&*self.to).cast::<c_void>();
        let name = NonNull::from(self.to.as_c_str()).cast::<c_char>();
        // SAFETY: both point into `self.to`, which lives as long as `self`.
        unsafe { FilenameHandle::from_raw(raw, name) }
    }

    pub fn exec_redirects(&self) -> usize {
        self.exec_redirects.load(Ordering::Relaxed)
    }

    pub fn check_redirects(&self) -> usize {
        self.check_redirects.load(Ordering::Relaxed)
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::Relaxed)
    }

    fn matches(&self, path: *const c_char) -> bool {
        // SAFETY: callers hand in either a captured name or a caller path
        // that the replaced call would dereference anyway.
        !path.is_null() && unsafe { CStr::from_ptr(path) } == self.from.as_c_str()
    }
}

impl InterceptPolicy for RedirectPolicy {
    fn decide_exec(
        &self,
        _dfd: &mut c_int,
        filename: &mut FilenameHandle,
        _argv: *const c_void,
        _envp: *const c_void,
        _flags: Option<&mut c_int>,
    ) {
        if self.matches(filename.name()) {
            info!(from = ?self.from, to = ?self.to, "redirecting exec");
            *filename = self.replacement();
            self.exec_redirects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decide_check(&self, kind: CheckKind, _dfd: &mut c_int, filename: &mut *const c_char, _flags: &mut c_int) {
        if self.matches(*filename) {
            debug!(?kind, from = ?self.from, "redirecting check");
            *filename = self.to.as_ptr();
            self.check_redirects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decide_reboot(&self, magic1: c_int, magic2: c_int, cmd: c_uint, _arg: &mut *mut c_void) {
        debug!(magic1 = format_args!("{magic1:#x}"), magic2 = format_args!("{magic2:#x}"), cmd, "reboot observed");
        self.reboots.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sct_core::host::NameCapture;
    use crate::ProcessHost;

    #[test]
    fn matching_exec_is_substituted() {
        let host = ProcessHost::new();
        let policy = RedirectPolicy::default();
        let su = CString::new(DEFAULT_SU_PATH).unwrap();

        let captured = unsafe { host.capture(su.as_ptr()) }.unwrap();
        let mut name = captured;
        let mut dfd = libc::AT_FDCWD;
        policy.decide_exec(&mut dfd, &mut name, std::ptr::null(), std::ptr::null(), None);

        assert_ne!(name, captured);
        assert_eq!(name, policy.replacement());
        assert_eq!(unsafe { CStr::from_ptr(name.name()) }.to_str().unwrap(), DEFAULT_SH_PATH);
        assert_eq!(policy.exec_redirects(), 1);
        unsafe { host.release(captured) };
    }

    #[test]
    fn other_paths_are_left_alone() {
        let policy = RedirectPolicy::from_paths("/system/xbin/su", "/bin/sh").unwrap();
        let ls = CString::new("/system/bin/ls").unwrap();

        let mut filename = ls.as_ptr();
        let (mut dfd, mut mode) = (3, libc::X_OK);
        policy.decide_check(CheckKind::Access, &mut dfd, &mut filename, &mut mode);
        assert_eq!(filename, ls.as_ptr());

        let mut null: *const c_char = std::ptr::null();
        policy.decide_check(CheckKind::Stat, &mut dfd, &mut null, &mut mode);
        assert!(null.is_null());
        assert_eq!(policy.check_redirects(), 0);
    }

    #[test]
    fn matching_check_points_at_replacement() {
        let policy = RedirectPolicy::default();
        let su = CString::new(DEFAULT_SU_PATH).unwrap();

        let mut filename = su.as_ptr();
        let (mut dfd, mut flags) = (libc::AT_FDCWD, 0);
        policy.decide_check(CheckKind::Stat, &mut dfd, &mut filename, &mut flags);

        assert_eq!(unsafe { CStr::from_ptr(filename) }.to_str().unwrap(), DEFAULT_SH_PATH);
        assert_eq!(policy.check_redirects(), 1);
    }

    #[test]
    fn interior_nul_paths_are_rejected() {
        assert!(RedirectPolicy::from_paths("/bin/s\0u", "/bin/sh").is_err());
    }
}
