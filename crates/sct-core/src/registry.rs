// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Write-once storage for the original table entries.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Every intercepted operation, primary and compatibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookedSyscall {
    Reboot,
    Execve,
    Execveat,
    Faccessat,
    Newfstatat,
    CompatReboot,
    CompatExecve,
    CompatExecveat,
    CompatFaccessat,
    CompatFstatat64,
}

impl HookedSyscall {
    pub const COUNT: usize = 10;

    pub const PRIMARY: [HookedSyscall; 5] = [
        HookedSyscall::Reboot,
        HookedSyscall::Execve,
        HookedSyscall::Execveat,
        HookedSyscall::Faccessat,
        HookedSyscall::Newfstatat,
    ];

    pub const COMPAT: [HookedSyscall; 5] = [
        HookedSyscall::CompatReboot,
        HookedSyscall::CompatExecve,
        HookedSyscall::CompatExecveat,
        HookedSyscall::CompatFaccessat,
        HookedSyscall::CompatFstatat64,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            HookedSyscall::Reboot => "reboot",
            HookedSyscall::Execve => "execve",
            HookedSyscall::Execveat => "execveat",
            HookedSyscall::Faccessat => "faccessat",
            HookedSyscall::Newfstatat => "newfstatat",
            HookedSyscall::CompatReboot => "compat_reboot",
            HookedSyscall::CompatExecve => "compat_execve",
            HookedSyscall::CompatExecveat => "compat_execveat",
            HookedSyscall::CompatFaccessat => "compat_faccessat",
            HookedSyscall::CompatFstatat64 => "compat_fstatat64",
        }
    }

    pub const fn is_compat(self) -> bool {
        matches!(
            self,
            HookedSyscall::CompatReboot
                | HookedSyscall::CompatExecve
                | HookedSyscall::CompatExecveat
                | HookedSyscall::CompatFaccessat
                | HookedSyscall::CompatFstatat64
        )
    }
}

impl std::fmt::Display for HookedSyscall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One captured original entry; 0 means empty
#[derive(Debug)]
pub struct OriginalCell {
    value: AtomicUsize,
}

impl OriginalCell {
    pub const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
        }
    }

    /// Store `original` if the cell is still empty.
    ///
    /// Returns `true` only for the call that populated the cell.
    pub fn capture(&self, original: usize) -> bool {
        original != 0
            && self
                .value
                .compare_exchange(0, original, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn get(&self) -> Option<usize> {
        match self.value.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }
}

impl Default for OriginalCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Original entries keyed by [`HookedSyscall`]
#[derive(Debug)]
pub struct Registry {
    cells: [OriginalCell; HookedSyscall::COUNT],
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            cells: [
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
                OriginalCell::new(),
            ],
        }
    }

    pub fn cell(&self, syscall: HookedSyscall) -> &OriginalCell {
        &self.cells[syscall.index()]
    }

    pub fn original(&self, syscall: HookedSyscall) -> Option<usize> {
        self.cell(syscall).get()
    }

    /// Populated cells, for diagnostics.
    pub fn snapshot(&self) -> Vec<(HookedSyscall, usize)> {
        HookedSyscall::PRIMARY
            .iter()
            .chain(HookedSyscall::COMPAT.iter())
            .filter_map(|&s| self.original(s).map(|addr| (s, addr)))
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Originals backing the `extern "C"` slot entry points
pub static ORIGINALS: Registry = Registry::new();
