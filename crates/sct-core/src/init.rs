// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Initialization sequence: locate the tables and patch every configured slot.
//!
//! ```text
//! Unstarted ──▶ PrimaryLocated ──▶ PrimaryPatched ──▶ CompatLocated ──▶ CompatPatched ──▶ Done
//!     │                                  │                                                 ▲
//!     ▼                                  └───────────── (no compat table) ─────────────────┘
//! FailedPrimary
//! ```
//!
//! Only a missing primary table stops the sequence. Each slot is patched
//! independently, and a slot that cannot be patched simply stays
//! un-intercepted.

use tracing::{debug, error, info, warn};

use crate::config::{HookConfig, SyscallNumbers};
use crate::error::Result;
use crate::host::Host;
use crate::patcher::{replace_entry, PatchOutcome};
use crate::registry::{HookedSyscall, Registry, ORIGINALS};
use crate::runtime;
use crate::table::{self, DispatchTable, TableKind};
use crate::wrappers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Unstarted,
    PrimaryLocated,
    PrimaryPatched,
    CompatLocated,
    CompatPatched,
    Done,
    FailedPrimary,
}

impl InitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InitState::Done | InitState::FailedPrimary)
    }
}

/// Result of patching one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub syscall: HookedSyscall,
    pub nr: usize,
    pub result: Result<PatchOutcome>,
}

/// Everything the sequence did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub state: InitState,
    /// States entered after `Unstarted`
    pub transitions: Vec<InitState>,
    pub slots: Vec<SlotReport>,
}

impl InitReport {
    pub fn is_hooked(&self, syscall: HookedSyscall) -> bool {
        self.slots.iter().any(|s| s.syscall == syscall && s.result.is_ok())
    }

    pub fn hooked(&self) -> impl Iterator<Item = HookedSyscall> + '_ {
        self.slots.iter().filter(|s| s.result.is_ok()).map(|s| s.syscall)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SlotReport> {
        self.slots.iter().filter(|s| s.result.is_err())
    }

    pub fn compat_patched(&self) -> bool {
        self.transitions.contains(&InitState::CompatPatched)
    }
}

fn slot_number(numbers: &SyscallNumbers, syscall: HookedSyscall) -> usize {
    match syscall {
        HookedSyscall::Reboot | HookedSyscall::CompatReboot => numbers.reboot,
        HookedSyscall::Execve | HookedSyscall::CompatExecve => numbers.execve,
        HookedSyscall::Execveat | HookedSyscall::CompatExecveat => numbers.execveat,
        HookedSyscall::Faccessat | HookedSyscall::CompatFaccessat => numbers.faccessat,
        HookedSyscall::Newfstatat | HookedSyscall::CompatFstatat64 => numbers.fstatat,
    }
}

struct Sequence<'a, H: Host + ?Sized> {
    host: &'a H,
    config: &'a HookConfig,
    registry: &'a Registry,
    wrapper_for: &'a dyn Fn(HookedSyscall) -> usize,
    state: InitState,
    primary: Option<DispatchTable>,
    compat: Option<DispatchTable>,
    report: InitReport,
}

impl<'a, H: Host + ?Sized> Sequence<'a, H> {
    fn advance(&mut self, next: InitState) {
        debug!(from = ?self.state, to = ?next, "hook init transition");
        self.state = next;
        self.report.transitions.push(next);
    }

    fn patch_all(&mut self, table: DispatchTable, syscalls: &[HookedSyscall], numbers: &SyscallNumbers) {
        for &syscall in syscalls {
            let nr = slot_number(numbers, syscall);
            let wrapper = (self.wrapper_for)(syscall);
            // SAFETY: slot numbers come from the validated layout of this table
            // and every wrapper shares the ABI of the call it replaces.
            let result = unsafe {
                replace_entry(self.host, table, syscall, nr, wrapper, self.registry.cell(syscall))
            };
            if let Err(e) = &result {
                error!(syscall = syscall.name(), nr, table = %table.kind(), "{e}");
            }
            self.report.slots.push(SlotReport { syscall, nr, result });
        }
    }

    fn step(&mut self) {
        match self.state {
            InitState::Unstarted => {
                match table::locate(self.host, &self.config.table_symbol, TableKind::Primary) {
                    Ok(found) => {
                        self.primary = Some(found);
                        self.advance(InitState::PrimaryLocated);
                    }
                    Err(e) => {
                        error!(symbol = %self.config.table_symbol, "{e}; syscall hooks not installed");
                        self.advance(InitState::FailedPrimary);
                    }
                }
            }
            InitState::PrimaryLocated => {
                if let Some(primary) = self.primary {
                    let numbers = self.config.primary;
                    self.patch_all(primary, &HookedSyscall::PRIMARY, &numbers);
                }
                self.advance(InitState::PrimaryPatched);
            }
            InitState::PrimaryPatched => match self.config.compat_table_symbol.as_deref() {
                None => {
                    debug!("compatibility table disabled");
                    self.advance(InitState::Done);
                }
                Some(symbol) => match table::locate(self.host, symbol, TableKind::Compat) {
                    Ok(found) => {
                        self.compat = Some(found);
                        self.advance(InitState::CompatLocated);
                    }
                    Err(e) => {
                        warn!(symbol, "{e}; compatibility syscalls stay unhooked");
                        self.advance(InitState::Done);
                    }
                },
            },
            InitState::CompatLocated => {
                if let Some(compat) = self.compat {
                    let numbers = self.config.compat;
                    self.patch_all(compat, &HookedSyscall::COMPAT, &numbers);
                }
                self.advance(InitState::CompatPatched);
            }
            InitState::CompatPatched => self.advance(InitState::Done),
            InitState::Done | InitState::FailedPrimary => {}
        }
    }
}

/// Run the sequence with explicit slot entry points.
///
/// Originals are captured into `registry`. Entry points installed here must
/// read their originals from that same registry, otherwise a patched slot
/// no longer reaches the call it replaced.
pub fn install_with<H: Host + ?Sized>(
    host: &H,
    config: &HookConfig,
    registry: &Registry,
    wrapper_for: &dyn Fn(HookedSyscall) -> usize,
) -> InitReport {
    let mut sequence = Sequence {
        host,
        config,
        registry,
        wrapper_for,
        state: InitState::Unstarted,
        primary: None,
        compat: None,
        report: InitReport {
            state: InitState::Unstarted,
            transitions: Vec::new(),
            slots: Vec::new(),
        },
    };

    while !sequence.state.is_terminal() {
        sequence.step();
    }

    let mut report = sequence.report;
    report.state = sequence.state;
    if report.state == InitState::Done {
        info!(
            hooked = report.hooked().count(),
            failed = report.failures().count(),
            "syscall table hooks initialized"
        );
    }
    report
}

/// Run the sequence, installing this crate's slot entry points.
///
/// Those entry points delegate through the registered runtime and
/// [`ORIGINALS`], so nothing is patched before [`runtime::register`].
pub fn install<H: Host + ?Sized>(host: &H, config: &HookConfig) -> Result<InitReport> {
    runtime::require()?;
    Ok(install_with(host, config, &ORIGINALS, &wrappers::entry_point))
}

/// Host entry point: patch the tables using the registered runtime.
///
/// Outcome is observable only through the logs.
pub fn init() {
    if let Err(e) = runtime::require().and_then(|rt| install(rt.host, &rt.config)) {
        error!("{e}; syscall hooks not installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::test_support::{FakeHost, FakeTable};

    fn numbers(base: usize) -> SyscallNumbers {
        SyscallNumbers {
            reboot: base,
            execve: base + 1,
            execveat: base + 2,
            faccessat: base + 3,
            fstatat: base + 4,
        }
    }

    fn config() -> HookConfig {
        HookConfig {
            table_symbol: "sys_call_table".into(),
            compat_table_symbol: Some("compat_sys_call_table".into()),
            primary: numbers(1),
            compat: numbers(0),
        }
    }

    fn fake_wrapper(syscall: HookedSyscall) -> usize {
        0x2000 + syscall.index() * 0x10
    }

    fn tables() -> (FakeTable, FakeTable) {
        let primary: Vec<usize> = (0..8).map(|i| 0x1000 + i * 0x10).collect();
        let compat: Vec<usize> = (0..8).map(|i| 0x5000 + i * 0x10).collect();
        (FakeTable::new(&primary), FakeTable::new(&compat))
    }

    #[test]
    fn full_sequence_patches_both_tables() {
        let (primary, compat) = tables();
        let host = FakeHost::new()
            .with_symbol("sys_call_table", primary.base().as_ptr() as usize)
            .with_symbol("compat_sys_call_table", compat.base().as_ptr() as usize);
        let registry = Registry::new();

        let report = install_with(&host, &config(), &registry, &fake_wrapper);

        assert_eq!(report.state, InitState::Done);
        assert_eq!(
            report.transitions,
            vec![
                InitState::PrimaryLocated,
                InitState::PrimaryPatched,
                InitState::CompatLocated,
                InitState::CompatPatched,
                InitState::Done,
            ]
        );
        assert_eq!(report.hooked().count(), 10);
        assert!(report.compat_patched());

        // execve sits at slot 2 of the primary table.
        assert_eq!(primary.get(2), fake_wrapper(HookedSyscall::Execve));
        assert_eq!(registry.original(HookedSyscall::Execve), Some(0x1020));
        assert_eq!(compat.get(0), fake_wrapper(HookedSyscall::CompatReboot));
        assert_eq!(registry.original(HookedSyscall::CompatReboot), Some(0x5000));
        // Untouched slots keep their values.
        assert_eq!(primary.get(0), 0x1000);
        assert_eq!(primary.get(6), 0x1060);
    }

    #[test]
    fn missing_primary_table_aborts() {
        let (_, compat) = tables();
        let host = FakeHost::new().with_symbol("compat_sys_call_table", compat.base().as_ptr() as usize);
        let registry = Registry::new();

        let report = install_with(&host, &config(), &registry, &fake_wrapper);

        assert_eq!(report.state, InitState::FailedPrimary);
        assert_eq!(report.transitions, vec![InitState::FailedPrimary]);
        assert!(report.slots.is_empty());
        assert_eq!(compat.get(0), 0x5000);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn missing_compat_table_keeps_primary_hooks() {
        let (primary, _) = tables();
        let host = FakeHost::new().with_symbol("sys_call_table", primary.base().as_ptr() as usize);
        let registry = Registry::new();

        let report = install_with(&host, &config(), &registry, &fake_wrapper);

        assert_eq!(report.state, InitState::Done);
        assert_eq!(
            report.transitions,
            vec![InitState::PrimaryLocated, InitState::PrimaryPatched, InitState::Done]
        );
        assert!(HookedSyscall::PRIMARY.iter().all(|&s| report.is_hooked(s)));
        assert!(!HookedSyscall::COMPAT.iter().any(|&s| report.is_hooked(s)));
        assert!(!report.compat_patched());
    }

    #[test]
    fn disabled_compat_skips_lookup() {
        let (primary, compat) = tables();
        let host = FakeHost::new()
            .with_symbol("sys_call_table", primary.base().as_ptr() as usize)
            .with_symbol("compat_sys_call_table", compat.base().as_ptr() as usize);
        let registry = Registry::new();

        let report = install_with(&host, &config().without_compat(), &registry, &fake_wrapper);

        assert_eq!(report.state, InitState::Done);
        assert_eq!(compat.get(0), 0x5000);
        assert_eq!(report.slots.len(), 5);
    }

    #[test]
    fn per_slot_failures_do_not_abort() {
        let (primary, compat) = tables();
        let host = FakeHost::new()
            .with_map_failure()
            .with_symbol("sys_call_table", primary.base().as_ptr() as usize)
            .with_symbol("compat_sys_call_table", compat.base().as_ptr() as usize);
        let registry = Registry::new();

        let report = install_with(&host, &config(), &registry, &fake_wrapper);

        assert_eq!(report.state, InitState::Done);
        assert_eq!(report.slots.len(), 10);
        assert_eq!(report.failures().count(), 10);
        assert!(matches!(report.slots[0].result, Err(HookError::MapFailed { syscall: "reboot", nr: 1 })));
        assert_eq!(primary.get(1), 0x1010);
    }

    #[test]
    fn reinitialization_keeps_first_originals() {
        let (primary, compat) = tables();
        let host = FakeHost::new()
            .with_symbol("sys_call_table", primary.base().as_ptr() as usize)
            .with_symbol("compat_sys_call_table", compat.base().as_ptr() as usize);
        let registry = Registry::new();

        install_with(&host, &config(), &registry, &fake_wrapper);
        let second = install_with(&host, &config(), &registry, &fake_wrapper);

        assert_eq!(second.state, InitState::Done);
        assert!(second.slots.iter().all(|s| matches!(s.result, Ok(PatchOutcome { captured: false, .. }))));
        assert_eq!(registry.original(HookedSyscall::Execve), Some(0x1020));
        assert_eq!(registry.original(HookedSyscall::CompatFstatat64), Some(0x5040));
    }

    #[test]
    fn example_execve_slot() {
        let table = FakeTable::new(&[0, 0x1000]);
        let host = FakeHost::new().with_symbol("sys_call_table", table.base().as_ptr() as usize);
        let registry = Registry::new();
        let config = HookConfig {
            table_symbol: "sys_call_table".into(),
            compat_table_symbol: None,
            primary: SyscallNumbers {
                reboot: 100,
                execve: 1,
                execveat: 101,
                faccessat: 102,
                fstatat: 103,
            },
            compat: numbers(0),
        };
        let only_execve = |s: HookedSyscall| if s == HookedSyscall::Execve { 0x2000 } else { 0 };

        let report = install_with(&host, &config, &registry, &only_execve);

        assert!(report.is_hooked(HookedSyscall::Execve));
        assert_eq!(table.get(1), 0x2000);
        assert_eq!(registry.original(HookedSyscall::Execve), Some(0x1000));
        // The other wrappers are null, so their out-of-range slots are never touched.
        assert_eq!(report.failures().count(), 4);
    }

    #[test]
    fn install_without_runtime_leaves_tables_alone() {
        let (primary, compat) = tables();
        let host = FakeHost::new()
            .with_symbol("sys_call_table", primary.base().as_ptr() as usize)
            .with_symbol("compat_sys_call_table", compat.base().as_ptr() as usize);
        if runtime::get().is_some() {
            return;
        }

        let err = install(&host, &config()).unwrap_err();

        assert_eq!(err, HookError::NotRegistered);
        assert_eq!(primary.get(2), 0x1020);
        assert_eq!(compat.get(0), 0x5000);
        assert!(ORIGINALS.snapshot().is_empty());
    }

    #[test]
    fn init_without_runtime_is_a_logged_no_op() {
        if runtime::get().is_none() {
            init();
        }
        assert!(ORIGINALS.snapshot().is_empty());
    }
}
