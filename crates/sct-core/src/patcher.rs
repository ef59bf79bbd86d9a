// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Single-slot patching through a temporary writable mapping.
//!
//! The table pages are read-only, so a slot is rewritten by mapping its
//! backing page a second time with write permission, storing the new entry
//! through that alias and tearing the alias down again. The store itself runs
//! with preemption and interrupts suppressed and is a single pointer-sized
//! atomic store, so concurrent dispatchers see either the old or the new
//! entry and never a mix of both.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use crate::error::{HookError, Result};
use crate::host::{ExecutionControl, Host, IrqFlags, PageFrame, PageMapper};
use crate::registry::{HookedSyscall, OriginalCell};
use crate::table::DispatchTable;

/// What a successful patch did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Slot value observed right before the store
    pub previous: usize,
    /// Whether this call populated the original cell
    pub captured: bool,
}

/// Preemption and interrupts suppressed until drop
struct AtomicSection<'h, H: ExecutionControl + ?Sized> {
    host: &'h H,
    flags: IrqFlags,
}

impl<'h, H: ExecutionControl + ?Sized> AtomicSection<'h, H> {
    fn enter(host: &'h H) -> Self {
        host.preempt_disable();
        let flags = host.irq_save();
        Self { host, flags }
    }
}

impl<H: ExecutionControl + ?Sized> Drop for AtomicSection<'_, H> {
    fn drop(&mut self) {
        self.host.irq_restore(self.flags);
        self.host.preempt_enable();
    }
}

/// A one-page writable alias, unmapped on drop
struct WritableMapping<'h, H: PageMapper + ?Sized> {
    host: &'h H,
    base: NonNull<u8>,
}

impl<'h, H: PageMapper + ?Sized> WritableMapping<'h, H> {
    fn map(host: &'h H, page: PageFrame) -> Option<Self> {
        host.map_writable(page).map(|base| Self { host, base })
    }

    fn slot(&self, offset: usize) -> *mut usize {
        // SAFETY: offset is below the page size and the alias spans one page.
        unsafe { self.base.as_ptr().add(offset) as *mut usize }
    }
}

impl<H: PageMapper + ?Sized> Drop for WritableMapping<'_, H> {
    fn drop(&mut self) {
        // SAFETY: base came from map_writable and is not used past this point.
        unsafe { self.host.unmap(self.base) }
    }
}

fn backing_page<H: PageMapper + ?Sized>(host: &H, addr: usize) -> Option<PageFrame> {
    if host.is_dynamic_mapping(addr) {
        host.dynamic_page(addr)
    } else {
        host.static_page(addr)
    }
}

/// Replace slot `nr` of `table` with `new_func`.
///
/// The first call for a given `cell` records the slot's current value there;
/// later calls leave the cell alone, so running initialization twice never
/// records a wrapper as the original. Mapping failures leave the slot
/// untouched.
///
/// # Safety
///
/// `nr` must be a valid index into `table`, and `new_func` must be an entry
/// point with the calling convention the table expects for that slot.
pub unsafe fn replace_entry<H: Host + ?Sized>(
    host: &H,
    table: DispatchTable,
    syscall: HookedSyscall,
    nr: usize,
    new_func: usize,
    cell: &OriginalCell,
) -> Result<PatchOutcome> {
    if new_func == 0 {
        return Err(HookError::NullFunction {
            syscall: syscall.name(),
        });
    }

    let addr = table.slot_addr(nr);
    let previous = table.read(nr);

    let captured = cell.capture(previous);
    if captured {
        info!(
            syscall = syscall.name(),
            nr,
            old = format_args!("{previous:#x}"),
            new = format_args!("{new_func:#x}"),
            "hooking syscall {} ({}): {:#x} -> {:#x}",
            syscall,
            nr,
            previous,
            new_func
        );
    }

    let page = backing_page(host, addr).ok_or(HookError::PageUnavailable {
        syscall: syscall.name(),
        nr,
        addr,
    })?;

    let mapping = WritableMapping::map(host, page).ok_or(HookError::MapFailed {
        syscall: syscall.name(),
        nr,
    })?;
    let target = mapping.slot(addr & (host.page_size() - 1));

    {
        let _section = AtomicSection::enter(host);
        AtomicUsize::from_ptr(target).store(new_func, Ordering::Release);
    }
    drop(mapping);

    debug!(syscall = syscall.name(), nr, table = %table.kind(), "slot patched");
    Ok(PatchOutcome { previous, captured })
}
