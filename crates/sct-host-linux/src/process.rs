// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! [`ProcessHost`]: every host primitive of `sct-core`, backed by the
//! current process.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use libc::{c_char, c_long, c_void};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use tracing::{debug, warn};

use sct_core::{
    AddrLimit, DispatchTable, FilenameHandle, IrqFlags, PageFrame, TableKind,
};
use sct_core::host::{AddressLimit, ExecutionControl, NameCapture, PageMapper, SymbolResolver};

use crate::error::{HostError, Result};
use crate::region::{Region, RegionKind};

/// Limit in force for ordinary callers
pub const USER_LIMIT: AddrLimit = AddrLimit(0x0000_7fff_ffff_f000);
/// Limit that also admits host-held pointers
pub const KERNEL_LIMIT: AddrLimit = AddrLimit(usize::MAX);

const PATH_MAX: usize = libc::PATH_MAX as usize;

thread_local! {
    static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
    static SAVED_MASKS: RefCell<Vec<Option<SigSet>>> = const { RefCell::new(Vec::new()) };
    static ADDR_LIMIT: Cell<usize> = const { Cell::new(USER_LIMIT.0) };
}

/// Preemption-disable depth of the calling thread.
pub fn preempt_depth() -> usize {
    PREEMPT_DEPTH.with(Cell::get)
}

/// Whether the calling thread is inside `irq_save`/`irq_restore`.
pub fn irqs_disabled() -> bool {
    SAVED_MASKS.with(|m| !m.borrow().is_empty())
}

/// Address limit of the calling thread.
pub fn current_limit() -> AddrLimit {
    AddrLimit(ADDR_LIMIT.with(Cell::get))
}

/// A table allocated by [`ProcessHost::allocate_table`]
#[derive(Debug, Clone, Copy)]
pub struct HostTable {
    base: NonNull<usize>,
    entries: usize,
    region: RegionKind,
}

// SAFETY: the table memory is owned by the host and lives as long as it.
unsafe impl Send for HostTable {}
unsafe impl Sync for HostTable {}

impl HostTable {
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn region(&self) -> RegionKind {
        self.region
    }

    /// Current value of slot `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<usize> {
        if index >= self.entries {
            return None;
        }
        // SAFETY: in bounds, and the region outlives every HostTable copy
        // handed out by its host.
        Some(unsafe { AtomicUsize::from_ptr(self.base.as_ptr().add(index)).load(Ordering::Acquire) })
    }

    /// The same table as seen by `sct-core`.
    pub fn dispatch(&self, kind: TableKind) -> DispatchTable {
        // SAFETY: aligned, live for as long as the owning host.
        unsafe { DispatchTable::from_raw(self.base, kind) }
    }
}

/// Bookkeeping for one live writable view
struct ActiveView {
    region: usize,
    page: usize,
    refs: usize,
}

/// Host primitives implemented over this process's own memory and threads.
///
/// Dispatch tables are allocated with [`ProcessHost::allocate_table`] and
/// published under a symbol name with [`ProcessHost::register_symbol`].
/// Names that were never registered are looked up with `dlsym`.
pub struct ProcessHost {
    page_size: usize,
    symbols: RwLock<HashMap<String, usize>>,
    regions: RwLock<Vec<Region>>,
    views: Mutex<HashMap<usize, ActiveView>>,
    names_captured: AtomicUsize,
    names_released: AtomicUsize,
}

impl Default for ProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHost {
    pub fn new() -> Self {
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        Self {
            page_size,
            symbols: RwLock::new(HashMap::new()),
            regions: RwLock::new(Vec::new()),
            views: Mutex::new(HashMap::new()),
            names_captured: AtomicUsize::new(0),
            names_released: AtomicUsize::new(0),
        }
    }

    /// Allocate a read-only table in a fresh region of `kind`.
    pub fn allocate_table(&self, name: &str, kind: RegionKind, entries: &[usize]) -> Result<HostTable> {
        if entries.is_empty() {
            return Err(HostError::EmptyTable(name.to_string()));
        }
        let region = Region::allocate(kind, entries, self.page_size)?;
        let base = NonNull::new(region.base() as *mut usize)
            .ok_or_else(|| HostError::EmptyTable(name.to_string()))?;
        debug!(
            table = name,
            region = %kind,
            base = format_args!("{:#x}", region.base()),
            len = region.len(),
            "allocated table"
        );
        self.regions.write().unwrap_or_else(|e| e.into_inner()).push(region);
        Ok(HostTable {
            base,
            entries: entries.len(),
            region: kind,
        })
    }

    /// Publish `addr` under `name` for [`SymbolResolver::resolve`].
    pub fn register_symbol(&self, name: &str, addr: usize) -> Result<()> {
        let mut symbols = self.symbols.write().unwrap_or_else(|e| e.into_inner());
        if symbols.contains_key(name) {
            return Err(HostError::DuplicateSymbol(name.to_string()));
        }
        symbols.insert(name.to_string(), addr);
        Ok(())
    }

    /// Names captured and not yet released.
    pub fn outstanding_names(&self) -> usize {
        let released = self.names_released.load(Ordering::Acquire);
        self.names_captured.load(Ordering::Acquire).saturating_sub(released)
    }

    pub fn names_captured(&self) -> usize {
        self.names_captured.load(Ordering::Acquire)
    }

    /// Writable views currently alive.
    pub fn active_views(&self) -> usize {
        self.views.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn region_kind(&self, addr: usize) -> Option<RegionKind> {
        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        regions.iter().find(|r| r.contains(addr)).map(Region::kind)
    }

    fn page_in(&self, addr: usize, kind: RegionKind) -> Option<PageFrame> {
        (self.region_kind(addr)? == kind).then(|| PageFrame(addr & !(self.page_size - 1)))
    }
}

impl SymbolResolver for ProcessHost {
    fn resolve(&self, name: &str) -> Option<usize> {
        if let Some(&addr) = self.symbols.read().unwrap_or_else(|e| e.into_inner()).get(name) {
            return Some(addr);
        }
        let cname = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    }
}

impl PageMapper for ProcessHost {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_dynamic_mapping(&self, addr: usize) -> bool {
        self.region_kind(addr) == Some(RegionKind::Dynamic)
    }

    fn dynamic_page(&self, addr: usize) -> Option<PageFrame> {
        self.page_in(addr, RegionKind::Dynamic)
    }

    fn static_page(&self, addr: usize) -> Option<PageFrame> {
        self.page_in(addr, RegionKind::Static)
    }

    fn map_writable(&self, page: PageFrame) -> Option<NonNull<u8>> {
        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        let region = regions.iter().find(|r| r.contains(page.0))?;
        let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());

        // A static page is its own view; share it instead of flipping the
        // protection twice.
        if region.kind() == RegionKind::Static {
            if let Some(view) = views.get_mut(&page.0) {
                view.refs += 1;
                return NonNull::new(page.0 as *mut u8);
            }
        }

        match region.map_writable(page.0, self.page_size) {
            Ok(view) => {
                views.insert(
                    view.as_ptr() as usize,
                    ActiveView {
                        region: region.base(),
                        page: page.0,
                        refs: 1,
                    },
                );
                Some(view)
            }
            Err(e) => {
                warn!(page = format_args!("{:#x}", page.0), "{e}");
                None
            }
        }
    }

    unsafe fn unmap(&self, base: NonNull<u8>) {
        let key = base.as_ptr() as usize;
        // Same lock order as map_writable.
        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        let mut views = self.views.lock().unwrap_or_else(|e| e.into_inner());
        let Some(view) = views.get_mut(&key) else {
            warn!(view = format_args!("{key:#x}"), "unmap of unknown view");
            return;
        };
        view.refs -= 1;
        if view.refs > 0 {
            return;
        }
        let (region_base, page) = (view.region, view.page);
        views.remove(&key);

        if let Some(region) = regions.iter().find(|r| r.base() == region_base) {
            if let Err(e) = region.unmap(base, page, self.page_size) {
                warn!(page = format_args!("{page:#x}"), "{e}");
            }
        }
    }
}

impl ExecutionControl for ProcessHost {
    fn preempt_disable(&self) {
        PREEMPT_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn preempt_enable(&self) {
        PREEMPT_DEPTH.with(|d| match d.get() {
            0 => warn!("preempt_enable without matching preempt_disable"),
            n => d.set(n - 1),
        });
    }

    fn irq_save(&self) -> IrqFlags {
        let mut old = SigSet::empty();
        let saved = match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut old)) {
            Ok(()) => Some(old),
            Err(e) => {
                warn!("blocking signals failed: {e}");
                None
            }
        };
        SAVED_MASKS.with(|m| {
            let mut masks = m.borrow_mut();
            masks.push(saved);
            IrqFlags(masks.len())
        })
    }

    fn irq_restore(&self, flags: IrqFlags) {
        let saved = SAVED_MASKS.with(|m| {
            let mut masks = m.borrow_mut();
            if masks.len() != flags.0 {
                warn!(expected = flags.0, depth = masks.len(), "unbalanced irq_restore");
            }
            masks.pop()
        });
        if let Some(Some(old)) = saved {
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None) {
                warn!("restoring signal mask failed: {e}");
            }
        }
    }
}

impl NameCapture for ProcessHost {
    unsafe fn capture(&self, user: *const c_char) -> std::result::Result<FilenameHandle, c_long> {
        if user.is_null() {
            return Err(-(libc::EFAULT as c_long));
        }
        let mut len = 0;
        while len < PATH_MAX && *user.add(len) != 0 {
            len += 1;
        }
        if len == 0 {
            return Err(-(libc::ENOENT as c_long));
        }
        if len == PATH_MAX {
            return Err(-(libc::ENAMETOOLONG as c_long));
        }

        let bytes = std::slice::from_raw_parts(user as *const u8, len);
        let owned = Box::new(CString::new(bytes).map_err(|_| -(libc::EFAULT as c_long))?);
        let name = NonNull::new(owned.as_ptr() as *mut c_char).ok_or(-(libc::EFAULT as c_long))?;
        let raw = NonNull::from(Box::leak(owned)).cast::<c_void>();

        self.names_captured.fetch_add(1, Ordering::AcqRel);
        Ok(FilenameHandle::from_raw(raw, name))
    }

    unsafe fn release(&self, handle: FilenameHandle) {
        drop(Box::from_raw(handle.raw().as_ptr() as *mut CString));
        self.names_released.fetch_add(1, Ordering::AcqRel);
    }
}

impl AddressLimit for ProcessHost {
    fn address_limit(&self) -> AddrLimit {
        current_limit()
    }

    fn set_address_limit(&self, limit: AddrLimit) {
        ADDR_LIMIT.with(|l| l.set(limit.0));
    }

    fn kernel_limit(&self) -> AddrLimit {
        KERNEL_LIMIT
    }
}

/// Read a captured name back, for logging and tests.
///
/// # Safety
///
/// `handle` must not have been released.
pub unsafe fn handle_name(handle: &FilenameHandle) -> String {
    CStr::from_ptr(handle.name()).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn registered_symbols_win_over_dlsym() {
        let host = ProcessHost::new();
        host.register_symbol("sys_call_table", 0x4000).unwrap();

        assert_eq!(host.resolve("sys_call_table"), Some(0x4000));
        assert!(matches!(
            host.register_symbol("sys_call_table", 0x8000),
            Err(HostError::DuplicateSymbol(_))
        ));
        assert_eq!(host.resolve("sct_no_such_table"), None);
    }

    #[test]
    fn dlsym_fallback_finds_libc_symbols() {
        let host = ProcessHost::new();
        assert!(host.resolve("getpid").is_some());
        assert_eq!(host.resolve("bad\0name"), None);
    }

    #[test]
    fn pages_are_classified_by_region_kind() {
        let host = ProcessHost::new();
        let dynamic = host.allocate_table("dyn", RegionKind::Dynamic, &[1, 2]).unwrap();
        let fixed = host.allocate_table("fixed", RegionKind::Static, &[3, 4]).unwrap();

        assert!(host.is_dynamic_mapping(dynamic.base() + 8));
        assert!(!host.is_dynamic_mapping(fixed.base()));
        assert_eq!(host.dynamic_page(dynamic.base() + 8), Some(PageFrame(dynamic.base())));
        assert_eq!(host.static_page(dynamic.base()), None);
        assert_eq!(host.static_page(fixed.base() + 8), Some(PageFrame(fixed.base())));
        assert_eq!(host.static_page(0x10), None);
        assert_eq!(fixed.get(1), Some(4));
        assert_eq!(fixed.get(2), None);
    }

    #[test]
    fn empty_tables_are_rejected() {
        let host = ProcessHost::new();
        assert!(matches!(
            host.allocate_table("empty", RegionKind::Static, &[]),
            Err(HostError::EmptyTable(_))
        ));
    }

    #[test]
    fn static_views_are_shared_until_last_unmap() {
        let host = ProcessHost::new();
        let table = host.allocate_table("fixed", RegionKind::Static, &[0]).unwrap();
        let page = PageFrame(table.base());

        let first = host.map_writable(page).unwrap();
        let second = host.map_writable(page).unwrap();
        assert_eq!(first, second);
        assert_eq!(host.active_views(), 1);

        unsafe { host.unmap(first) };
        assert_eq!(host.active_views(), 1);
        unsafe { host.unmap(second) };
        assert_eq!(host.active_views(), 0);
    }

    #[test]
    fn unmapped_addresses_cannot_be_mapped() {
        let host = ProcessHost::new();
        assert!(host.map_writable(PageFrame(0x1000)).is_none());
    }

    #[test]
    fn preempt_and_irq_state_nest() {
        let host = ProcessHost::new();
        host.preempt_disable();
        let outer = host.irq_save();
        let inner = host.irq_save();
        assert!(irqs_disabled());
        assert_eq!(preempt_depth(), 1);
        host.irq_restore(inner);
        host.irq_restore(outer);
        host.preempt_enable();
        assert!(!irqs_disabled());
        assert_eq!(preempt_depth(), 0);

        // Underflow is ignored.
        host.preempt_enable();
        assert_eq!(preempt_depth(), 0);
    }

    #[test]
    fn capture_copies_and_release_frees() {
        let host = ProcessHost::new();
        let path = CString::new("/system/bin/su").unwrap();

        let handle = unsafe { host.capture(path.as_ptr()) }.unwrap();
        assert_ne!(handle.name(), path.as_ptr());
        assert_eq!(unsafe { handle_name(&handle) }, "/system/bin/su");
        assert_eq!(host.outstanding_names(), 1);

        unsafe { host.release(handle) };
        assert_eq!(host.outstanding_names(), 0);
        assert_eq!(host.names_captured(), 1);
    }

    #[test]
    fn capture_reports_errno_values() {
        let host = ProcessHost::new();
        let empty = CString::new("").unwrap();
        let long = CString::new("a".repeat(PATH_MAX)).unwrap();

        assert_eq!(unsafe { host.capture(ptr::null()) }.unwrap_err(), -(libc::EFAULT as c_long));
        assert_eq!(unsafe { host.capture(empty.as_ptr()) }.unwrap_err(), -(libc::ENOENT as c_long));
        assert_eq!(
            unsafe { host.capture(long.as_ptr()) }.unwrap_err(),
            -(libc::ENAMETOOLONG as c_long)
        );
        assert_eq!(host.outstanding_names(), 0);
    }

    #[test]
    fn address_limit_is_per_thread() {
        let host = ProcessHost::new();
        host.set_address_limit(host.kernel_limit());
        assert_eq!(host.address_limit(), KERNEL_LIMIT);

        let other = std::thread::spawn(current_limit).join().unwrap();
        assert_eq!(other, USER_LIMIT);

        host.set_address_limit(USER_LIMIT);
        assert_eq!(current_limit(), USER_LIMIT);
    }
}
