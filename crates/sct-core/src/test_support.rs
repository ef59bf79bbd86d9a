// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory host used by the unit tests.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use libc::{c_char, c_long, c_void};

use crate::host::{
    AddrLimit, AddressLimit, ExecutionControl, FilenameHandle, IrqFlags, NameCapture, PageFrame,
    PageMapper, SymbolResolver,
};

pub const USER_LIMIT: AddrLimit = AddrLimit(0);
pub const KERNEL_LIMIT: AddrLimit = AddrLimit(1);

thread_local! {
    static LIMIT: Cell<usize> = const { Cell::new(0) };
}

/// Address limit of the calling thread as last set through a [`FakeHost`].
pub fn current_limit() -> AddrLimit {
    AddrLimit(LIMIT.with(|l| l.get()))
}

/// A table whose slots can be inspected while the patcher writes them
pub struct FakeTable {
    slots: Box<[AtomicUsize]>,
}

impl FakeTable {
    pub fn new(values: &[usize]) -> Self {
        Self {
            slots: values.iter().map(|&v| AtomicUsize::new(v)).collect(),
        }
    }

    pub fn base(&self) -> NonNull<usize> {
        NonNull::new(self.slots.as_ptr() as *mut usize).unwrap()
    }

    pub fn get(&self, index: usize) -> usize {
        self.slots[index].load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub maps: usize,
    pub unmaps: usize,
    pub irq_saves: usize,
    pub irq_restores: usize,
    pub preempt_depth: usize,
    pub max_preempt_depth: usize,
    pub dynamic_lookups: usize,
    pub static_lookups: usize,
}

#[derive(Default)]
pub struct FakeHost {
    dynamic: bool,
    fail_page: bool,
    fail_map: bool,
    capture_error: Option<c_long>,
    symbols: Mutex<HashMap<String, usize>>,
    stats: Mutex<Stats>,
    released: Mutex<Vec<usize>>,
    captured: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_page_failure(mut self) -> Self {
        self.fail_page = true;
        self
    }

    pub fn with_map_failure(mut self) -> Self {
        self.fail_map = true;
        self
    }

    pub fn with_capture_error(mut self, errno: c_long) -> Self {
        self.capture_error = Some(errno);
        self
    }

    pub fn with_symbol(self, name: &str, addr: usize) -> Self {
        self.symbols.lock().unwrap().insert(name.to_string(), addr);
        self
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }

    pub fn captured(&self) -> usize {
        self.captured.load(Ordering::SeqCst)
    }

    /// Raw handles released so far, in release order.
    pub fn released(&self) -> Vec<usize> {
        self.released.lock().unwrap().clone()
    }

    fn page_of(addr: usize) -> PageFrame {
        PageFrame(addr & !(4096 - 1))
    }
}

impl SymbolResolver for FakeHost {
    fn resolve(&self, name: &str) -> Option<usize> {
        self.symbols.lock().unwrap().get(name).copied()
    }
}

impl PageMapper for FakeHost {
    fn is_dynamic_mapping(&self, _addr: usize) -> bool {
        self.dynamic
    }

    fn dynamic_page(&self, addr: usize) -> Option<PageFrame> {
        self.stats.lock().unwrap().dynamic_lookups += 1;
        (!self.fail_page).then(|| Self::page_of(addr))
    }

    fn static_page(&self, addr: usize) -> Option<PageFrame> {
        self.stats.lock().unwrap().static_lookups += 1;
        (!self.fail_page).then(|| Self::page_of(addr))
    }

    fn map_writable(&self, page: PageFrame) -> Option<NonNull<u8>> {
        if self.fail_map {
            return None;
        }
        self.stats.lock().unwrap().maps += 1;
        // The fake alias is the page itself; the backing memory is writable.
        NonNull::new(page.0 as *mut u8)
    }

    unsafe fn unmap(&self, _base: NonNull<u8>) {
        self.stats.lock().unwrap().unmaps += 1;
    }
}

impl ExecutionControl for FakeHost {
    fn preempt_disable(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.preempt_depth += 1;
        stats.max_preempt_depth = stats.max_preempt_depth.max(stats.preempt_depth);
    }

    fn preempt_enable(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.preempt_depth = stats.preempt_depth.saturating_sub(1);
    }

    fn irq_save(&self) -> IrqFlags {
        self.stats.lock().unwrap().irq_saves += 1;
        IrqFlags(0x80)
    }

    fn irq_restore(&self, flags: IrqFlags) {
        assert_eq!(flags, IrqFlags(0x80));
        self.stats.lock().unwrap().irq_restores += 1;
    }
}

impl NameCapture for FakeHost {
    unsafe fn capture(&self, user: *const c_char) -> Result<FilenameHandle, c_long> {
        if let Some(errno) = self.capture_error {
            return Err(errno);
        }
        if user.is_null() {
            return Err(-(libc::EFAULT as c_long));
        }
        let boxed = Box::new(CStr::from_ptr(user).to_owned());
        let name = NonNull::new(boxed.as_ptr() as *mut c_char).unwrap();
        let raw = NonNull::new(Box::into_raw(boxed) as *mut c_void).unwrap();
        self.captured.fetch_add(1, Ordering::SeqCst);
        Ok(FilenameHandle::from_raw(raw, name))
    }

    unsafe fn release(&self, handle: FilenameHandle) {
        self.released.lock().unwrap().push(handle.raw().as_ptr() as usize);
        drop(Box::from_raw(handle.raw().as_ptr() as *mut CString));
    }
}

impl AddressLimit for FakeHost {
    fn address_limit(&self) -> AddrLimit {
        current_limit()
    }

    fn set_address_limit(&self, limit: AddrLimit) {
        LIMIT.with(|l| l.set(limit.0));
    }

    fn kernel_limit(&self) -> AddrLimit {
        KERNEL_LIMIT
    }
}
