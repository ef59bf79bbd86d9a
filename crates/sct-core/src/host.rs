// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Primitives consumed from the host environment.
//!
//! The core never owns the dispatch tables, the pages backing them or the
//! captured path strings. It reaches all of them through the traits below,
//! which a host bundles into a single [`Host`] implementation.

use libc::{c_char, c_long, c_void};
use std::ptr::NonNull;

/// Host-defined identifier of a physical page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFrame(pub usize);

/// Saved interrupt state returned by [`ExecutionControl::irq_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags(pub usize);

/// Address-space access limit of the current execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrLimit(pub usize);

/// A captured path string.
///
/// This is a non-owning view: ownership stays with whoever obtained it from
/// [`NameCapture::capture`] (or with the policy layer for substituted names).
/// Equality is identity of the underlying host object, which is the only
/// signal a wrapper has that a policy substituted the name.
#[derive(Debug, Clone, Copy)]
pub struct FilenameHandle {
    raw: NonNull<c_void>,
    name: NonNull<c_char>,
}

impl FilenameHandle {
    /// # Safety
    ///
    /// `raw` must identify a live host name object and `name` must point to
    /// its NUL-terminated string for as long as the handle is used.
    pub unsafe fn from_raw(raw: NonNull<c_void>, name: NonNull<c_char>) -> Self {
        Self { raw, name }
    }

    pub fn raw(&self) -> NonNull<c_void> {
        self.raw
    }

    pub fn name(&self) -> *const c_char {
        self.name.as_ptr()
    }
}

impl PartialEq for FilenameHandle {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for FilenameHandle {}

/// Symbol-resolution service
pub trait SymbolResolver {
    /// Resolve `name` to the base address of a dispatch table.
    fn resolve(&self, name: &str) -> Option<usize>;
}

/// Page-mapping primitives
pub trait PageMapper {
    fn page_size(&self) -> usize {
        4096
    }

    /// Whether `addr` lies in a dynamically mapped region.
    fn is_dynamic_mapping(&self, addr: usize) -> bool;

    /// Backing page of an address inside a dynamically mapped region.
    fn dynamic_page(&self, addr: usize) -> Option<PageFrame>;

    /// Backing page of an address inside the statically mapped region.
    fn static_page(&self, addr: usize) -> Option<PageFrame>;

    /// Create a temporary writable mapping of exactly one page.
    fn map_writable(&self, page: PageFrame) -> Option<NonNull<u8>>;

    /// Destroy a mapping created by [`PageMapper::map_writable`].
    ///
    /// # Safety
    ///
    /// `base` must come from `map_writable` on this host and must not be
    /// used afterwards.
    unsafe fn unmap(&self, base: NonNull<u8>);
}

/// Preemption and interrupt control on the current execution unit
pub trait ExecutionControl {
    fn preempt_disable(&self);
    fn preempt_enable(&self);
    fn irq_save(&self) -> IrqFlags;
    fn irq_restore(&self, flags: IrqFlags);
}

/// Name-capture and release primitives
pub trait NameCapture {
    /// Copy a caller-supplied path into a host name object.
    ///
    /// Errors are negative errno values, as the replaced syscall would
    /// return them.
    ///
    /// # Safety
    ///
    /// `user` is an untrusted caller pointer; the host is responsible for
    /// validating it.
    unsafe fn capture(&self, user: *const c_char) -> std::result::Result<FilenameHandle, c_long>;

    /// # Safety
    ///
    /// `handle` must come from [`NameCapture::capture`] and is released at
    /// most once.
    unsafe fn release(&self, handle: FilenameHandle);
}

/// Address-space access policy switch
pub trait AddressLimit {
    fn address_limit(&self) -> AddrLimit;
    fn set_address_limit(&self, limit: AddrLimit);
    /// The limit that lets kernel-held pointers pass where user pointers are
    /// expected.
    fn kernel_limit(&self) -> AddrLimit;
}

/// Everything the core consumes from its host
pub trait Host:
    SymbolResolver + PageMapper + ExecutionControl + NameCapture + AddressLimit + Send + Sync
{
}

impl<T> Host for T where
    T: SymbolResolver + PageMapper + ExecutionControl + NameCapture + AddressLimit + Send + Sync
{
}
