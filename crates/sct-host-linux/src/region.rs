// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only memory regions holding simulated dispatch tables.
//!
//! Two region kinds stand in for the two ways a kernel maps its tables:
//!
//! - [`RegionKind::Dynamic`] regions live in a `memfd`. Their writable
//!   alias is a second, short-lived `MAP_SHARED` mapping of the same file
//!   page, like a temporary virtual alias of a vmalloc page.
//! - [`RegionKind::Static`] regions are private anonymous memory. The page
//!   itself is flipped to read-write with `mprotect` and back again.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::ptr::{self, NonNull};

use crate::error::{HostError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Dynamic,
    Static,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionKind::Dynamic => write!(f, "dynamic"),
            RegionKind::Static => write!(f, "static"),
        }
    }
}

/// A page-aligned, read-only mapping owned by the host
pub(crate) struct Region {
    kind: RegionKind,
    base: NonNull<u8>,
    len: usize,
    backing: Option<File>,
}

// SAFETY: the mapping is process-wide and only mutated through atomic
// stores into aliases or while the page is temporarily writable.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn page_round_up(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size) * page_size
}

fn entry_bytes(entries: &[usize]) -> Vec<u8> {
    entries.iter().flat_map(|e| e.to_ne_bytes()).collect()
}

unsafe fn mmap(len: usize, prot: libc::c_int, flags: libc::c_int, fd: libc::c_int, offset: usize) -> Result<NonNull<u8>> {
    let addr = libc::mmap(ptr::null_mut(), len, prot, flags, fd, offset as libc::off_t);
    if addr == libc::MAP_FAILED {
        return Err(HostError::last_os("mmap"));
    }
    NonNull::new(addr as *mut u8).ok_or_else(|| HostError::last_os("mmap"))
}

impl Region {
    pub(crate) fn allocate(kind: RegionKind, entries: &[usize], page_size: usize) -> Result<Self> {
        let len = page_round_up(std::mem::size_of_val(entries).max(1), page_size);
        match kind {
            RegionKind::Dynamic => Self::dynamic(entries, len),
            RegionKind::Static => Self::fixed(entries, len),
        }
    }

    fn dynamic(entries: &[usize], len: usize) -> Result<Self> {
        let fd = unsafe { libc::memfd_create(c"sct-table".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(HostError::last_os("memfd_create"));
        }
        // SAFETY: memfd_create just returned this descriptor.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        file.set_len(len as u64).map_err(|source| HostError::Os { op: "ftruncate", source })?;
        file.write_all_at(&entry_bytes(entries), 0)
            .map_err(|source| HostError::Os { op: "pwrite", source })?;

        let base = unsafe { mmap(len, libc::PROT_READ, libc::MAP_SHARED, file.as_raw_fd(), 0)? };
        Ok(Self {
            kind: RegionKind::Dynamic,
            base,
            len,
            backing: Some(file),
        })
    }

    fn fixed(entries: &[usize], len: usize) -> Result<Self> {
        let base = unsafe {
            mmap(
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        let base = scopeguard::guard(base, |base| unsafe {
            libc::munmap(base.as_ptr().cast(), len);
        });

        unsafe {
            ptr::copy_nonoverlapping(entries.as_ptr(), base.as_ptr() as *mut usize, entries.len());
            if libc::mprotect(base.as_ptr().cast(), len, libc::PROT_READ) != 0 {
                return Err(HostError::last_os("mprotect"));
            }
        }

        Ok(Self {
            kind: RegionKind::Static,
            base: scopeguard::ScopeGuard::into_inner(base),
            len,
            backing: None,
        })
    }

    pub(crate) fn kind(&self) -> RegionKind {
        self.kind
    }

    pub(crate) fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.len
    }

    /// Writable view of the page starting at `page`.
    ///
    /// For static regions this is the page itself, so callers must
    /// serialize [`Region::map_writable`] and [`Region::unmap`] per page.
    pub(crate) fn map_writable(&self, page: usize, page_size: usize) -> Result<NonNull<u8>> {
        match &self.backing {
            Some(file) => unsafe {
                mmap(
                    page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    page - self.base(),
                )
            },
            None => {
                if unsafe { libc::mprotect(page as *mut libc::c_void, page_size, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
                    return Err(HostError::last_os("mprotect"));
                }
                NonNull::new(page as *mut u8).ok_or_else(|| HostError::last_os("mprotect"))
            }
        }
    }

    /// # Safety
    ///
    /// `view` must come from [`Region::map_writable`] on this region for the
    /// page starting at `page`.
    pub(crate) unsafe fn unmap(&self, view: NonNull<u8>, page: usize, page_size: usize) -> Result<()> {
        let rc = match self.backing {
            Some(_) => libc::munmap(view.as_ptr().cast(), page_size),
            None => libc::mprotect(page as *mut libc::c_void, page_size, libc::PROT_READ),
        };
        if rc != 0 {
            return Err(HostError::last_os(if self.backing.is_some() { "munmap" } else { "mprotect" }));
        }
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}
