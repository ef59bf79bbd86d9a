// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dispatch tables and the table locator.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{HookError, Result};
use crate::host::SymbolResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Primary,
    Compat,
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKind::Primary => write!(f, "primary"),
            TableKind::Compat => write!(f, "compat"),
        }
    }
}

/// A host-owned array of pointer-sized slots indexed by call number.
///
/// The table length is not known here, so slot indices are never
/// bounds-checked.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTable {
    base: NonNull<usize>,
    kind: TableKind,
}

impl DispatchTable {
    /// # Safety
    ///
    /// `base` must be the pointer-aligned start of a live dispatch table that
    /// outlives every use of the returned value.
    pub unsafe fn from_raw(base: NonNull<usize>, kind: TableKind) -> Self {
        Self { base, kind }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Byte address of slot `index`.
    pub fn slot_addr(&self, index: usize) -> usize {
        self.base() + index * size_of::<usize>()
    }

    /// Current value of slot `index`.
    ///
    /// # Safety
    ///
    /// `index` must lie within the table.
    pub unsafe fn read(&self, index: usize) -> usize {
        AtomicUsize::from_ptr(self.base.as_ptr().add(index)).load(Ordering::Acquire)
    }
}

/// Resolve a table symbol through the host's symbol service.
pub fn locate<R: SymbolResolver + ?Sized>(
    resolver: &R,
    symbol: &str,
    kind: TableKind,
) -> Result<DispatchTable> {
    let base = resolver
        .resolve(symbol)
        .filter(|addr| addr % std::mem::align_of::<usize>() == 0)
        .and_then(|addr| NonNull::new(addr as *mut usize))
        .ok_or_else(|| HookError::SymbolNotFound {
            symbol: symbol.to_string(),
        })?;

    debug!(table = %kind, symbol, base = format_args!("{:#x}", base.as_ptr() as usize), "located dispatch table");
    // SAFETY: the symbol service hands out addresses of live, host-owned tables.
    Ok(unsafe { DispatchTable::from_raw(base, kind) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    mockall::mock! {
        Resolver {}
        impl SymbolResolver for Resolver {
            fn resolve(&self, name: &str) -> Option<usize>;
        }
    }

    #[test]
    fn locate_returns_resolved_table() {
        let table = [0x10usize, 0x20, 0x30];
        let base = table.as_ptr() as usize;

        let mut resolver = MockResolver::new();
        resolver.expect_resolve().with(eq("sys_call_table")).times(1).return_const(Some(base));

        let located = locate(&resolver, "sys_call_table", TableKind::Primary).unwrap();
        assert_eq!(located.base(), base);
        assert_eq!(located.kind(), TableKind::Primary);
        assert_eq!(located.slot_addr(2), base + 2 * size_of::<usize>());
        assert_eq!(unsafe { located.read(1) }, 0x20);
    }

    #[test]
    fn missing_symbol_is_reported() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().return_const(None);

        let err = locate(&resolver, "compat_sys_call_table", TableKind::Compat).unwrap_err();
        assert_eq!(
            err,
            HookError::SymbolNotFound {
                symbol: "compat_sys_call_table".into()
            }
        );
    }

    #[test]
    fn null_and_misaligned_addresses_are_rejected() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().with(eq("null")).return_const(Some(0usize));
        resolver.expect_resolve().with(eq("odd")).return_const(Some(0x1001usize));

        assert!(locate(&resolver, "null", TableKind::Primary).is_err());
        assert!(locate(&resolver, "odd", TableKind::Primary).is_err());
    }
}
