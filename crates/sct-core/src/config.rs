// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Hook configuration: table symbols and per-architecture syscall numbers.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{HookError, Result};

pub const DEFAULT_TABLE_SYMBOL: &str = "sys_call_table";
pub const DEFAULT_COMPAT_TABLE_SYMBOL: &str = "compat_sys_call_table";

/// Slot indices of the intercepted calls within one dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyscallNumbers {
    pub reboot: usize,
    pub execve: usize,
    pub execveat: usize,
    pub faccessat: usize,
    /// `newfstatat` on 64-bit tables, `fstatat64` on compatibility tables
    pub fstatat: usize,
}

impl SyscallNumbers {
    pub const fn aarch64() -> Self {
        Self {
            reboot: 142,
            execve: 221,
            execveat: 281,
            faccessat: 48,
            fstatat: 79,
        }
    }

    /// 32-bit ARM EABI numbers served by the aarch64 compatibility table
    pub const fn aarch64_compat() -> Self {
        Self {
            reboot: 88,
            execve: 11,
            execveat: 387,
            faccessat: 334,
            fstatat: 327,
        }
    }

    pub const fn x86_64() -> Self {
        Self {
            reboot: 169,
            execve: 59,
            execveat: 322,
            faccessat: 269,
            fstatat: 262,
        }
    }

    /// ia32 numbers served by the x86_64 compatibility table
    pub const fn x86_64_compat() -> Self {
        Self {
            reboot: 88,
            execve: 11,
            execveat: 358,
            faccessat: 307,
            fstatat: 300,
        }
    }

    pub fn native() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::aarch64()
        } else {
            Self::x86_64()
        }
    }

    pub fn native_compat() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::aarch64_compat()
        } else {
            Self::x86_64_compat()
        }
    }

    fn as_array(&self) -> [(&'static str, usize); 5] {
        [
            ("reboot", self.reboot),
            ("execve", self.execve),
            ("execveat", self.execveat),
            ("faccessat", self.faccessat),
            ("fstatat", self.fstatat),
        ]
    }

    fn validate(&self, table: &str) -> Result<()> {
        let entries = self.as_array();
        for (i, (name, nr)) in entries.iter().enumerate() {
            if let Some((other, _)) = entries[i + 1..].iter().find(|(_, n)| n == nr) {
                return Err(HookError::Config(format!(
                    "{table}: {name} and {other} share syscall number {nr}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for SyscallNumbers {
    fn default() -> Self {
        Self::native()
    }
}

/// A table of syscall numbers as written in a config file. Absent keys take
/// the value of the matching built-in layout.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct NumbersFile {
    reboot: Option<usize>,
    execve: Option<usize>,
    execveat: Option<usize>,
    faccessat: Option<usize>,
    fstatat: Option<usize>,
}

impl NumbersFile {
    fn or(self, defaults: SyscallNumbers) -> SyscallNumbers {
        SyscallNumbers {
            reboot: self.reboot.unwrap_or(defaults.reboot),
            execve: self.execve.unwrap_or(defaults.execve),
            execveat: self.execveat.unwrap_or(defaults.execveat),
            faccessat: self.faccessat.unwrap_or(defaults.faccessat),
            fstatat: self.fstatat.unwrap_or(defaults.fstatat),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    table_symbol: Option<String>,
    compat_table_symbol: Option<String>,
    #[serde(default)]
    primary: NumbersFile,
    #[serde(default)]
    compat: NumbersFile,
}

impl From<ConfigFile> for HookConfig {
    fn from(file: ConfigFile) -> Self {
        let defaults = HookConfig::default();
        Self {
            table_symbol: file.table_symbol.unwrap_or(defaults.table_symbol),
            compat_table_symbol: file.compat_table_symbol.or(defaults.compat_table_symbol),
            primary: file.primary.or(defaults.primary),
            compat: file.compat.or(defaults.compat),
        }
    }
}

/// Which tables to patch and where the intercepted calls live in them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "ConfigFile")]
pub struct HookConfig {
    /// Symbol of the primary dispatch table
    pub table_symbol: String,
    /// Symbol of the compatibility table; `None` skips the compatibility pass
    pub compat_table_symbol: Option<String>,
    pub primary: SyscallNumbers,
    pub compat: SyscallNumbers,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            table_symbol: DEFAULT_TABLE_SYMBOL.to_string(),
            compat_table_symbol: Some(DEFAULT_COMPAT_TABLE_SYMBOL.to_string()),
            primary: SyscallNumbers::native(),
            compat: SyscallNumbers::native_compat(),
        }
    }
}

impl HookConfig {
    /// Parse a TOML document; absent keys keep their defaults, per table and
    /// per syscall.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: HookConfig =
            toml::from_str(s).map_err(|e| HookError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HookError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn without_compat(mut self) -> Self {
        self.compat_table_symbol = None;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_symbol.trim().is_empty() {
            return Err(HookError::Config("table-symbol is empty".into()));
        }
        if let Some(symbol) = &self.compat_table_symbol {
            if symbol.trim().is_empty() {
                return Err(HookError::Config("compat-table-symbol is empty".into()));
            }
        }
        self.primary.validate("primary")?;
        self.compat.validate("compat")
    }
}
