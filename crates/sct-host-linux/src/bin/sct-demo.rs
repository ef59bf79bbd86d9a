// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Patch simulated syscall tables in this process and call through them.

use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use libc::{c_char, c_int, c_long, c_uint, c_void};
use tracing::info;

use sct_core::wrappers::{ExecveFn, FaccessatFn};
use sct_core::{HookConfig, HookedSyscall, SyscallNumbers, ORIGINALS};
use sct_host_linux::{current_limit, HostTable, ProcessHost, RedirectPolicy, RegionKind, KERNEL_LIMIT};
use sct_host_linux::{DEFAULT_SH_PATH, DEFAULT_SU_PATH};
use sct_logging::CliLoggingArgs;

#[derive(Parser, Debug)]
#[command(
    name = "sct-demo",
    about = "Hook simulated syscall tables and run calls through the patched slots"
)]
struct Cli {
    /// TOML hook configuration (defaults to the layout of this target)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Leave the compatibility table alone
    #[arg(long)]
    no_compat: bool,

    /// Path whose exec and checks are redirected
    #[arg(long, default_value = DEFAULT_SU_PATH)]
    from: String,

    /// Path served instead
    #[arg(long, default_value = DEFAULT_SH_PATH)]
    to: String,

    /// Paths to execute through the patched execve slot
    #[arg(default_values_t = [DEFAULT_SU_PATH.to_string(), "/system/bin/ls".to_string()])]
    paths: Vec<String>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

static LAST_PATH: Mutex<Option<(String, bool)>> = Mutex::new(None);

unsafe fn reached(call: &str, filename: *const c_char) {
    let path = if filename.is_null() {
        String::new()
    } else {
        CStr::from_ptr(filename).to_string_lossy().into_owned()
    };
    let kernel = current_limit() == KERNEL_LIMIT;
    info!(call, path = %path, kernel_limit = kernel, "original reached");
    *LAST_PATH.lock().unwrap_or_else(|e| e.into_inner()) = Some((path, kernel));
}

unsafe extern "C" fn sys_ni_syscall() -> c_long {
    -(libc::ENOSYS as c_long)
}

unsafe extern "C" fn sys_execve(filename: *const c_char, _: *const *const c_char, _: *const *const c_char) -> c_long {
    reached("execve", filename);
    0
}

unsafe extern "C" fn sys_execveat(
    _dfd: c_int,
    filename: *const c_char,
    _: *const *const c_char,
    _: *const *const c_char,
    _flags: c_int,
) -> c_long {
    reached("execveat", filename);
    0
}

unsafe extern "C" fn sys_faccessat(_dfd: c_int, filename: *const c_char, _mode: c_int) -> c_long {
    reached("faccessat", filename);
    0
}

unsafe extern "C" fn sys_fstatat(_dfd: c_int, filename: *const c_char, _: *mut c_void, _flag: c_int) -> c_long {
    reached("fstatat", filename);
    0
}

unsafe extern "C" fn sys_reboot(_: c_int, _: c_int, _: c_uint, _: *mut c_void) -> c_long {
    0
}

/// A table whose configured slots hold the stub originals and whose other
/// slots hold `sys_ni_syscall`.
fn build_table(
    host: &ProcessHost,
    symbol: &str,
    region: RegionKind,
    numbers: &SyscallNumbers,
) -> anyhow::Result<HostTable> {
    let len = [numbers.reboot, numbers.execve, numbers.execveat, numbers.faccessat, numbers.fstatat]
        .into_iter()
        .max()
        .unwrap_or(0)
        + 1;
    let mut entries = vec![sys_ni_syscall as usize; len];
    entries[numbers.reboot] = sys_reboot as usize;
    entries[numbers.execve] = sys_execve as usize;
    entries[numbers.execveat] = sys_execveat as usize;
    entries[numbers.faccessat] = sys_faccessat as usize;
    entries[numbers.fstatat] = sys_fstatat as usize;

    let table = host
        .allocate_table(symbol, region, &entries)
        .with_context(|| format!("allocating {symbol}"))?;
    host.register_symbol(symbol, table.base())?;
    Ok(table)
}

fn last_path() -> String {
    match LAST_PATH.lock().unwrap_or_else(|e| e.into_inner()).take() {
        Some((path, true)) => format!("{path} (kernel limit)"),
        Some((path, false)) => path,
        None => "<not reached>".to_string(),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.logging.clone().init("sct-demo")?;

    let mut config = match &cli.config {
        Some(path) => HookConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => HookConfig::default(),
    };
    if cli.no_compat {
        config = config.without_compat();
    }
    config.validate()?;

    let host: &'static ProcessHost = Box::leak(Box::new(ProcessHost::new()));
    let primary = build_table(host, &config.table_symbol, RegionKind::Dynamic, &config.primary)?;
    if let Some(symbol) = &config.compat_table_symbol {
        build_table(host, symbol, RegionKind::Static, &config.compat)?;
    }

    let policy: &'static RedirectPolicy = Box::leak(Box::new(
        RedirectPolicy::from_paths(&cli.from, &cli.to).context("redirect paths")?,
    ));
    sct_core::runtime::register(host, policy, config.clone())?;
    sct_core::init();

    for (syscall, original) in ORIGINALS.snapshot() {
        println!("{:<18} original {original:#x}", syscall.name());
    }
    if ORIGINALS.original(HookedSyscall::Execve).is_none() {
        anyhow::bail!("execve slot was not hooked");
    }

    let execve_slot = primary
        .get(config.primary.execve)
        .context("execve slot outside the table")?;
    let faccessat_slot = primary
        .get(config.primary.faccessat)
        .context("faccessat slot outside the table")?;
    // SAFETY: both slots hold either a wrapper or a stub with the matching ABI.
    let execve: ExecveFn = unsafe { std::mem::transmute::<usize, ExecveFn>(execve_slot) };
    let faccessat: FaccessatFn = unsafe { std::mem::transmute::<usize, FaccessatFn>(faccessat_slot) };

    for path in &cli.paths {
        let cpath = CString::new(path.as_str()).with_context(|| format!("invalid path {path:?}"))?;
        let argv = [cpath.as_ptr(), ptr::null()];

        let ret = unsafe { execve(cpath.as_ptr(), argv.as_ptr(), ptr::null()) };
        println!("execve({path}) = {ret} -> {}", last_path());

        let ret = unsafe { faccessat(libc::AT_FDCWD, cpath.as_ptr(), libc::X_OK) };
        println!("faccessat({path}) = {ret} -> {}", last_path());
    }

    println!(
        "{} exec redirect(s), {} check redirect(s), {} name(s) outstanding",
        policy.exec_redirects(),
        policy.check_redirects(),
        host.outstanding_names()
    );
    Ok(())
}
