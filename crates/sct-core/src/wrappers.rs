// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interception wrappers installed into the dispatch-table slots.
//!
//! Each `hook_*` entry point has exactly the signature of the call it
//! replaces. It looks up the original entry in [`ORIGINALS`] and the
//! registered [`Runtime`](crate::runtime::Runtime), and hands both to one of
//! the `handle_*` functions, which hold the actual interception logic and
//! can be driven directly with any host and policy.

use libc::{c_char, c_int, c_long, c_uint, c_void};
use tracing::debug;

use crate::host::{AddrLimit, AddressLimit, FilenameHandle, Host, NameCapture};
use crate::policy::{CheckKind, InterceptPolicy};
use crate::registry::{HookedSyscall, ORIGINALS};
use crate::runtime::{self, Runtime};

pub type ExecveFn = unsafe extern "C" fn(
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_long;

pub type ExecveatFn = unsafe extern "C" fn(
    dfd: c_int,
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
    flags: c_int,
) -> c_long;

pub type FaccessatFn = unsafe extern "C" fn(dfd: c_int, filename: *const c_char, mode: c_int) -> c_long;

pub type FstatatFn = unsafe extern "C" fn(
    dfd: c_int,
    filename: *const c_char,
    statbuf: *mut c_void,
    flag: c_int,
) -> c_long;

pub type RebootFn =
    unsafe extern "C" fn(magic1: c_int, magic2: c_int, cmd: c_uint, arg: *mut c_void) -> c_long;

const ENOSYS: c_long = -(libc::ENOSYS as c_long);

/// Original implementation of an execution-family call
#[derive(Clone, Copy)]
pub enum ExecOriginal {
    Execve(ExecveFn),
    Execveat(ExecveatFn),
}

impl ExecOriginal {
    unsafe fn call(
        self,
        dfd: c_int,
        filename: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
        flags: c_int,
    ) -> c_long {
        match self {
            ExecOriginal::Execve(f) => f(filename, argv, envp),
            ExecOriginal::Execveat(f) => f(dfd, filename, argv, envp, flags),
        }
    }
}

/// A captured name, released on drop
struct CapturedName<'h, H: NameCapture + ?Sized> {
    host: &'h H,
    handle: FilenameHandle,
}

impl<'h, H: NameCapture + ?Sized> CapturedName<'h, H> {
    unsafe fn capture(host: &'h H, user: *const c_char) -> Result<Self, c_long> {
        let handle = host.capture(user)?;
        Ok(Self { host, handle })
    }
}

impl<H: NameCapture + ?Sized> Drop for CapturedName<'_, H> {
    fn drop(&mut self) {
        // SAFETY: the handle came from capture and is released only here.
        unsafe { self.host.release(self.handle) }
    }
}

/// Kernel address limit in force until drop, then the prior limit again
struct KernelLimitScope<'h, H: AddressLimit + ?Sized> {
    host: &'h H,
    saved: AddrLimit,
}

impl<'h, H: AddressLimit + ?Sized> KernelLimitScope<'h, H> {
    fn enter(host: &'h H) -> Self {
        let saved = host.address_limit();
        host.set_address_limit(host.kernel_limit());
        Self { host, saved }
    }
}

impl<H: AddressLimit + ?Sized> Drop for KernelLimitScope<'_, H> {
    fn drop(&mut self) {
        self.host.set_address_limit(self.saved);
    }
}

/// Execution-family interception.
///
/// `flags` is ignored for [`ExecOriginal::Execve`]. When the policy swaps the
/// filename handle, the original receives the substituted, host-held string
/// under the kernel address limit; otherwise it receives the caller's
/// untouched pointer. The captured name is released on every path.
///
/// # Safety
///
/// The pointers are forwarded to `original` as-is and must be whatever the
/// replaced call accepts.
#[allow(clippy::too_many_arguments)]
pub unsafe fn handle_exec<H, P>(
    host: &H,
    policy: &P,
    original: ExecOriginal,
    mut dfd: c_int,
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
    mut flags: c_int,
) -> c_long
where
    H: Host + ?Sized,
    P: InterceptPolicy + ?Sized,
{
    let captured = match CapturedName::capture(host, filename) {
        Ok(captured) => captured,
        Err(errno) => return errno,
    };

    let mut name = captured.handle;
    let policy_flags = match original {
        ExecOriginal::Execve(_) => None,
        ExecOriginal::Execveat(_) => Some(&mut flags),
    };
    policy.decide_exec(&mut dfd, &mut name, argv.cast(), envp.cast(), policy_flags);

    if name != captured.handle {
        debug!("exec filename substituted by policy");
        let _limit = KernelLimitScope::enter(host);
        original.call(dfd, name.name(), argv, envp, flags)
    } else {
        original.call(dfd, filename, argv, envp, flags)
    }
}

/// # Safety
///
/// Arguments are forwarded to `original` unchanged unless the policy
/// rewrites them.
pub unsafe fn handle_faccessat<P: InterceptPolicy + ?Sized>(
    policy: &P,
    original: FaccessatFn,
    mut dfd: c_int,
    mut filename: *const c_char,
    mut mode: c_int,
) -> c_long {
    policy.decide_check(CheckKind::Access, &mut dfd, &mut filename, &mut mode);
    original(dfd, filename, mode)
}

/// # Safety
///
/// Arguments are forwarded to `original` unchanged unless the policy
/// rewrites them; `statbuf` is always forwarded untouched.
pub unsafe fn handle_fstatat<P: InterceptPolicy + ?Sized>(
    policy: &P,
    original: FstatatFn,
    mut dfd: c_int,
    mut filename: *const c_char,
    statbuf: *mut c_void,
    mut flag: c_int,
) -> c_long {
    policy.decide_check(CheckKind::Stat, &mut dfd, &mut filename, &mut flag);
    original(dfd, filename, statbuf, flag)
}

/// Primary reboot interception; forwards the policy's argument.
///
/// # Safety
///
/// `arg` is forwarded to `original` unless the policy replaces it.
pub unsafe fn handle_reboot<P: InterceptPolicy + ?Sized>(
    policy: &P,
    original: RebootFn,
    magic1: c_int,
    magic2: c_int,
    cmd: c_uint,
    arg: *mut c_void,
) -> c_long {
    let mut arg_ptr = arg;
    policy.decide_reboot(magic1, magic2, cmd, &mut arg_ptr);
    original(magic1, magic2, cmd, arg_ptr)
}

/// Compatibility reboot interception.
///
/// The policy is consulted, but the original receives the caller's `arg`
/// even if the policy replaced it. This differs from [`handle_reboot`] and
/// is kept until the policy contract says which argument should win.
///
/// # Safety
///
/// `arg` is forwarded to `original` as-is.
pub unsafe fn handle_compat_reboot<P: InterceptPolicy + ?Sized>(
    policy: &P,
    original: RebootFn,
    magic1: c_int,
    magic2: c_int,
    cmd: c_uint,
    arg: *mut c_void,
) -> c_long {
    let mut arg_ptr = arg;
    policy.decide_reboot(magic1, magic2, cmd, &mut arg_ptr);
    if arg_ptr != arg {
        debug!("compat reboot: policy argument not forwarded");
    }
    original(magic1, magic2, cmd, arg)
}

/// Registered runtime plus the original entry of `syscall`, as `F`.
unsafe fn delegate<F: Copy>(syscall: HookedSyscall) -> Option<(&'static Runtime, F)> {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
    let runtime = runtime::get()?;
    let addr = ORIGINALS.original(syscall)?;
    Some((runtime, std::mem::transmute_copy::<usize, F>(&addr)))
}

/// # Safety
///
/// Installed into a dispatch-table slot; called with the `execve` ABI.
pub unsafe extern "C" fn hook_sys_execve(
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_long {
    match delegate::<ExecveFn>(HookedSyscall::Execve) {
        Some((rt, original)) => handle_exec(
            rt.host,
            rt.policy,
            ExecOriginal::Execve(original),
            libc::AT_FDCWD,
            filename,
            argv,
            envp,
            0,
        ),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a dispatch-table slot; called with the `execveat` ABI.
pub unsafe extern "C" fn hook_sys_execveat(
    dfd: c_int,
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
    flags: c_int,
) -> c_long {
    match delegate::<ExecveatFn>(HookedSyscall::Execveat) {
        Some((rt, original)) => handle_exec(
            rt.host,
            rt.policy,
            ExecOriginal::Execveat(original),
            dfd,
            filename,
            argv,
            envp,
            flags,
        ),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a dispatch-table slot; called with the `faccessat` ABI.
pub unsafe extern "C" fn hook_sys_faccessat(dfd: c_int, filename: *const c_char, mode: c_int) -> c_long {
    match delegate::<FaccessatFn>(HookedSyscall::Faccessat) {
        Some((rt, original)) => handle_faccessat(rt.policy, original, dfd, filename, mode),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a dispatch-table slot; called with the `newfstatat` ABI.
pub unsafe extern "C" fn hook_sys_newfstatat(
    dfd: c_int,
    filename: *const c_char,
    statbuf: *mut c_void,
    flag: c_int,
) -> c_long {
    match delegate::<FstatatFn>(HookedSyscall::Newfstatat) {
        Some((rt, original)) => handle_fstatat(rt.policy, original, dfd, filename, statbuf, flag),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a dispatch-table slot; called with the `reboot` ABI.
pub unsafe extern "C" fn hook_sys_reboot(
    magic1: c_int,
    magic2: c_int,
    cmd: c_uint,
    arg: *mut c_void,
) -> c_long {
    match delegate::<RebootFn>(HookedSyscall::Reboot) {
        Some((rt, original)) => handle_reboot(rt.policy, original, magic1, magic2, cmd, arg),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a compatibility-table slot; called with the `execve` ABI.
pub unsafe extern "C" fn hook_compat_sys_execve(
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_long {
    match delegate::<ExecveFn>(HookedSyscall::CompatExecve) {
        Some((rt, original)) => handle_exec(
            rt.host,
            rt.policy,
            ExecOriginal::Execve(original),
            libc::AT_FDCWD,
            filename,
            argv,
            envp,
            0,
        ),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a compatibility-table slot; called with the `execveat` ABI.
pub unsafe extern "C" fn hook_compat_sys_execveat(
    dfd: c_int,
    filename: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
    flags: c_int,
) -> c_long {
    match delegate::<ExecveatFn>(HookedSyscall::CompatExecveat) {
        Some((rt, original)) => handle_exec(
            rt.host,
            rt.policy,
            ExecOriginal::Execveat(original),
            dfd,
            filename,
            argv,
            envp,
            flags,
        ),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a compatibility-table slot; called with the `faccessat` ABI.
pub unsafe extern "C" fn hook_compat_sys_faccessat(
    dfd: c_int,
    filename: *const c_char,
    mode: c_int,
) -> c_long {
    match delegate::<FaccessatFn>(HookedSyscall::CompatFaccessat) {
        Some((rt, original)) => handle_faccessat(rt.policy, original, dfd, filename, mode),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a compatibility-table slot; called with the `fstatat64` ABI.
pub unsafe extern "C" fn hook_compat_sys_fstatat64(
    dfd: c_int,
    filename: *const c_char,
    statbuf: *mut c_void,
    flag: c_int,
) -> c_long {
    match delegate::<FstatatFn>(HookedSyscall::CompatFstatat64) {
        Some((rt, original)) => handle_fstatat(rt.policy, original, dfd, filename, statbuf, flag),
        None => ENOSYS,
    }
}

/// # Safety
///
/// Installed into a compatibility-table slot; called with the `reboot` ABI.
pub unsafe extern "C" fn hook_compat_sys_reboot(
    magic1: c_int,
    magic2: c_int,
    cmd: c_uint,
    arg: *mut c_void,
) -> c_long {
    match delegate::<RebootFn>(HookedSyscall::CompatReboot) {
        Some((rt, original)) => handle_compat_reboot(rt.policy, original, magic1, magic2, cmd, arg),
        None => ENOSYS,
    }
}

/// Address of the slot entry point for `syscall`.
pub fn entry_point(syscall: HookedSyscall) -> usize {
    match syscall {
        HookedSyscall::Reboot => hook_sys_reboot as usize,
        HookedSyscall::Execve => hook_sys_execve as usize,
        HookedSyscall::Execveat => hook_sys_execveat as usize,
        HookedSyscall::Faccessat => hook_sys_faccessat as usize,
        HookedSyscall::Newfstatat => hook_sys_newfstatat as usize,
        HookedSyscall::CompatReboot => hook_compat_sys_reboot as usize,
        HookedSyscall::CompatExecve => hook_compat_sys_execve as usize,
        HookedSyscall::CompatExecveat => hook_compat_sys_execveat as usize,
        HookedSyscall::CompatFaccessat => hook_compat_sys_faccessat as usize,
        HookedSyscall::CompatFstatat64 => hook_compat_sys_fstatat64 as usize,
    }
}
