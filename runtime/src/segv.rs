// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Emergency stack growth.
//!
//! The checkpoint heuristic in [`crate::stack`] is proactive but can be
//! outrun by a single large frame. The guard page below every strand stack
//! catches that case: the fault handler here recognizes an access into the
//! guard page of the currently running strand, grows the stack in place and
//! patches the interrupted register state so the faulting instruction retries
//! against the new mapping. Any other fault is re-raised with the default
//! disposition.
//!
//! Growth unmaps the very stack that faulted, so the handler must not run on
//! it: the scheduler installs a dedicated alternate signal stack for its
//! thread and the handler is registered `SA_ONSTACK`.
//!
//! Everything reachable from the handler is restricted to async-signal-safe
//! operations: raw `write(2)` for diagnostics and `mmap`/`munmap` inside the
//! shared growth routine. No tracing, no allocator.

use crate::sched;
use crate::stack::{MAX_STACK_SIZE, grow_to};
use core::ffi::{c_int, c_void};
use std::io;
use std::ptr;
use std::sync::Once;

const ALT_STACK_SIZE: usize = 64 * 1024;

/// Async-signal-safe stderr output for paths where `tracing` is off-limits.
pub(crate) fn raw_stderr(msg: &[u8]) {
    // Safety: write(2) on a borrowed buffer; the result is deliberately
    // ignored, there is nothing useful to do when stderr is gone.
    let _ = unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
}

/// Install the fault handler once per process.
///
/// On non-Linux targets guard-page accesses surface as `SIGBUS` rather than
/// `SIGSEGV`, so both signals get the handler there.
pub(crate) fn install_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Safety: a fresh zeroed sigaction filled out per sigaction(2).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_fault as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
            #[cfg(not(target_os = "linux"))]
            libc::sigaction(libc::SIGBUS, &action, ptr::null_mut());
        }
    });
}

/// The alternate stack the fault handler runs on, owned by the scheduler for
/// the thread driving it.
#[derive(Debug)]
pub(crate) struct AltStack {
    base: *mut u8,
    size: usize,
}

impl AltStack {
    /// Map and register an alternate signal stack for the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if the mapping or `sigaltstack(2)` fails.
    pub(crate) fn install() -> io::Result<Self> {
        // Safety: plain anonymous read/write reservation.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ALT_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let stack = Self {
            base: base.cast::<u8>(),
            size: ALT_STACK_SIZE,
        };

        let descriptor = libc::stack_t {
            ss_sp: base,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        // Safety: descriptor refers to the mapping created above.
        if unsafe { libc::sigaltstack(&descriptor, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(stack)
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let descriptor = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: self.size,
        };
        // Safety: disarming before unmapping; failures leave the mapping in
        // place, which only wastes the pages.
        unsafe {
            if libc::sigaltstack(&descriptor, ptr::null_mut()) == 0 {
                libc::munmap(self.base.cast(), self.size);
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
            // Safety: si_addr is valid for SIGSEGV per sigaction(2).
            unsafe { (*info).si_addr() as usize }
        }
    } else {
        unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
            // Safety: si_addr is valid for SIGSEGV/SIGBUS per sigaction(2).
            unsafe { (*info).si_addr as usize }
        }
    }
}

unsafe extern "C" fn handle_fault(signo: c_int, info: *mut libc::siginfo_t, uctx: *mut c_void) {
    let scheduler = sched::published();
    if !scheduler.is_null() {
        // Safety: the scheduler pointer is published before the handler can
        // observe it and only cleared at shutdown, outside any strand; the
        // current strand is stable for the duration of its execution, which
        // is the only time its stack can fault. A raw place copy, no
        // reference is formed.
        let current = unsafe { (*scheduler).current };
        if let Some(strand) = current {
            let strand = strand.as_ptr();
            // Safety: see above; the handler is the only asynchronous reader
            // and the fault suspended the sole mutator.
            let stack = unsafe { &mut (*strand).stack };
            let fault = unsafe { fault_address(info) };
            if stack.guard_contains(fault) {
                stack.note_guard_hit();
                raw_stderr(b"weft-runtime: guard page hit, growing strand stack\n");

                // Safety: supported platforms expose SP/FP in the ucontext.
                let (sp, fp) = unsafe { machine::read(uctx) };
                let new_size = (stack.usable_size() * 2).min(MAX_STACK_SIZE);
                // Safety: the faulted strand is stopped inside this handler;
                // sp/fp are its live registers.
                if let Some(translated) = unsafe { grow_to(stack, sp, fp, new_size, true) } {
                    // Safety: rewriting the interrupted registers so the
                    // faulting instruction retries on the new stack.
                    unsafe {
                        machine::write(uctx, translated.sp, translated.fp);
                    }
                    return;
                }
                raw_stderr(b"weft-runtime: emergency stack growth failed\n");
            }
        }
    }

    // Unrelated fault or unrecoverable overflow: hand it back to the default
    // disposition.
    // Safety: resetting to SIG_DFL and re-raising terminates the process the
    // way an unhandled fault would.
    unsafe {
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
    }
}

mod machine {
    #![allow(
        clippy::cast_ptr_alignment,
        reason = "the kernel hands the handler a suitably aligned ucontext"
    )]

    use core::ffi::c_void;

    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            pub(super) unsafe fn read(uctx: *mut c_void) -> (usize, usize) {
                // Safety: the kernel passes a valid ucontext_t.
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    let gregs = &(*uc).uc_mcontext.gregs;
                    (
                        gregs[libc::REG_RSP as usize] as usize,
                        gregs[libc::REG_RBP as usize] as usize,
                    )
                }
            }

            pub(super) unsafe fn write(uctx: *mut c_void, sp: usize, fp: usize) {
                // Safety: the kernel passes a valid ucontext_t.
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    (*uc).uc_mcontext.gregs[libc::REG_RSP as usize] = sp as i64;
                    (*uc).uc_mcontext.gregs[libc::REG_RBP as usize] = fp as i64;
                }
            }
        } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
            pub(super) unsafe fn read(uctx: *mut c_void) -> (usize, usize) {
                // Safety: the kernel passes a valid ucontext_t.
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    (
                        (*uc).uc_mcontext.sp as usize,
                        (*uc).uc_mcontext.regs[29] as usize,
                    )
                }
            }

            pub(super) unsafe fn write(uctx: *mut c_void, sp: usize, fp: usize) {
                // Safety: the kernel passes a valid ucontext_t.
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    (*uc).uc_mcontext.sp = sp as u64;
                    (*uc).uc_mcontext.regs[29] = fp as u64;
                }
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
            pub(super) unsafe fn read(uctx: *mut c_void) -> (usize, usize) {
                // Safety: the kernel passes a valid ucontext_t whose
                // mcontext pointer is live for the handler's duration.
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    let ss = &(*(*uc).uc_mcontext).__ss;
                    (ss.__rsp as usize, ss.__rbp as usize)
                }
            }

            pub(super) unsafe fn write(uctx: *mut c_void, sp: usize, fp: usize) {
                // Safety: see read().
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    let ss = &mut (*(*uc).uc_mcontext).__ss;
                    ss.__rsp = sp as u64;
                    ss.__rbp = fp as u64;
                }
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
            pub(super) unsafe fn read(uctx: *mut c_void) -> (usize, usize) {
                // Safety: the kernel passes a valid ucontext_t whose
                // mcontext pointer is live for the handler's duration.
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    let ss = &(*(*uc).uc_mcontext).__ss;
                    (ss.__sp as usize, ss.__fp as usize)
                }
            }

            pub(super) unsafe fn write(uctx: *mut c_void, sp: usize, fp: usize) {
                // Safety: see read().
                unsafe {
                    let uc = uctx.cast::<libc::ucontext_t>();
                    let ss = &mut (*(*uc).uc_mcontext).__ss;
                    ss.__sp = sp as u64;
                    ss.__fp = fp as u64;
                }
            }
        } else {
            compile_error!("guard-page recovery is not implemented for this platform");
        }
    }
}
