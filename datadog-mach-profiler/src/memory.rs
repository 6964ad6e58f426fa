// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal-guarded memory reads for stack walking.
//!
//! The unwinder chases frame pointers through another thread's stack, so any
//! dereference can fault. [`safe_read`] turns SIGBUS/SIGSEGV raised on the
//! reading thread into an ordinary `false` return: the process-wide handlers
//! installed by [`install_handlers`] check a thread-local "in safe read"
//! flag and perform a non-local return to a pre-armed thread-local jump
//! buffer. Faults raised outside a safe read are chained to whatever handler
//! was installed before ours, so other signal consumers keep working.

use libc::{c_int, c_void, siginfo_t};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, Signal};
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;

/// Lowest address considered user space. The first page is never mapped, so
/// anything below this is a null-ish pointer.
pub const MIN_USERSPACE_ADDR: u64 = 0x1000;

/// Highest address considered user space on 64-bit ARM64/x86_64 Apple
/// platforms; the range above is reserved for the kernel.
pub const MAX_USERSPACE_ADDR: u64 = 0x7FFF_FFFF_F000;

const FRAME_POINTER_ALIGN_MASK: u64 = 0x7;

/// Whether `addr` is within reasonable user-space bounds.
#[inline]
pub fn is_valid_userspace_addr(addr: u64) -> bool {
    (MIN_USERSPACE_ADDR..=MAX_USERSPACE_ADDR).contains(&addr)
}

/// Whether `fp` can be dereferenced as a frame record: user-space and
/// 8-byte aligned.
#[inline]
pub fn is_valid_frame_pointer(fp: u64) -> bool {
    is_valid_userspace_addr(fp) && fp & FRAME_POINTER_ALIGN_MASK == 0
}

// Darwin's sigjmp_buf is `int[_JBLEN + 1]`; _JBLEN differs per arch. The
// libc crate does not export the setjmp family, so declare the pieces we
// need against libSystem directly.
#[cfg(target_arch = "aarch64")]
const JBLEN: usize = 48;
#[cfg(target_arch = "x86_64")]
const JBLEN: usize = 37;

#[repr(C)]
struct SigJmpBuf([c_int; JBLEN + 1]);

impl SigJmpBuf {
    const fn new() -> Self {
        Self([0; JBLEN + 1])
    }
}

extern "C" {
    fn sigsetjmp(env: *mut SigJmpBuf, savemask: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

thread_local! {
    /// Set for the duration of the guarded copy in [`safe_read`].
    static IN_SAFE_READ: Cell<bool> = const { Cell::new(false) };

    /// Jump target armed by [`safe_read`] before it touches memory.
    static JUMP_BUFFER: UnsafeCell<SigJmpBuf> = const { UnsafeCell::new(SigJmpBuf::new()) };
}

// Handlers saved at install time so faults outside a safe read chain
// through. OnceLock reads are plain atomic loads, fine from a handler.
static PREV_SIGBUS: OnceLock<SigAction> = OnceLock::new();
static PREV_SIGSEGV: OnceLock<SigAction> = OnceLock::new();
static INSTALL_STARTED: AtomicBool = AtomicBool::new(false);
static INSTALL_FINISHED: AtomicBool = AtomicBool::new(false);

extern "C" fn fault_handler(signum: c_int, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let in_safe_read = IN_SAFE_READ.try_with(Cell::get).unwrap_or(false);
    if in_safe_read {
        if let Ok(env) = JUMP_BUFFER.try_with(UnsafeCell::get) {
            // SAFETY: the buffer was armed by sigsetjmp in safe_read on
            // this same thread, and the arming frame is still live because
            // the flag is only set between arming and the end of the
            // guarded copy.
            unsafe { siglongjmp(env, 1) };
        }
    }
    // SAFETY: fault did not come from a safe read; hand it to the previous
    // handler exactly as it was registered.
    unsafe { chain_previous_handler(signum, sig_info, ucontext) };
}

/// Chains to the handler that was registered before ours, honoring its
/// registration style: siginfo actions get all three arguments, a default
/// disposition is reinstalled and the signal re-raised, ignore suppresses,
/// and plain handlers get the signal number only.
unsafe fn chain_previous_handler(signum: c_int, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let prev = if signum == libc::SIGBUS {
        PREV_SIGBUS.get()
    } else {
        PREV_SIGSEGV.get()
    };

    let Some(prev) = prev.filter(|_| INSTALL_FINISHED.load(SeqCst)) else {
        // Fault raced handler installation. Fall back to the default
        // disposition so the process does not spin on the faulting
        // instruction.
        restore_default_and_raise(signum);
        return;
    };

    match prev.handler() {
        SigHandler::SigDfl => restore_default_and_raise(signum),
        SigHandler::SigIgn => (),
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
}

unsafe fn restore_default_and_raise(signum: c_int) {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), signal::SigSet::empty());
    if let Ok(sig) = Signal::try_from(signum) {
        let _ = signal::sigaction(sig, &action);
    }
    libc::raise(signum);
}

/// Installs the SIGBUS/SIGSEGV handlers that make [`safe_read`]
/// recoverable, saving whatever handlers were registered before.
///
/// Idempotent; only the first call installs anything. The handlers stay for
/// the life of the process.
pub fn install_handlers() -> anyhow::Result<()> {
    if INSTALL_STARTED.swap(true, SeqCst) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::SigAction(fault_handler),
        SaFlags::SA_SIGINFO,
        signal::SigSet::empty(),
    );

    // SAFETY: fault_handler only calls async-signal-safe functions
    // (siglongjmp, sigaction, raise) and lock-free atomics.
    let prev_bus = unsafe { signal::sigaction(Signal::SIGBUS, &action) }?;
    let prev_segv = unsafe { signal::sigaction(Signal::SIGSEGV, &action) }?;
    let _ = PREV_SIGBUS.set(prev_bus);
    let _ = PREV_SIGSEGV.set(prev_segv);
    INSTALL_FINISHED.store(true, SeqCst);
    Ok(())
}

/// Copies `out.len()` bytes from `addr` into `out`.
///
/// Returns `true` iff the full range was copied. Any SIGBUS/SIGSEGV raised
/// by the copy aborts it and returns `false`; no partial-read retry is
/// attempted. Requires [`install_handlers`] to have run.
///
/// Allocation-free, so it is legal inside the sampler's suspend window.
pub fn safe_read(addr: u64, out: &mut [u8]) -> bool {
    let len = out.len() as u64;
    if len == 0 {
        return true;
    }
    if !is_valid_userspace_addr(addr) || !is_valid_userspace_addr(addr + len - 1) {
        return false;
    }

    let env = JUMP_BUFFER.with(UnsafeCell::get);
    // SAFETY: sigsetjmp/siglongjmp form a matched pair on this thread, and
    // no droppable state lives between arming and the longjmp target. The
    // copy itself may fault; that is the point, and the handler recovers.
    unsafe {
        if sigsetjmp(env, 1) == 0 {
            IN_SAFE_READ.set(true);
            std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), out.len());
            IN_SAFE_READ.set(false);
            true
        } else {
            // Landed here from the fault handler's siglongjmp.
            IN_SAFE_READ.set(false);
            false
        }
    }
}

/// Reads one frame record (`[next_fp, return_addr]`) at `fp`.
#[inline]
pub(crate) fn read_frame_record(fp: u64) -> Option<[u64; 2]> {
    let mut bytes = [0u8; 16];
    if !safe_read(fp, &mut bytes) {
        return None;
    }
    let next_fp = u64::from_ne_bytes(bytes[..8].try_into().ok()?);
    let next_pc = u64::from_ne_bytes(bytes[8..].try_into().ok()?);
    Some([next_fp, next_pc])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation_bounds() {
        assert!(!is_valid_userspace_addr(0));
        assert!(!is_valid_userspace_addr(0xFFF));
        assert!(is_valid_userspace_addr(0x1000));
        assert!(is_valid_userspace_addr(MAX_USERSPACE_ADDR));
        assert!(!is_valid_userspace_addr(MAX_USERSPACE_ADDR + 1));
        assert!(!is_valid_userspace_addr(u64::MAX));
    }

    #[test]
    fn frame_pointer_requires_alignment() {
        assert!(is_valid_frame_pointer(0x1000));
        assert!(!is_valid_frame_pointer(0x1004));
        assert!(!is_valid_frame_pointer(0x1001));
        assert!(!is_valid_frame_pointer(0x8));
    }

    #[test]
    fn install_is_idempotent() {
        install_handlers().unwrap();
        install_handlers().unwrap();
    }

    #[test]
    fn reads_valid_memory() {
        install_handlers().unwrap();
        let src: [u8; 16] = [7; 16];
        let mut dst = [0u8; 16];
        assert!(safe_read(src.as_ptr() as u64, &mut dst));
        assert_eq!(src, dst);
    }

    #[test]
    fn rejects_out_of_range_without_touching_memory() {
        install_handlers().unwrap();
        let mut dst = [0u8; 8];
        assert!(!safe_read(0x10, &mut dst));
        assert!(!safe_read(u64::MAX - 4, &mut dst));
    }

    #[test]
    fn survives_fault_on_unmapped_address() {
        install_handlers().unwrap();
        let mut dst = [0u8; 8];
        // In range, but almost certainly unmapped.
        assert!(!safe_read(0xDEAD_BEEF, &mut dst));
        // The process is still alive and can read valid memory again.
        let src = 42u64.to_ne_bytes();
        assert!(safe_read(src.as_ptr() as u64, &mut dst));
        assert_eq!(dst, src);
    }

    #[test]
    fn read_frame_record_round_trip() {
        install_handlers().unwrap();
        let record: [u64; 2] = [0xAAAA_BBBB, 0xCCCC_DDDD];
        let got = read_frame_record(record.as_ptr() as u64).unwrap();
        assert_eq!(got, record);
    }
}
