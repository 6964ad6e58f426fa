// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-ABI register reads: extracting the frame pointer and program counter
//! a stack walk starts from.

use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;

/// Reads `(fp, pc)` for `thread`, or `None` if the kernel refuses the
/// register read (the thread may already be gone).
#[cfg(target_arch = "aarch64")]
pub(crate) fn read_frame_pointers(thread: thread_act_t) -> Option<(u64, u64)> {
    use mach2::structs::arm_thread_state64_t;
    use mach2::thread_status::ARM_THREAD_STATE64;

    let mut state = arm_thread_state64_t::new();
    let mut count = arm_thread_state64_t::count();
    // SAFETY: state/count are valid out-parameters of the matching flavor.
    let kr = unsafe {
        mach2::thread_act::thread_get_state(
            thread,
            ARM_THREAD_STATE64,
            (&mut state) as *mut _ as *mut _,
            &mut count,
        )
    };
    (kr == KERN_SUCCESS).then_some((state.__fp, state.__pc))
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn read_frame_pointers(thread: thread_act_t) -> Option<(u64, u64)> {
    use mach2::structs::x86_thread_state64_t;
    use mach2::thread_status::x86_THREAD_STATE64;

    let mut state = x86_thread_state64_t::new();
    let mut count = x86_thread_state64_t::count();
    // SAFETY: state/count are valid out-parameters of the matching flavor.
    let kr = unsafe {
        mach2::thread_act::thread_get_state(
            thread,
            x86_THREAD_STATE64,
            (&mut state) as *mut _ as *mut _,
            &mut count,
        )
    };
    (kr == KERN_SUCCESS).then_some((state.__rbp, state.__rip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::is_valid_userspace_addr;

    #[test]
    fn reads_registers_of_a_live_thread() {
        let pair = std::sync::Arc::new((
            std::sync::Mutex::new(0u32),
            std::sync::Condvar::new(),
        ));
        let pair2 = std::sync::Arc::clone(&pair);
        let worker = std::thread::spawn(move || {
            let port = unsafe { libc::pthread_mach_thread_np(libc::pthread_self()) };
            *pair2.0.lock().unwrap() = port;
            pair2.1.notify_one();
            std::thread::sleep(std::time::Duration::from_millis(200));
        });

        let port = {
            let mut guard = pair.0.lock().unwrap();
            while *guard == 0 {
                guard = pair.1.wait(guard).unwrap();
            }
            *guard
        };

        let (fp, pc) = read_frame_pointers(port).expect("register read");
        assert!(is_valid_userspace_addr(pc));
        // A parked thread has a conventional frame chain.
        assert!(fp != 0);
        worker.join().unwrap();
    }
}
