// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scoped thread suspension and the frame-pointer unwind that runs inside
//! it.
//!
//! The suspended thread may hold the allocator lock, a pthread lock, or a
//! dyld lock. Everything reachable from [`SuspendedThread::walk_stack`]
//! must therefore be allocation-free, lock-free, and syscall-free; the
//! guard's only other operation is the unconditional resume in its `Drop`.

use crate::memory::{is_valid_frame_pointer, is_valid_userspace_addr, read_frame_record};
use crate::types::StackFrame;
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;

/// Owns a suspended thread. Dropping the guard resumes the thread on every
/// path.
pub(crate) struct SuspendedThread {
    thread: thread_act_t,
}

impl SuspendedThread {
    /// Suspends `thread`, or returns `None` if the kernel refuses (the
    /// capture is dropped in that case).
    pub(crate) fn suspend(thread: thread_act_t) -> Option<Self> {
        // SAFETY: thread is a live thread port from task_threads or a
        // pthread lookup; a stale port fails with an error code.
        let kr = unsafe { mach2::thread_act::thread_suspend(thread) };
        (kr == KERN_SUCCESS).then_some(Self { thread })
    }

    /// Walks the frame-pointer chain starting at `(fp, pc)`, appending one
    /// frame per step, leaf first.
    ///
    /// `frames` must have capacity for `max_depth` entries so pushes cannot
    /// allocate while the victim is suspended. The walk stops at the first
    /// invalid frame pointer, unreadable frame record, out-of-range return
    /// address, or at `max_depth`.
    pub(crate) fn walk_stack(
        &self,
        frames: &mut Vec<StackFrame>,
        mut fp: u64,
        mut pc: u64,
        max_depth: usize,
    ) {
        debug_assert!(frames.capacity() >= max_depth);

        while frames.len() < max_depth && pc != 0 {
            frames.push(StackFrame::new(pc));

            if !is_valid_frame_pointer(fp) {
                break;
            }
            let Some([next_fp, next_pc]) = read_frame_record(fp) else {
                break;
            };
            if !is_valid_userspace_addr(next_pc) {
                break;
            }
            fp = next_fp;
            pc = next_pc;
        }
    }
}

impl Drop for SuspendedThread {
    fn drop(&mut self) {
        // SAFETY: resuming is unconditional; a failure here means the
        // thread died while suspended and there is nothing left to resume.
        unsafe { mach2::thread_act::thread_resume(self.thread) };
    }
}
