// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread identity: mapping a Mach thread port back to its pthread to read
//! the thread name. The process main thread is registered once and always
//! reported under the canonical Apple name, since the main thread usually
//! has no pthread name set.

use mach2::mach_types::thread_act_t;
use std::ffi::CStr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

/// Apple's conventional label for the process main thread.
pub const MAIN_THREAD_NAME: &str = "com.apple.main-thread";

/// Apple does not publish the pthread name length limit; 64 bytes is enough
/// in practice and longer names truncate.
const THREAD_NAME_MAX: usize = 64;

static MAIN_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Records the calling thread as the process main thread. Call early, from
/// the main thread; typically done by the auto-start bootstrap.
pub fn set_main_thread() {
    // SAFETY: no preconditions.
    let me = unsafe { libc::pthread_self() };
    MAIN_THREAD.store(me as usize, SeqCst);
}

/// Best-effort thread name for a Mach thread port. Returns `None` for
/// threads without a pthread, without a name, or whose pthread is already
/// gone. Must not be called while any thread is suspended.
pub(crate) fn thread_name(thread: thread_act_t) -> Option<String> {
    // SAFETY: a stale or non-pthread port yields null, handled below.
    let pthread = unsafe { libc::pthread_from_mach_thread_np(thread) };
    if pthread == 0 {
        return None;
    }
    if pthread as usize == MAIN_THREAD.load(SeqCst) {
        return Some(MAIN_THREAD_NAME.to_string());
    }

    let mut buf = [0 as libc::c_char; THREAD_NAME_MAX];
    // SAFETY: buf outlives the call and the length matches.
    let rc = unsafe { pthread_getname_np(pthread, buf.as_mut_ptr(), THREAD_NAME_MAX) };
    if rc != 0 {
        return None;
    }
    // SAFETY: pthread_getname_np NUL-terminates within the buffer.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    if name.is_empty() {
        return None;
    }
    Some(name.to_string_lossy().into_owned())
}
