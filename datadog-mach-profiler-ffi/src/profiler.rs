// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide profiler handle.

use crate::byte_buffer::EncodedProfile;
use crate::status::ProfilerStatus;
use datadog_mach_profiler::profiler::is_active_prewarm;
use datadog_mach_profiler::sampler::set_main_thread;
use datadog_mach_profiler::MachProfiler;
use std::sync::{Mutex, PoisonError};

static PROFILER: Mutex<Option<MachProfiler>> = Mutex::new(None);

fn with_profiler<R>(f: impl FnOnce(&mut Option<MachProfiler>) -> R) -> R {
    let mut guard = PROFILER.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Creates the process profiler and starts it, evaluating the gates
/// (ThreadSanitizer, `ActivePrewarm`, the sample-rate draw). Does nothing
/// if a profiler already exists.
///
/// Call from the main thread, as early in the process lifetime as
/// possible, so the main thread is labeled correctly in profiles.
///
/// `sample_rate` is a percentage in `[0, 100]`; `is_prewarming` should be
/// set when the host already knows the launch is a pre-warm (the
/// `ActivePrewarm` environment variable is honored either way).
#[no_mangle]
pub extern "C" fn ddog_prof_Profiler_start(sample_rate: f64, is_prewarming: bool) {
    set_main_thread();
    with_profiler(|slot| {
        if slot.is_some() {
            return;
        }
        let mut profiler = MachProfiler::new(sample_rate, is_prewarming || is_active_prewarm());
        profiler.start();
        *slot = Some(profiler);
    });
}

/// Testing hook: tears down any existing profiler and starts a fresh one
/// with an explicit timeout, bypassing preference reads.
#[no_mangle]
pub extern "C" fn ddog_prof_Profiler_start_testing(
    sample_rate: f64,
    is_prewarming: bool,
    timeout_ns: u64,
) {
    set_main_thread();
    with_profiler(|slot| {
        // Drop (and fully tear down) any previous instance first.
        *slot = None;
        let mut profiler = MachProfiler::with_timeout(sample_rate, is_prewarming, timeout_ns);
        profiler.start();
        *slot = Some(profiler);
    });
}

/// Stops sampling. Safe to call repeatedly, or without a profiler.
#[no_mangle]
pub extern "C" fn ddog_prof_Profiler_stop() {
    with_profiler(|slot| {
        if let Some(profiler) = slot.as_mut() {
            profiler.stop();
        }
    });
}

/// Current lifecycle status; `NotCreated` when no profiler exists.
#[no_mangle]
pub extern "C" fn ddog_prof_Profiler_get_status() -> ProfilerStatus {
    with_profiler(|slot| match slot.as_ref() {
        Some(profiler) => ProfilerStatus::from(profiler.status()),
        None => ProfilerStatus::NotCreated,
    })
}

/// Flushes and drains the pipeline, then returns the aggregated profile
/// serialized as a pprof buffer. With `cleanup`, the profiler starts a
/// fresh aggregate and the returned buffer owns everything collected so
/// far; consecutive cleanup calls therefore yield disjoint profiles.
///
/// Returns an empty buffer when no profiler exists or nothing was
/// collected. Free the result with [`ddog_prof_EncodedProfile_drop`].
///
/// [`ddog_prof_EncodedProfile_drop`]: crate::byte_buffer::ddog_prof_EncodedProfile_drop
#[no_mangle]
pub extern "C" fn ddog_prof_Profiler_get_profile(cleanup: bool) -> EncodedProfile {
    with_profiler(|slot| {
        let Some(profiler) = slot.as_ref() else {
            return EncodedProfile::empty();
        };
        match profiler.get_profile_bytes(cleanup) {
            Some(bytes) => EncodedProfile::from(bytes),
            None => EncodedProfile::empty(),
        }
    })
}

/// Destroys the profiler, stopping sampling and joining the worker
/// threads. Safe to call repeatedly.
#[no_mangle]
pub extern "C" fn ddog_prof_Profiler_destroy() {
    with_profiler(|slot| {
        *slot = None;
    });
}
