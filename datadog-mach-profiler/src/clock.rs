// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Clock sources. Trace timestamps use the raw monotonic uptime clock so
//! they survive wall-clock adjustments; the aggregator converts them to
//! epoch time with an offset computed once at construction.

// Not exported by the libc crate.
#[cfg(target_os = "macos")]
extern "C" {
    fn clock_gettime_nsec_np(clock_id: libc::clockid_t) -> u64;
}

/// Monotonic uptime in nanoseconds.
#[cfg(target_os = "macos")]
pub(crate) fn monotonic_ns() -> u64 {
    // SAFETY: no preconditions; CLOCK_UPTIME_RAW is always available.
    unsafe { clock_gettime_nsec_np(libc::CLOCK_UPTIME_RAW) }
}

#[cfg(all(unix, not(target_os = "macos")))]
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
pub(crate) fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Wall-clock time in nanoseconds since the Unix epoch.
pub(crate) fn wall_clock_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

/// Offset to add to a monotonic uptime reading to express it in wall-clock
/// epoch nanoseconds. Computed from one paired reading of both clocks.
pub(crate) fn uptime_epoch_offset_ns() -> i64 {
    let uptime_ns = monotonic_ns();
    wall_clock_ns() - uptime_ns as i64
}
