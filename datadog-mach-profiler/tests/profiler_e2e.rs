// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios driving the whole pipeline: gating, sampling real
//! threads, resolution, aggregation, and pprof encoding.

#![cfg(target_os = "macos")]

use datadog_mach_profiler::profile::pprof;
use datadog_mach_profiler::profile::{Profile, StringId};
use datadog_mach_profiler::{MachProfiler, SamplingConfig};
use prost::Message;
use std::hint::black_box;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Profiling sessions observe the whole process, so concurrently running
/// scenarios would sample each other's worker threads. Serialize them.
static SESSION_LOCK: Mutex<()> = Mutex::new(());

fn session_lock() -> MutexGuard<'static, ()> {
    SESSION_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recognizable recursive workload: five frames of `recurse` sit on the
/// stack while the leaf busy-loops.
#[inline(never)]
fn recurse(depth: u32, deadline: Instant) -> u64 {
    if depth > 1 {
        return black_box(recurse(depth - 1, deadline) + 1);
    }
    // Check the clock rarely so nearly all leaf time is spent in this
    // binary's code rather than in the clock syscall.
    let mut acc: u64 = 0;
    loop {
        for _ in 0..50_000 {
            acc = black_box(
                acc.wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407),
            );
        }
        if Instant::now() >= deadline {
            return black_box(acc);
        }
    }
}

fn spawn_busy_worker(name: &str, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<u64> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut acc: u64 = 0;
            while !stop.load(SeqCst) {
                acc = black_box(acc.wrapping_add(0x9E3779B97F4A7C15));
            }
            acc
        })
        .expect("spawn busy worker")
}

fn label_str<'a>(profile: &'a Profile, id: StringId) -> &'a str {
    profile.strings().get(id).unwrap_or("")
}

/// Labels of one sample, keyed by their key string.
fn find_label(
    profile: &Profile,
    sample: &datadog_mach_profiler::profile::Sample,
    key: &str,
) -> Option<datadog_mach_profiler::profile::Label> {
    sample
        .labels
        .iter()
        .find(|label| label_str(profile, label.key) == key)
        .copied()
}

#[test]
fn sampled_out_start_produces_no_profile() {
    let mut profiler = MachProfiler::with_timeout(0.0, false, 500_000_000);
    profiler.start();
    assert_eq!(
        profiler.status(),
        datadog_mach_profiler::ProfilerStatus::SampledOut
    );
    assert!(profiler.get_profile(false).is_none());
}

#[test]
fn prewarmed_start_wins_over_sample_rate() {
    let mut profiler = MachProfiler::with_timeout(100.0, true, 500_000_000);
    profiler.start();
    assert_eq!(
        profiler.status(),
        datadog_mach_profiler::ProfilerStatus::Prewarmed
    );
    assert!(profiler.get_profile(false).is_none());
}

#[test]
fn single_thread_sampling_captures_the_recursion() {
    let _guard = session_lock();
    let mut profiler = MachProfiler::with_timeout(100.0, false, 10_000_000_000);
    profiler.set_sampling_config(SamplingConfig {
        sampling_interval_ns: 10_000_000,
        profile_current_thread_only: true,
        ..SamplingConfig::default()
    });
    profiler.start();
    assert_eq!(
        profiler.status(),
        datadog_mach_profiler::ProfilerStatus::Running
    );

    // Keep this thread busy in a five-deep recursion while it is sampled.
    let _ = recurse(5, Instant::now() + Duration::from_millis(700));

    profiler.stop();
    let profile = profiler.get_profile(true).expect("profile");

    assert_eq!(profile.sampling_interval_ns(), 10_000_000);
    assert!(
        profile.samples().len() >= 30,
        "expected a steady sample stream, got {}",
        profile.samples().len()
    );

    // Identify the test binary's mapping through the recursion's address,
    // then check the samples taken inside the recursion: leaf in the test
    // binary, at least five frames deep. A few boundary samples land in
    // system code while the thread enters or leaves the workload.
    let recurse_addr = recurse as usize as u64;
    let test_binary_mapping = profile
        .mappings()
        .enumerate()
        .filter(|(_, mapping)| mapping.memory_start <= recurse_addr)
        .max_by_key(|(_, mapping)| mapping.memory_start)
        .map(|(index, _)| index as u32 + 1)
        .expect("the test binary should be mapped");

    let location_mapping: std::collections::HashMap<u32, u32> = profile
        .locations()
        .enumerate()
        .map(|(index, location)| (index as u32 + 1, location.mapping_id))
        .collect();

    let in_workload = profile
        .samples()
        .iter()
        .filter(|sample| location_mapping[&sample.location_ids[0]] == test_binary_mapping)
        .collect::<Vec<_>>();
    assert!(
        in_workload.len() >= 30,
        "most samples should land in the busy recursion, got {}",
        in_workload.len()
    );
    for sample in in_workload {
        assert!(
            sample.location_ids.len() >= 5,
            "recursion should be at least five frames deep, got {}",
            sample.location_ids.len()
        );
    }

    // The encoded profile carries the configured period.
    let bytes = pprof::serialize(&profile).expect("serialize");
    let decoded = pprof::Profile::decode(bytes.as_slice()).expect("decode");
    assert_eq!(decoded.period, 10_000_000);
}

#[test]
fn multi_thread_sampling_tags_distinct_threads() {
    let _guard = session_lock();
    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..3)
        .map(|i| spawn_busy_worker(&format!("busy-worker-{i}"), Arc::clone(&stop)))
        .collect();

    let mut profiler = MachProfiler::with_timeout(100.0, false, 10_000_000_000);
    profiler.set_sampling_config(SamplingConfig {
        sampling_interval_ns: 5_000_000,
        max_thread_count: 100,
        ..SamplingConfig::default()
    });
    profiler.start();
    std::thread::sleep(Duration::from_millis(200));
    profiler.stop();
    stop.store(true, SeqCst);
    for worker in workers {
        worker.join().expect("worker");
    }

    let profile = profiler.get_profile(true).expect("profile");
    assert!(!profile.samples().is_empty());

    let mut thread_ids = std::collections::HashSet::new();
    for sample in profile.samples() {
        let tid = find_label(&profile, sample, "thread id").expect("thread id label");
        thread_ids.insert(tid.num);

        // Neither the sampler nor the resolver may sample itself.
        if let Some(name) = find_label(&profile, sample, "thread name") {
            let name = label_str(&profile, name.str);
            assert_ne!(name, "com.datadoghq.profiler.sampling");
            assert_ne!(name, "com.datadoghq.profiler.resolver");
        }
    }
    assert!(
        thread_ids.len() >= 3,
        "expected at least the three busy workers, got {thread_ids:?}"
    );
}

#[test]
fn timeout_stops_sampling_but_keeps_the_profile() {
    let _guard = session_lock();
    let stop = Arc::new(AtomicBool::new(false));
    let worker = spawn_busy_worker("timeout-busy", Arc::clone(&stop));

    let mut profiler = MachProfiler::with_timeout(100.0, false, 100_000_000);
    profiler.set_sampling_config(SamplingConfig {
        sampling_interval_ns: 5_000_000,
        // Flush every cycle so the duration check runs continuously.
        max_buffer_size: 1,
        ..SamplingConfig::default()
    });
    profiler.start();
    std::thread::sleep(Duration::from_millis(400));

    assert_eq!(
        profiler.status(),
        datadog_mach_profiler::ProfilerStatus::Timeout
    );

    let profile = profiler.get_profile(false).expect("profile");
    assert!(!profile.samples().is_empty());
    assert!(
        profile.duration_ns() >= 100_000_000,
        "observed duration {} should reach the timeout",
        profile.duration_ns()
    );

    stop.store(true, SeqCst);
    worker.join().expect("worker");
}

#[test]
fn cleanup_profiles_are_disjoint_and_well_formed() {
    let _guard = session_lock();
    let stop = Arc::new(AtomicBool::new(false));
    let worker = spawn_busy_worker("cleanup-busy", Arc::clone(&stop));

    let mut profiler = MachProfiler::with_timeout(100.0, false, 60_000_000_000);
    profiler.set_sampling_config(SamplingConfig {
        sampling_interval_ns: 5_000_000,
        ..SamplingConfig::default()
    });
    profiler.start();

    std::thread::sleep(Duration::from_millis(150));
    let first = profiler.get_profile(true).expect("first profile");
    std::thread::sleep(Duration::from_millis(150));
    profiler.stop();
    let second = profiler.get_profile(true).expect("second profile");

    stop.store(true, SeqCst);
    worker.join().expect("worker");

    assert!(!first.samples().is_empty());
    assert!(!second.samples().is_empty());
    // Each capture lands in exactly one segment. Timestamps reflect that:
    // the second segment starts no earlier than one sampling cycle before
    // the first one ends (a capture can straddle the drain point).
    assert!(
        second.start_timestamp_ns() + 5_000_000 >= first.end_timestamp_ns(),
        "segments should not overlap: first ends {}, second starts {}",
        first.end_timestamp_ns(),
        second.start_timestamp_ns()
    );

    for profile in [&first, &second] {
        assert_eq!(profile.strings().get(StringId::ZERO), Some(""));
        let bytes = pprof::serialize(profile).expect("serialize");
        let decoded = pprof::Profile::decode(bytes.as_slice()).expect("decode");
        assert_eq!(decoded.samples.len(), profile.samples().len());
        // Every referenced location id is present.
        let max_location = decoded.locations.len() as u64;
        for sample in &decoded.samples {
            for &id in &sample.location_ids {
                assert!(id >= 1 && id <= max_location);
            }
        }
    }
}
