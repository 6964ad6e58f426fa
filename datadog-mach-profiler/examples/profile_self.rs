// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Profiles this process for one second and writes the pprof buffer to a
//! file. Run with `cargo run --example profile_self -- /tmp/self.pprof`.

#[cfg(target_os = "macos")]
fn main() {
    use datadog_mach_profiler::profile::pprof;
    use datadog_mach_profiler::sampler::set_main_thread;
    use datadog_mach_profiler::MachProfiler;
    use std::hint::black_box;
    use std::time::{Duration, Instant};

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "self.pprof".to_string());

    set_main_thread();
    let mut profiler = MachProfiler::new(100.0, false);
    profiler.start();
    assert_eq!(
        profiler.status(),
        datadog_mach_profiler::ProfilerStatus::Running
    );

    // Something to look at in the flame graph.
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut acc: u64 = 0;
    while Instant::now() < deadline {
        for i in 0..100_000u64 {
            acc = black_box(acc.wrapping_add(i.rotate_left(7)));
        }
    }
    black_box(acc);

    profiler.stop();
    let profile = profiler.get_profile(true).expect("profile");
    println!(
        "captured {} samples, {} locations, {} mappings",
        profile.samples().len(),
        profile.location_count(),
        profile.mapping_count(),
    );

    let bytes = pprof::serialize(&profile).expect("serialize");
    std::fs::write(&path, &bytes).expect("write profile");
    println!("wrote {} bytes to {path}", bytes.len());
}

#[cfg(not(target_os = "macos"))]
fn main() {
    eprintln!("the sampling profiler only runs on macOS");
}
