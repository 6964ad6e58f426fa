// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Profiler lifecycle: gating, start/stop, the flushing contract, and the
//! status state machine.
//!
//! ```text
//!                 ┌───── gate fails ─────→ PREWARMED | SAMPLED_OUT | NOT_STARTED
//! NOT_STARTED ────┤
//!                 └───── start() ok ─────→ RUNNING ──stop()──→ STOPPED
//!                                             │
//!                                             └── timeout ──→ TIMEOUT
//! ```
//!
//! `ALLOCATION_FAILED` and `ALREADY_STARTED` are terminal error states.

#[cfg(target_os = "macos")]
mod resolver;

use std::env;

/// Profiler lifecycle status, as reported to hosts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProfilerStatus {
    /// Never started (gated off by ThreadSanitizer, or not yet started).
    NotStarted,
    Running,
    /// Stopped by the host.
    Stopped,
    /// Stopped because the observed profile duration hit the timeout.
    Timeout,
    /// Not started: the process was launched by OS pre-warming, so samples
    /// would not correspond to user-initiated activity.
    Prewarmed,
    /// Not started: the probabilistic sample-rate draw failed.
    SampledOut,
    /// Startup failed while building the pipeline.
    AllocationFailed,
    /// Start was requested while a session was already running.
    AlreadyStarted,
}

/// Whether the process was launched by OS pre-warming.
pub fn is_active_prewarm() -> bool {
    env::var("ActivePrewarm").is_ok_and(|v| v == "1")
}

/// Probabilistic sampling decision for a rate in percent. Rates at or
/// below 0 never start; rates at or above 100 always do. The draw uses the
/// thread-local RNG, freshly seeded by the OS, so constructing several
/// profilers in quick succession draws independently.
pub fn sample_within_rate(sample_rate: f64) -> bool {
    if sample_rate <= 0.0 {
        return false;
    }
    if sample_rate >= 100.0 {
        return true;
    }
    use rand::Rng;
    rand::thread_rng().gen_range(0.0..100.0) < sample_rate
}

/// Whether the ThreadSanitizer runtime is linked into this process and
/// configured in a way that would halt on the data races that thread
/// suspension inherently looks like. `TSAN_OPTIONS` containing both
/// `halt_on_error=0` and `report_bugs=0` makes TSan tolerable.
pub fn thread_sanitizer_active() -> bool {
    if !tsan_runtime_linked() {
        return false;
    }
    match env::var("TSAN_OPTIONS") {
        Ok(options) => {
            !(options.contains("halt_on_error=0") && options.contains("report_bugs=0"))
        }
        Err(_) => true,
    }
}

#[cfg(unix)]
fn tsan_runtime_linked() -> bool {
    // SAFETY: dlsym with RTLD_DEFAULT only probes the symbol table.
    !unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"__tsan_init".as_ptr()) }.is_null()
}

#[cfg(not(unix))]
fn tsan_runtime_linked() -> bool {
    false
}

#[cfg(target_os = "macos")]
pub use macos::MachProfiler;

#[cfg(target_os = "macos")]
mod macos {
    use super::resolver::Resolver;
    use super::{sample_within_rate, thread_sanitizer_active, ProfilerStatus};
    use crate::images::ImageCache;
    use crate::profile::{pprof, Profile};
    use crate::sampler::{Sampler, SamplingConfig, TraceSink};
    use std::sync::{Arc, Mutex, PoisonError, Weak};

    /// Default cap on the observed profile duration: one minute of samples.
    pub const DEFAULT_TIMEOUT_NS: u64 = 60_000_000_000;

    struct Session {
        sampler: Arc<Sampler>,
        resolver: Arc<Resolver>,
        // Kept alive for the session; the resolver holds its own Arc.
        _image_cache: Option<Arc<ImageCache>>,
    }

    /// The profiler orchestrator: owns the sampler, the resolver worker,
    /// and the image cache, and tracks lifecycle status.
    pub struct MachProfiler {
        sample_rate: f64,
        is_prewarming: bool,
        timeout_ns: u64,
        sampling_config: SamplingConfig,
        status: Arc<Mutex<ProfilerStatus>>,
        session: Option<Session>,
    }

    impl MachProfiler {
        pub fn new(sample_rate: f64, is_prewarming: bool) -> Self {
            Self::with_timeout(sample_rate, is_prewarming, DEFAULT_TIMEOUT_NS)
        }

        pub fn with_timeout(sample_rate: f64, is_prewarming: bool, timeout_ns: u64) -> Self {
            Self {
                sample_rate,
                is_prewarming,
                timeout_ns,
                sampling_config: SamplingConfig::default(),
                status: Arc::new(Mutex::new(ProfilerStatus::NotStarted)),
                session: None,
            }
        }

        /// Overrides the sampler configuration for the next `start`. The
        /// resolver exclusion is applied on top of whatever is set here.
        pub fn set_sampling_config(&mut self, config: SamplingConfig) {
            self.sampling_config = config;
        }

        pub fn status(&self) -> ProfilerStatus {
            *self.status.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn set_status(&self, status: ProfilerStatus) {
            *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        }

        /// Evaluates the gates and, if they pass, brings up the pipeline:
        /// image cache, resolver worker, fresh aggregator, sampler.
        pub fn start(&mut self) {
            if thread_sanitizer_active() {
                log::warn!(
                    "[DATADOG SDK] 🐶 → Profiling is disabled because ThreadSanitizer is \
                     active. Please disable ThreadSanitizer to enable profiling."
                );
                self.set_status(ProfilerStatus::NotStarted);
                return;
            }
            if self.is_prewarming {
                self.set_status(ProfilerStatus::Prewarmed);
                return;
            }
            if !sample_within_rate(self.sample_rate) {
                self.set_status(ProfilerStatus::SampledOut);
                return;
            }
            if self.session.is_some() {
                self.teardown();
                self.set_status(ProfilerStatus::AlreadyStarted);
                return;
            }

            let interval_ns = self.sampling_config.sampling_interval_ns;

            // The image cache pre-loads metadata for every loaded image
            // and watches dyld for new ones. If it cannot start, profiling
            // continues on the uncached dladdr path.
            let image_cache = {
                let cache = ImageCache::new();
                match cache.start() {
                    Ok(()) => Some(Arc::new(cache)),
                    Err(e) => {
                        log::warn!("image cache unavailable, using dladdr fallback: {e}");
                        None
                    }
                }
            };

            let resolver = match Resolver::spawn(Profile::new(interval_ns), image_cache.clone()) {
                Ok(resolver) => resolver,
                Err(e) => {
                    log::error!("profiler startup failed: {e}");
                    self.set_status(ProfilerStatus::AllocationFailed);
                    return;
                }
            };

            // The resolver thread must not show up in its own profiles.
            let mut config = self.sampling_config.clone();
            config.ignore_thread = Some(resolver.thread_handle());

            let sampler = Arc::new_cyclic(|weak: &Weak<Sampler>| {
                let sink = make_sink(
                    Arc::clone(&resolver),
                    Arc::clone(&self.status),
                    self.timeout_ns,
                    weak.clone(),
                );
                Sampler::new(config, sink)
            });

            self.set_status(ProfilerStatus::Running);
            if let Err(e) = sampler.start_sampling() {
                log::error!("profiler startup failed: {e}");
                resolver.shutdown();
                self.set_status(ProfilerStatus::AllocationFailed);
                return;
            }

            self.session = Some(Session {
                sampler,
                resolver,
                _image_cache: image_cache,
            });
        }

        /// Stops sampling. The aggregator and resolver stay alive so an
        /// already-flushed or in-flight batch can still be collected with
        /// [`get_profile`](Self::get_profile).
        pub fn stop(&mut self) {
            let Some(session) = self.session.as_ref() else {
                return;
            };
            self.set_status(ProfilerStatus::Stopped);
            session.sampler.stop_sampling();
        }

        /// Block-flushes the sampler, waits for the resolver to drain, and
        /// returns the aggregate. With `cleanup` the live aggregator moves
        /// to the caller and a fresh one is installed atomically, so
        /// consecutive calls yield disjoint profiles; without it the
        /// caller gets a snapshot.
        pub fn get_profile(&self, cleanup: bool) -> Option<Profile> {
            let session = self.session.as_ref()?;
            session.sampler.flush_buffer(true);
            Some(session.resolver.take_profile(cleanup))
        }

        /// Serialized form of [`get_profile`](Self::get_profile).
        pub fn get_profile_bytes(&self, cleanup: bool) -> Option<Vec<u8>> {
            let profile = self.get_profile(cleanup)?;
            match pprof::serialize(&profile) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::error!("profile serialization failed: {e}");
                    None
                }
            }
        }

        fn teardown(&mut self) {
            if let Some(session) = self.session.take() {
                session.sampler.stop_sampling();
                session.resolver.shutdown();
            }
        }
    }

    impl Drop for MachProfiler {
        fn drop(&mut self) {
            self.teardown();
        }
    }

    /// Builds the sampler's sink: forward the batch to the resolver (the
    /// non-blocking path drops it on contention), then enforce the
    /// duration timeout.
    fn make_sink(
        resolver: Arc<Resolver>,
        status: Arc<Mutex<ProfilerStatus>>,
        timeout_ns: u64,
        sampler: Weak<Sampler>,
    ) -> TraceSink {
        Box::new(move |batch, blocking| {
            let Some(duration_ns) = resolver.enqueue(batch, blocking) else {
                return;
            };
            if duration_ns > timeout_ns {
                // Invoked on the sampler thread for periodic flushes, so
                // stop_sampling takes its self-reentry path there.
                if let Some(sampler) = sampler.upgrade() {
                    sampler.stop_sampling();
                }
                *status.lock().unwrap_or_else(PoisonError::into_inner) =
                    ProfilerStatus::Timeout;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_never_samples_and_full_rate_always_does() {
        for _ in 0..64 {
            assert!(!sample_within_rate(0.0));
            assert!(!sample_within_rate(-3.0));
            assert!(sample_within_rate(100.0));
            assert!(sample_within_rate(250.0));
        }
    }

    #[test]
    fn mid_rates_sample_probabilistically() {
        let hits = (0..2000).filter(|_| sample_within_rate(50.0)).count();
        // 50% draw over 2000 trials; allow a generous band.
        assert!((600..=1400).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn prewarm_env_detection() {
        std::env::remove_var("ActivePrewarm");
        assert!(!is_active_prewarm());
        std::env::set_var("ActivePrewarm", "0");
        assert!(!is_active_prewarm());
        std::env::set_var("ActivePrewarm", "1");
        assert!(is_active_prewarm());
        std::env::remove_var("ActivePrewarm");
    }

    #[test]
    fn tsan_is_not_linked_into_tests() {
        assert!(!thread_sanitizer_active());
    }
}
