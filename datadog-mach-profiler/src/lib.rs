// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process sampling profiler for Apple platforms.
//!
//! A high-QoS sampler thread periodically suspends every live thread in the
//! current process, walks its user-space stack by frame-pointer traversal,
//! and hands the raw traces to a resolver worker which attaches binary-image
//! metadata (load address, UUID, path) and folds them into a deduplicating
//! profile aggregator. The aggregate serializes to a pprof protobuf buffer.
//!
//! The platform-specific pieces (Mach thread control, dyld image
//! enumeration, signal-guarded memory reads) only build on macOS; the trace
//! data model, the aggregator, and the pprof encoder are portable, e.g. for
//! replaying captured traces in tests.

mod clock;
pub mod profile;
pub mod profiler;
pub mod settings;
pub mod types;

#[cfg(target_os = "macos")]
pub mod images;
#[cfg(target_os = "macos")]
pub mod memory;
#[cfg(target_os = "macos")]
pub mod sampler;

pub use profile::Profile;
pub use profiler::ProfilerStatus;
pub use types::{BinaryImage, StackFrame, StackTrace};

#[cfg(target_os = "macos")]
pub use profiler::MachProfiler;
#[cfg(target_os = "macos")]
pub use sampler::SamplingConfig;

/// Applies a QoS class to the calling thread. Best effort: a scheduling
/// hint that cannot be applied must never fail the profiler.
#[cfg(target_os = "macos")]
pub(crate) fn set_current_thread_qos(class: libc::qos_class_t) {
    // SAFETY: no preconditions; applies only to the calling thread.
    unsafe { libc::pthread_set_qos_class_self_np(class, 0) };
}
