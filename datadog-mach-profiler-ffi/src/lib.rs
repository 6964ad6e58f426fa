// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! C ABI for the in-process Mach sampling profiler.
//!
//! The profiler is exposed as a process-wide handle behind
//! `ddog_prof_Profiler_*` functions: hosts start it with a sample rate and
//! a pre-warming flag, poll its status, and collect encoded pprof buffers.
//! All functions are safe to call from any thread and serialize on an
//! internal mutex.

pub mod byte_buffer;
pub mod status;

pub use byte_buffer::EncodedProfile;
pub use status::ProfilerStatus;

#[cfg(target_os = "macos")]
mod profiler;
#[cfg(target_os = "macos")]
pub use profiler::*;
