// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Profiler status codes as seen across the C ABI. The numeric values are
/// part of the ABI; do not reorder.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProfilerStatus {
    /// No profiler handle exists.
    NotCreated = 0,
    /// The profiler exists but never started.
    NotStarted = 1,
    Running = 2,
    /// Stopped by the host.
    Stopped = 3,
    /// Stopped because the profile duration hit the timeout.
    Timeout = 4,
    /// Not started: the process launch was an OS pre-warm.
    Prewarmed = 5,
    /// Not started: the sample-rate draw failed.
    SampledOut = 6,
    /// Startup failed while building the pipeline.
    AllocationFailed = 7,
    /// Start was requested while already running.
    AlreadyStarted = 8,
}

impl From<datadog_mach_profiler::ProfilerStatus> for ProfilerStatus {
    fn from(status: datadog_mach_profiler::ProfilerStatus) -> Self {
        use datadog_mach_profiler::ProfilerStatus as Core;
        match status {
            Core::NotStarted => Self::NotStarted,
            Core::Running => Self::Running,
            Core::Stopped => Self::Stopped,
            Core::Timeout => Self::Timeout,
            Core::Prewarmed => Self::Prewarmed,
            Core::SampledOut => Self::SampledOut,
            Core::AllocationFailed => Self::AllocationFailed,
            Core::AlreadyStarted => Self::AlreadyStarted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values_are_stable() {
        assert_eq!(ProfilerStatus::NotCreated as i32, 0);
        assert_eq!(ProfilerStatus::NotStarted as i32, 1);
        assert_eq!(ProfilerStatus::Running as i32, 2);
        assert_eq!(ProfilerStatus::Stopped as i32, 3);
        assert_eq!(ProfilerStatus::Timeout as i32, 4);
        assert_eq!(ProfilerStatus::Prewarmed as i32, 5);
        assert_eq!(ProfilerStatus::SampledOut as i32, 6);
        assert_eq!(ProfilerStatus::AllocationFailed as i32, 7);
        assert_eq!(ProfilerStatus::AlreadyStarted as i32, 8);
    }
}
