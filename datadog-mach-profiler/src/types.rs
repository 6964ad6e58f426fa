// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The raw trace data model shared by the sampler, the resolver, and the
//! aggregator. Traces are move-only values: the sampler produces them, the
//! resolver worker annotates them in place, and the aggregator consumes the
//! batch, so nothing ever aliases a trace across threads.

/// A loaded Mach-O image, identified by where the dynamic loader placed it
/// and by its `LC_UUID`.
///
/// Once an image has been observed, its `(load_address, uuid)` pair is
/// stable for the life of the process. Every frame owns its copy of the
/// metadata so traces stay self-contained when they cross threads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinaryImage {
    /// Base address at which the dynamic loader placed the image.
    pub load_address: u64,
    /// The image's `LC_UUID`.
    pub uuid: [u8; 16],
    /// Filesystem path of the image, when known.
    pub filename: Option<String>,
}

/// A single return address plus the image it falls in. The image is `None`
/// until the resolver worker has annotated the frame.
#[derive(Clone, Debug, Default)]
pub struct StackFrame {
    pub instruction_ptr: u64,
    pub image: Option<BinaryImage>,
}

impl StackFrame {
    pub fn new(instruction_ptr: u64) -> Self {
        Self {
            instruction_ptr,
            image: None,
        }
    }
}

/// A captured stack for one thread at one instant.
///
/// `frames` is ordered leaf to root and is never empty for a trace that
/// reaches the aggregator; empty captures are dropped by the sampler.
#[derive(Clone, Debug, Default)]
pub struct StackTrace {
    /// Mach thread port of the sampled thread.
    pub tid: u32,
    pub thread_name: Option<String>,
    /// Monotonic uptime in nanoseconds at capture.
    pub timestamp_ns: u64,
    /// The sampling interval this capture was taken under.
    pub sampling_interval_ns: u64,
    pub frames: Vec<StackFrame>,
}
