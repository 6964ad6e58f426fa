// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The sampling engine: a dedicated thread that periodically captures raw
//! stack traces from every live thread in the task.
//!
//! Captures are batched in a shared buffer and handed to a sink callback,
//! either when the batch threshold is reached or on an explicit flush. The
//! sampler pushes with a try-lock and drops the cycle's traces on
//! contention: the capture path must never block on the consumer.

mod suspension;
mod thread_info;
mod thread_state;

pub use thread_info::{set_main_thread, MAIN_THREAD_NAME};

use crate::clock;
use crate::memory;
use crate::types::StackTrace;
use anyhow::Context;
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::{thread_act_array_t, thread_act_t};
use mach2::message::mach_msg_type_number_t;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use std::mem;
use std::os::unix::thread::JoinHandleExt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use suspension::SuspendedThread;

/// ~101 Hz. Deliberately off the round 100 Hz so the sampler does not beat
/// against 10 ms periodic work in the host app.
pub const DEFAULT_SAMPLING_INTERVAL_NS: u64 = 9_900_990;

/// An opaque, sendable pthread identity used to exclude a specific thread
/// (e.g. the resolver worker) from sampling.
#[derive(Copy, Clone, Debug)]
pub struct ThreadHandle(libc::pthread_t);

// SAFETY: a pthread_t is an identifier; nothing is dereferenced through it
// off its owning thread.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    /// Handle for the calling thread.
    pub fn current() -> Self {
        // SAFETY: no preconditions.
        Self(unsafe { libc::pthread_self() })
    }

    /// Wraps a raw pthread identity (e.g. one taken from a join handle).
    pub(crate) fn from_raw(raw: libc::pthread_t) -> Self {
        Self(raw)
    }

    fn mach_port(&self) -> thread_act_t {
        // SAFETY: converts an identity, takes no reference.
        unsafe { libc::pthread_mach_thread_np(self.0) }
    }
}

/// Sampler configuration. The defaults match the production profile:
/// ~101 Hz, 128-frame stacks, at most 100 threads per cycle.
#[derive(Clone)]
pub struct SamplingConfig {
    /// Nominal time between two samples of the same thread.
    pub sampling_interval_ns: u64,
    /// Sample only the thread that called `start_sampling`.
    pub profile_current_thread_only: bool,
    /// Batch size at which the buffer is flushed to the sink.
    pub max_buffer_size: usize,
    /// Maximum frames captured per trace.
    pub max_stack_depth: usize,
    /// Per-cycle cap on sampled threads; 0 means unlimited.
    pub max_thread_count: u32,
    /// QoS class for the sampling thread itself.
    pub qos_class: libc::qos_class_t,
    /// A thread to skip during enumeration, so the resolver worker does not
    /// profile itself into every capture.
    pub ignore_thread: Option<ThreadHandle>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ns: DEFAULT_SAMPLING_INTERVAL_NS,
            profile_current_thread_only: false,
            max_buffer_size: 10_000,
            max_stack_depth: 128,
            max_thread_count: 100,
            qos_class: libc::qos_class_t::QOS_CLASS_USER_INTERACTIVE,
            ignore_thread: None,
        }
    }
}

/// Receives trace batches from the sampler. The second argument says
/// whether the sink may block handing the batch downstream.
pub type TraceSink = Box<dyn Fn(Vec<StackTrace>, bool) + Send + Sync>;

/// The sampling profiler. Construct with a config and a sink, then drive
/// with [`start_sampling`](Self::start_sampling) /
/// [`stop_sampling`](Self::stop_sampling).
pub struct Sampler {
    config: SamplingConfig,
    sink: TraceSink,
    running: AtomicBool,
    /// Serializes start/stop and owns the worker join handle.
    state: Mutex<Option<JoinHandle<()>>>,
    /// Shared batch buffer; the capture path only ever try-locks it.
    buffer: Mutex<Vec<StackTrace>>,
    /// pthread of the sampling thread, for stop() self-reentry detection.
    sampler_pthread: AtomicUsize,
    /// pthread of the single-thread-mode target.
    target_pthread: AtomicUsize,
}

impl Sampler {
    pub fn new(config: SamplingConfig, sink: TraceSink) -> Self {
        Self {
            config,
            sink,
            running: AtomicBool::new(false),
            state: Mutex::new(None),
            buffer: Mutex::new(Vec::new()),
            sampler_pthread: AtomicUsize::new(0),
            target_pthread: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(SeqCst)
    }

    /// Spawns the sampling thread. Fails if sampling is already running;
    /// the existing session is left untouched in that case.
    pub fn start_sampling(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        anyhow::ensure!(!self.running.load(SeqCst), "sampler already started");

        if self.config.profile_current_thread_only {
            self.target_pthread
                .store(ThreadHandle::current().0 as usize, SeqCst);
        }

        // Leftovers from a previous session must not leak into this one.
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        memory::install_handlers()?;

        self.running.store(true, SeqCst);
        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("com.datadoghq.profiler.sampling".into())
            .spawn(move || {
                crate::set_current_thread_qos(this.config.qos_class);
                this.run();
            })
            .context("failed to spawn the sampling thread");
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, SeqCst);
                return Err(e);
            }
        };
        self.sampler_pthread
            .store(handle.as_pthread_t() as usize, SeqCst);
        *state = Some(handle);
        Ok(())
    }

    /// Stops the sampling thread and joins it. Safe to call repeatedly.
    ///
    /// When called from the sampling thread itself (the timeout path), only
    /// the running flag is cleared; the thread unwinds out of its own loop
    /// and joining is left to the eventual external stop.
    pub fn stop_sampling(&self) {
        let me = ThreadHandle::current().0 as usize;
        if me == self.sampler_pthread.load(SeqCst) {
            self.running.store(false, SeqCst);
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.running.store(false, SeqCst);
        // Join while holding the state lock so the final blocking flush
        // completes before any new session can start.
        if let Some(handle) = state.take() {
            let _ = handle.join();
        }
    }

    /// Drains the batch buffer into the sink. `blocking` is forwarded to
    /// the sink and says whether it may block handing the batch downstream.
    pub fn flush_buffer(&self, blocking: bool) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            mem::take(&mut *buffer)
        };
        if !batch.is_empty() {
            (self.sink)(batch, blocking);
        }
    }

    fn run(&self) {
        while self.running.load(SeqCst) {
            let interval_ns = self.config.sampling_interval_ns;

            if self.config.profile_current_thread_only {
                let target = ThreadHandle(self.target_pthread.load(SeqCst) as libc::pthread_t);
                let mut cycle = Vec::new();
                self.sample_thread(target.mach_port(), interval_ns, &mut cycle);
                self.commit_cycle(cycle);
            } else if !self.sample_all_threads(interval_ns) {
                // Task enumeration failed; back off and retry, never fatal.
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            std::thread::sleep(Duration::from_nanos(interval_ns));
        }

        self.flush_buffer(true);
    }

    /// One sampling cycle over the task's threads. Returns false if the
    /// kernel refused to enumerate them.
    fn sample_all_threads(&self, interval_ns: u64) -> bool {
        let mut threads: thread_act_array_t = ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        // SAFETY: out-parameters are valid; the returned port array is
        // released below.
        let task = unsafe { mach2::traps::mach_task_self() };
        let kr = unsafe { mach2::task::task_threads(task, &mut threads, &mut count) };
        if kr != KERN_SUCCESS {
            return false;
        }

        let self_port = ThreadHandle::current().mach_port();
        let ignore_port = self.config.ignore_thread.map(|t| t.mach_port());

        let mut cycle = Vec::new();
        let mut visited: u32 = 0;
        for i in 0..count as usize {
            if !self.running.load(SeqCst) {
                break;
            }
            if self.config.max_thread_count != 0 && visited >= self.config.max_thread_count {
                break;
            }
            // SAFETY: i < count, within the kernel-returned array.
            let thread = unsafe { *threads.add(i) };
            if thread == self_port {
                continue;
            }
            if ignore_port == Some(thread) {
                continue;
            }
            visited += 1;
            self.sample_thread(thread, interval_ns, &mut cycle);
        }

        // Release the kernel-returned thread ports and the array itself.
        // SAFETY: each name was returned by task_threads exactly once.
        unsafe {
            for i in 0..count as usize {
                mach2::mach_port::mach_port_deallocate(task, *threads.add(i));
            }
            mach2::vm::mach_vm_deallocate(
                task,
                threads as mach_vm_address_t,
                (count as usize * mem::size_of::<thread_act_t>()) as mach_vm_size_t,
            );
        }

        self.commit_cycle(cycle);
        true
    }

    /// Captures one thread. Register-read failures, suspension failures,
    /// and empty unwinds all drop the capture for this cycle; the
    /// suspend-resume pair is unconditional on every path that suspends.
    fn sample_thread(&self, thread: thread_act_t, interval_ns: u64, cycle: &mut Vec<StackTrace>) {
        let Some((fp, pc)) = thread_state::read_frame_pointers(thread) else {
            return;
        };

        // Everything that allocates or calls pthread happens before the
        // suspension: the frame storage, the name lookup, the timestamp.
        let mut frames = Vec::with_capacity(self.config.max_stack_depth);
        let thread_name = thread_info::thread_name(thread);
        let timestamp_ns = clock::monotonic_ns();

        {
            let Some(suspended) = SuspendedThread::suspend(thread) else {
                return;
            };
            suspended.walk_stack(&mut frames, fp, pc, self.config.max_stack_depth);
            // Guard drop resumes the thread.
        }

        if frames.is_empty() {
            return;
        }
        cycle.push(StackTrace {
            tid: thread,
            thread_name,
            timestamp_ns,
            sampling_interval_ns: interval_ns,
            frames,
        });
    }

    /// Appends a cycle's traces to the shared buffer. Contention on the
    /// buffer lock drops the traces instead of blocking the sampler.
    fn commit_cycle(&self, mut cycle: Vec<StackTrace>) {
        if cycle.is_empty() {
            return;
        }
        let should_flush = match self.buffer.try_lock() {
            Ok(mut buffer) => {
                buffer.append(&mut cycle);
                buffer.len() >= self.config.max_buffer_size
            }
            Err(_) => {
                drop(cycle);
                return;
            }
        };
        if should_flush {
            self.flush_buffer(false);
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop_sampling();
    }
}
