// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The resolver worker: a dedicated thread that drains trace batches from
//! the sampler, attaches binary-image metadata to every frame, and feeds
//! the aggregator.
//!
//! The worker runs at user-initiated QoS: it takes dyld's lock through the
//! image cache, and holding that lock at low priority would invert against
//! any higher-priority thread loading code. All aggregator mutation happens
//! here, under the resolver mutex.

use crate::images::{self, ImageCache};
use crate::profile::Profile;
use crate::sampler::ThreadHandle;
use crate::types::{BinaryImage, StackTrace};
use anyhow::Context;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::mem;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

struct ResolverShared {
    /// FIFO batches from the sampler; unbounded, the sampler's batch
    /// threshold is the only bound.
    queue: VecDeque<Vec<StackTrace>>,
    /// True while the worker holds a popped batch that has not yet been
    /// aggregated, so flushers can wait for true idleness.
    processing_batch: bool,
    running: bool,
    aggregator: Profile,
}

pub(crate) struct Resolver {
    shared: Mutex<ResolverShared>,
    condvar: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_pthread: AtomicUsize,
    image_cache: Option<Arc<ImageCache>>,
}

impl Resolver {
    /// Spawns the worker thread around a fresh aggregator.
    pub(crate) fn spawn(
        aggregator: Profile,
        image_cache: Option<Arc<ImageCache>>,
    ) -> anyhow::Result<Arc<Resolver>> {
        let resolver = Arc::new(Resolver {
            shared: Mutex::new(ResolverShared {
                queue: VecDeque::new(),
                processing_batch: false,
                running: true,
                aggregator,
            }),
            condvar: Condvar::new(),
            worker: Mutex::new(None),
            worker_pthread: AtomicUsize::new(0),
            image_cache,
        });

        let worker_ref = Arc::clone(&resolver);
        let handle = std::thread::Builder::new()
            .name("com.datadoghq.profiler.resolver".into())
            .spawn(move || {
                crate::set_current_thread_qos(libc::qos_class_t::QOS_CLASS_USER_INITIATED);
                worker_ref.run();
            })
            .context("failed to spawn the resolver thread")?;

        resolver
            .worker_pthread
            .store(handle.as_pthread_t() as usize, SeqCst);
        *resolver
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(resolver)
    }

    /// Identity of the worker thread, for the sampler's ignore list.
    pub(crate) fn thread_handle(&self) -> ThreadHandle {
        ThreadHandle::from_raw(self.worker_pthread.load(SeqCst) as libc::pthread_t)
    }

    /// Hands a batch to the worker. The non-blocking path try-locks and
    /// drops the batch on contention; the sampler must never stall behind
    /// the consumer. Returns the aggregator's observed duration when the
    /// batch was enqueued, for the caller's timeout check.
    pub(crate) fn enqueue(&self, batch: Vec<StackTrace>, blocking: bool) -> Option<u64> {
        let duration_ns = if blocking {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.queue.push_back(batch);
            shared.aggregator.duration_ns()
        } else {
            match self.shared.try_lock() {
                Ok(mut shared) => {
                    shared.queue.push_back(batch);
                    shared.aggregator.duration_ns()
                }
                Err(_) => {
                    // Backpressure: the samples disappear, by design.
                    drop(batch);
                    return None;
                }
            }
        };
        self.condvar.notify_all();
        Some(duration_ns)
    }

    /// Waits until the queue is drained and no batch is in flight, then
    /// hands out the aggregator: the live one moves to the caller and a
    /// fresh one is installed when `cleanup` is set, otherwise a snapshot.
    pub(crate) fn take_profile(&self, cleanup: bool) -> Profile {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        while !shared.queue.is_empty() || shared.processing_batch {
            shared = self
                .condvar
                .wait(shared)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if cleanup {
            let interval = shared.aggregator.sampling_interval_ns();
            mem::replace(&mut shared.aggregator, Profile::new(interval))
        } else {
            shared.aggregator.clone()
        }
    }

    /// Stops the worker after it drains any outstanding batches, and joins
    /// it. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.running = false;
        }
        self.condvar.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        while let Some(mut batch) = self.next_batch() {
            // Resolution happens outside the resolver mutex so blocking
            // flushers and the sampler's try-lock are not starved by
            // dladdr work.
            self.resolve_batch(&mut batch);

            {
                let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
                shared.aggregator.add_samples(batch);
                shared.processing_batch = false;
            }
            // Wake flushers waiting for "queue empty and idle".
            self.condvar.notify_all();
        }
    }

    fn next_batch(&self) -> Option<Vec<StackTrace>> {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(batch) = shared.queue.pop_front() {
                shared.processing_batch = true;
                return Some(batch);
            }
            if !shared.running {
                return None;
            }
            shared = self
                .condvar
                .wait(shared)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Attaches image metadata to every frame. A per-batch memo keyed by
    /// instruction pointer avoids duplicate resolver calls inside the
    /// batch; it starts empty for each batch.
    fn resolve_batch(&self, batch: &mut [StackTrace]) {
        let mut memo: FxHashMap<u64, Option<BinaryImage>> = FxHashMap::default();
        for trace in batch.iter_mut() {
            for frame in trace.frames.iter_mut() {
                let image = memo
                    .entry(frame.instruction_ptr)
                    .or_insert_with(|| self.resolve_ip(frame.instruction_ptr));
                // Each frame owns its copy; traces outlive the memo.
                frame.image = image.clone();
            }
        }
    }

    fn resolve_ip(&self, ip: u64) -> Option<BinaryImage> {
        match self.image_cache.as_ref() {
            Some(cache) => cache.resolve(ip),
            // Cache construction failed at startup; profiling continues on
            // the slower uncached path.
            None => images::resolve_uncached(ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StackFrame;
    use std::time::Duration;

    fn trace(ip: u64, timestamp_ns: u64) -> StackTrace {
        StackTrace {
            tid: 1,
            thread_name: None,
            timestamp_ns,
            sampling_interval_ns: 10_000_000,
            frames: vec![StackFrame::new(ip)],
        }
    }

    #[test]
    fn drains_batches_into_the_aggregator() {
        let resolver = Resolver::spawn(Profile::new(10_000_000), None).unwrap();
        let ip = drains_batches_into_the_aggregator as usize as u64;
        resolver.enqueue(vec![trace(ip, 100), trace(ip, 200)], true);
        resolver.enqueue(vec![trace(ip, 300)], true);

        let profile = resolver.take_profile(false);
        assert_eq!(profile.samples().len(), 3);
        // One distinct address resolves to exactly one location/mapping.
        assert_eq!(profile.location_count(), 1);
        assert_eq!(profile.mapping_count(), 1);
        resolver.shutdown();
    }

    #[test]
    fn cleanup_splits_profiles_disjointly() {
        let resolver = Resolver::spawn(Profile::new(10_000_000), None).unwrap();
        let ip = cleanup_splits_profiles_disjointly as usize as u64;

        resolver.enqueue(vec![trace(ip, 100)], true);
        let first = resolver.take_profile(true);
        assert_eq!(first.samples().len(), 1);

        resolver.enqueue(vec![trace(ip, 200)], true);
        let second = resolver.take_profile(true);
        assert_eq!(second.samples().len(), 1);
        assert_ne!(
            first.samples()[0].timestamp_ns,
            second.samples()[0].timestamp_ns
        );

        // Nothing left behind after the second cleanup.
        let empty = resolver.take_profile(false);
        assert!(empty.samples().is_empty());
        resolver.shutdown();
    }

    #[test]
    fn shutdown_drains_outstanding_batches() {
        let resolver = Resolver::spawn(Profile::new(10_000_000), None).unwrap();
        let ip = shutdown_drains_outstanding_batches as usize as u64;
        for i in 0..16 {
            resolver.enqueue(vec![trace(ip, i + 1)], true);
        }
        resolver.shutdown();
        let profile = resolver.take_profile(false);
        assert_eq!(profile.samples().len(), 16);
        // Idempotent.
        resolver.shutdown();
    }

    #[test]
    fn resolves_own_code_to_the_test_binary() {
        let cache = Arc::new(ImageCache::new());
        cache.start().unwrap();
        let resolver = Resolver::spawn(Profile::new(10_000_000), Some(cache)).unwrap();

        let ip = resolves_own_code_to_the_test_binary as usize as u64;
        resolver.enqueue(vec![trace(ip, 50)], true);

        // Give the worker a moment, then drain deterministically.
        std::thread::sleep(Duration::from_millis(10));
        let profile = resolver.take_profile(false);
        let mapping = profile.mappings().next().expect("one mapping");
        assert_ne!(mapping.memory_start, 0);
        let filename = profile.strings().get(mapping.filename).unwrap_or("");
        assert!(!filename.is_empty());
        resolver.shutdown();
    }
}
