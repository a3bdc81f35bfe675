//! Background sort worker
//!
//! Runs the depth sort off the render loop's critical path. The frame loop
//! submits a [`SortJob`] snapshot and keeps rendering with the previously
//! published order; the worker drains its queue to the newest job
//! (latest-wins), sorts, and publishes atomically. A finished result whose
//! generation has drifted past the current one is dropped instead of
//! published, and job buffers flow back through a recycle channel so steady
//! state allocates nothing per frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::core::types::Vec3;
use crate::splat::model::Generation;

use super::{DepthSorter, SortJob};

/// Published draw order, read-only for the rendering collaborator
#[derive(Clone, Debug)]
pub struct SortedOrder {
    pub generation: Generation,
    /// Visible splat indices, back-to-front
    pub indices: Vec<u32>,
}

struct Shared {
    /// Last published order; swapped whole, never written in place
    published: Mutex<Option<Arc<SortedOrder>>>,
    /// Newest generation the frame loop has seen
    current_generation: AtomicU64,
}

/// Handle to the sort thread
pub struct SortWorker {
    job_tx: Option<Sender<SortJob>>,
    recycle_rx: Receiver<(Vec<u32>, Vec<Vec3>)>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl SortWorker {
    pub fn new(depth_bucket_bits: u32, generation_drift: u64) -> Self {
        let (job_tx, job_rx) = channel::<SortJob>();
        let (recycle_tx, recycle_rx) = channel();
        let shared = Arc::new(Shared {
            published: Mutex::new(None),
            current_generation: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("splat-sort".into())
            .spawn(move || {
                worker_loop(
                    job_rx,
                    recycle_tx,
                    worker_shared,
                    depth_bucket_bits,
                    generation_drift,
                );
            })
            .expect("failed to spawn sort thread");

        Self {
            job_tx: Some(job_tx),
            recycle_rx,
            shared,
            handle: Some(handle),
        }
    }

    /// Submit the newest job; never blocks the frame loop
    pub fn submit(&self, job: SortJob) {
        self.shared
            .current_generation
            .fetch_max(job.generation.0, Ordering::Release);
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(job);
        }
    }

    /// Keep the worker's staleness check current on frames that submit no
    /// new job (camera moved but visibility is unchanged mid-flight).
    pub fn note_generation(&self, generation: Generation) {
        self.shared
            .current_generation
            .fetch_max(generation.0, Ordering::Release);
    }

    /// Latest published order, if any. Cheap to call every frame; the
    /// consumer keeps using the previous Arc when no newer result landed.
    pub fn published(&self) -> Option<Arc<SortedOrder>> {
        self.shared.published.lock().unwrap().clone()
    }

    /// Take back a pair of job buffers the worker has finished with
    pub fn take_recycled(&self) -> Option<(Vec<u32>, Vec<Vec3>)> {
        self.recycle_rx.try_recv().ok()
    }
}

impl Drop for SortWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit
        drop(self.job_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    job_rx: Receiver<SortJob>,
    recycle_tx: Sender<(Vec<u32>, Vec<Vec3>)>,
    shared: Arc<Shared>,
    depth_bucket_bits: u32,
    generation_drift: u64,
) {
    let mut sorter = DepthSorter::new(depth_bucket_bits);
    let mut last_published = Generation(0);

    while let Ok(mut job) = job_rx.recv() {
        // Drain to the newest job: anything older is superseded before it
        // ever gets sorted
        loop {
            match job_rx.try_recv() {
                Ok(newer) => {
                    let old = std::mem::replace(&mut job, newer);
                    let _ = recycle_tx.send((old.indices, old.positions));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut indices = Vec::new();
        sorter.sort_into(&job, &mut indices);

        // The job may have gone stale while sorting; publish only results
        // the frame loop can still use
        let current = shared.current_generation.load(Ordering::Acquire);
        let drifted = current.saturating_sub(job.generation.0) > generation_drift;
        if !drifted && job.generation >= last_published {
            last_published = job.generation;
            let order = Arc::new(SortedOrder {
                generation: job.generation,
                indices,
            });
            *shared.published.lock().unwrap() = Some(order);
            log::trace!("published sort order for generation {}", job.generation.0);
        } else {
            log::trace!(
                "discarded sort result for generation {} (current {})",
                job.generation.0,
                current
            );
        }

        let _ = recycle_tx.send((job.indices, job.positions));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Mat4;
    use std::time::{Duration, Instant};

    fn job(generation: u64, count: u32) -> SortJob {
        SortJob {
            generation: Generation(generation),
            view: Mat4::IDENTITY,
            indices: (0..count).collect(),
            positions: (0..count)
                .map(|i| Vec3::new(0.0, 0.0, -(i as f32 + 1.0)))
                .collect(),
        }
    }

    fn wait_for_generation(worker: &SortWorker, generation: u64) -> Arc<SortedOrder> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(order) = worker.published() {
                if order.generation.0 >= generation {
                    return order;
                }
            }
            assert!(Instant::now() < deadline, "sort worker timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_publishes_sorted_order() {
        let worker = SortWorker::new(16, 2);
        assert!(worker.published().is_none());

        worker.submit(job(1, 100));
        let order = wait_for_generation(&worker, 1);

        assert_eq!(order.generation, Generation(1));
        assert_eq!(order.indices.len(), 100);
        // Farthest splat (largest index) drawn first
        assert_eq!(order.indices[0], 99);
    }

    #[test]
    fn test_latest_submission_wins() {
        let worker = SortWorker::new(16, 64);

        for generation in 1..=20 {
            worker.submit(job(generation, 500));
        }
        let order = wait_for_generation(&worker, 20);
        assert_eq!(order.generation, Generation(20));
    }

    #[test]
    fn test_stale_results_not_published() {
        let worker = SortWorker::new(16, 2);

        // The frame loop has long moved on before this job is processed
        worker.note_generation(Generation(50));
        worker.submit(job(1, 10));

        // Give the worker time to process and (correctly) drop the result
        std::thread::sleep(Duration::from_millis(50));
        assert!(worker.published().is_none());

        // A fresh job still publishes
        worker.submit(job(50, 10));
        let order = wait_for_generation(&worker, 50);
        assert_eq!(order.generation, Generation(50));
    }

    #[test]
    fn test_buffers_are_recycled() {
        let worker = SortWorker::new(16, 2);

        worker.submit(job(1, 64));
        wait_for_generation(&worker, 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((indices, positions)) = worker.take_recycled() {
                assert_eq!(indices.len(), 64);
                assert_eq!(positions.len(), 64);
                break;
            }
            assert!(Instant::now() < deadline, "recycle channel timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_drop_joins_worker() {
        let worker = SortWorker::new(16, 2);
        worker.submit(job(1, 10));
        drop(worker); // must not hang
    }
}
