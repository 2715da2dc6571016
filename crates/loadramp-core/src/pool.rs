//! Bounded worker pool
//!
//! Workers are preallocated up to a floor and created on demand up to a
//! ceiling. Each worker carries its own random stream, so iterations running
//! on different workers never contend on generator state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// An execution slot with its private random stream
#[derive(Debug)]
pub struct Worker {
    id: usize,
    rng: ChaCha8Rng,
}

impl Worker {
    fn new(id: usize, seed: Option<u64>) -> Self {
        let seed = match seed {
            Some(base) => base.wrapping_add((id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => rand::random(),
        };
        Self {
            id,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// Pool of workers bounded by `max_workers`
#[derive(Debug)]
pub struct WorkerPool {
    max_workers: usize,
    seed: Option<u64>,
    idle: Mutex<Vec<Worker>>,
    instantiated: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with `preallocated` workers ready. `preallocated` is
    /// clamped to `max_workers`.
    pub fn new(preallocated: usize, max_workers: usize, seed: Option<u64>) -> Arc<Self> {
        let preallocated = preallocated.min(max_workers);
        let idle = (0..preallocated).rev().map(|id| Worker::new(id, seed)).collect();
        Arc::new(Self {
            max_workers,
            seed,
            idle: Mutex::new(idle),
            instantiated: AtomicUsize::new(preallocated),
            busy: AtomicUsize::new(0),
            peak_busy: AtomicUsize::new(0),
        })
    }

    /// Take an idle worker, growing the pool if allowed. `None` means the pool
    /// is exhausted and the caller must drop the start.
    pub fn try_acquire(self: &Arc<Self>) -> Option<WorkerSlot> {
        let worker = {
            let mut idle = self.idle.lock();
            match idle.pop() {
                Some(worker) => worker,
                None => {
                    // Growth happens under the idle lock, so the ceiling holds.
                    let id = self.instantiated.load(Ordering::Acquire);
                    if id >= self.max_workers {
                        return None;
                    }
                    self.instantiated.store(id + 1, Ordering::Release);
                    debug!("Growing worker pool to {}", id + 1);
                    Worker::new(id, self.seed)
                }
            }
        };

        let busy = self.busy.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_busy.fetch_max(busy, Ordering::AcqRel);
        Some(WorkerSlot {
            worker: Some(worker),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, worker: Worker) {
        // Decrement first so `busy` never over-counts held slots.
        self.busy.fetch_sub(1, Ordering::AcqRel);
        self.idle.lock().push(worker);
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers created so far, idle or busy
    pub fn instantiated(&self) -> usize {
        self.instantiated.load(Ordering::Acquire)
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously busy workers
    pub fn peak_busy(&self) -> usize {
        self.peak_busy.load(Ordering::Acquire)
    }
}

/// Exclusive lease on a worker; returns it to the pool when dropped
#[derive(Debug)]
pub struct WorkerSlot {
    worker: Option<Worker>,
    pool: Arc<WorkerPool>,
}

impl WorkerSlot {
    pub fn worker(&mut self) -> &mut Worker {
        self.worker
            .as_mut()
            .expect("worker is only taken out on drop")
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}
