use crate::spectrum::SpectrumBatch;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Ready-queue depth relative to the pool watermarks; drives the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadyLevel {
    BelowLow,
    Between,
    AboveHigh,
}

/// Fixed pool of reusable spectrum batches with two queues: `wait` holds
/// empty buffers for the I/O side, `ready` holds filled buffers for the
/// compute side. Queue membership is the ownership token - a batch is in
/// exactly one of {wait, ready, in flight}.
///
/// Each queue has its own mutex; the two are never held simultaneously.
pub struct BufferPool {
    wait: Mutex<VecDeque<Box<SpectrumBatch>>>,
    ready: Mutex<VecDeque<Box<SpectrumBatch>>>,
    capacity: usize,
    low: usize,
    high: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, low: usize, high: usize) -> Self {
        let mut wait = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            wait.push_back(Box::new(SpectrumBatch::new()));
        }
        BufferPool {
            wait: Mutex::new(wait),
            ready: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            low,
            high,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// I/O side: take an empty buffer to fill.
    pub fn take_empty(&self) -> Option<Box<SpectrumBatch>> {
        self.wait.lock().pop_front()
    }

    /// I/O side: publish a filled buffer to the compute side.
    pub fn publish(&self, batch: Box<SpectrumBatch>) {
        self.ready.lock().push_back(batch);
    }

    /// Compute side: take the next filled buffer.
    pub fn take_ready(&self) -> Option<Box<SpectrumBatch>> {
        self.ready.lock().pop_front()
    }

    /// Compute side: return a drained buffer to the I/O side.
    pub fn replenish(&self, batch: Box<SpectrumBatch>) {
        self.wait.lock().push_back(batch);
    }

    pub fn is_wait_empty(&self) -> bool {
        self.wait.lock().is_empty()
    }

    pub fn is_ready_empty(&self) -> bool {
        self.ready.lock().is_empty()
    }

    /// Ready-queue depth against the low/high watermarks.
    pub fn ready_level(&self) -> ReadyLevel {
        let depth = self.ready.lock().len();
        if depth < self.low {
            ReadyLevel::BelowLow
        } else if depth > self.high {
            ReadyLevel::AboveHigh
        } else {
            ReadyLevel::Between
        }
    }

    /// Shutdown: consume both queues until empty. Returns how many buffers
    /// were recovered; the remainder are in flight with their holders.
    pub fn drain(&self) -> usize {
        let mut recovered = 0;
        while self.take_ready().is_some() {
            recovered += 1;
        }
        while self.take_empty().is_some() {
            recovered += 1;
        }
        recovered
    }
}
