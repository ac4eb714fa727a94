use crate::pool::ReadyLevel;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Consumer stall beyond this marks the ready queue as starved.
pub const STALL_PENALTY: Duration = Duration::from_millis(500);

/// What the search manager should do after a scheduling decision.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Launch one more I/O worker; the slot is already reserved.
    SpawnIo,
    None,
}

/// Arbitrates CPU threads between I/O and compute. One instance per
/// search; I/O workers hold a shared handle and poll the preempt flag,
/// the consumer calls [`Scheduler::run_manager`] once per compute
/// iteration with the stall penalty it just measured.
pub struct Scheduler {
    max_io: usize,
    n_io: AtomicUsize,
    io_done: AtomicBool,
    preempt: AtomicBool,
    end_signal: AtomicBool,
    exit: AtomicBool,
}

impl Scheduler {
    pub fn new(max_io: usize) -> Self {
        Scheduler {
            max_io: max_io.max(1),
            n_io: AtomicUsize::new(0),
            io_done: AtomicBool::new(false),
            preempt: AtomicBool::new(false),
            end_signal: AtomicBool::new(false),
            exit: AtomicBool::new(false),
        }
    }

    /// Trade threads between I/O and compute based on the measured stall
    /// penalty and the ready-queue fill level.
    pub fn run_manager(&self, penalty: Duration, level: ReadyLevel) -> Directive {
        if penalty >= STALL_PENALTY
            && level == ReadyLevel::BelowLow
            && !self.io_done.load(Ordering::Acquire)
            && self.reserve_io_slot()
        {
            return Directive::SpawnIo;
        }

        if level == ReadyLevel::AboveHigh && self.n_io.load(Ordering::Acquire) > 1 {
            self.preempt.store(true, Ordering::Release);
        }

        Directive::None
    }

    /// Reserve a worker slot ahead of a spawn. Clears any stale preempt so
    /// the new worker does not immediately park itself.
    pub fn reserve_io_slot(&self) -> bool {
        let mut n = self.n_io.load(Ordering::Acquire);
        loop {
            if n >= self.max_io {
                return false;
            }
            match self
                .n_io
                .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.preempt.store(false, Ordering::Release);
                    return true;
                }
                Err(actual) => n = actual,
            }
        }
    }

    /// End-of-input signal: the file queue is exhausted and every I/O
    /// worker has parked or exited.
    pub fn check_signal(&self) -> bool {
        self.end_signal.load(Ordering::Acquire)
    }

    /// Consume a pending preempt request.
    pub fn check_preempt(&self) -> bool {
        self.preempt.swap(false, Ordering::AcqRel)
    }

    /// Number of threads currently serving I/O; the compute kernel lowers
    /// its parallel width by this amount.
    pub fn active_io(&self) -> usize {
        self.n_io.load(Ordering::Acquire)
    }

    /// Called by the worker that found both the file queue and the park
    /// queue empty.
    pub fn io_complete(&self) {
        self.io_done.store(true, Ordering::Release);
    }

    /// Called by a worker that parked a file on its way out: input is not
    /// complete while parked work remains.
    pub fn io_parked(&self) {
        self.io_done.store(false, Ordering::Release);
    }

    pub fn is_io_complete(&self) -> bool {
        self.io_done.load(Ordering::Acquire)
    }

    /// Global cooperative cancellation: every loop abandons its work at
    /// the next check.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn should_exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Release a worker slot on exit; raises the end signal once input is
    /// complete and the last worker has returned control.
    pub fn take_control(&self) {
        let remaining = self.n_io.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.io_done.load(Ordering::Acquire) {
            self.end_signal.store(true, Ordering::Release);
        }
    }
}
