use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic time source shared by the VM (TIME/COMPARETIME) and the PID bank.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;

    fn now_millis(&self) -> u64 {
        self.now_micros() / 1000
    }
}

/// Process-wide monotonic clock counted from the first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        EPOCH.elapsed().as_micros() as u64
    }
}

/// Settable clock for simulations and deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            micros: AtomicU64::new(start_micros),
        }
    }

    pub fn set_micros(&self, value: u64) {
        self.micros.store(value, Ordering::SeqCst);
    }

    pub fn advance_micros(&self, delta: u64) {
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: u64) {
        self.advance_micros(delta.saturating_mul(1000));
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}
