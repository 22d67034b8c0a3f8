//! Exponentially decaying access-intensity counter.
//!
//! Each recorded access contributes 1 to the counter after the previous
//! value has decayed by `exp(-lambda * dt)`. Frequent accesses push the
//! value up toward `1 / (1 - exp(-lambda * dt))`; an idle period lets it
//! fall back toward zero. The caller supplies the clock, in microseconds.
//!
//! Calls closer together than the coalescing window return the current
//! value without recording anything, so a burst of accesses inside one
//! window counts once.

/// Decaying access counter. Not synchronized; wrap in a mutex when shared.
#[derive(Debug, Clone)]
pub struct DecayCounter {
    value: f64,
    last_us: u64,
    lambda: f64,
    window_us: u64,
}

impl DecayCounter {
    /// `lambda` is the decay constant in 1/µs; `window_us` the coalescing
    /// window. A zero window disables coalescing, a zero lambda disables
    /// decay.
    pub fn new(lambda: f64, window_us: u64) -> Self {
        Self {
            value: 0.0,
            last_us: 0,
            lambda,
            window_us,
        }
    }

    /// Record an access at `now_us` and return the new integer value.
    ///
    /// The first call always counts; later calls within `window_us` of the
    /// previous recorded access are coalesced and return the value as-is.
    pub fn add(&mut self, now_us: u64) -> u64 {
        if self.last_us != 0 {
            let dt = now_us.saturating_sub(self.last_us);
            if dt < self.window_us {
                return self.value as u64;
            }
            self.value *= (-self.lambda * dt as f64).exp();
        }
        self.value += 1.0;
        self.last_us = now_us;
        self.value as u64
    }

    /// Current integer value without recording an access.
    pub fn value(&self) -> u64 {
        self.value as u64
    }

    /// Timestamp of the last recorded access, 0 if none.
    pub fn last_access_us(&self) -> u64 {
        self.last_us
    }
}
