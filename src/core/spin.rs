// Bounded busy-wait backoff for the commit-protocol ordering gates.
// Stall windows are bounded by ring capacity and the flush interval, so
// spinning beats parking on an OS primitive here.
use std::hint;
use std::thread;

const SPIN_LIMIT: u32 = 6;

pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// One wait step: exponential spin up to `2^SPIN_LIMIT` loop hints,
    /// then yield the thread instead of burning the core.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Backoff, SPIN_LIMIT};

    #[test]
    fn snooze_saturates_at_yield() {
        let mut backoff = Backoff::new();
        for _ in 0..SPIN_LIMIT + 4 {
            backoff.snooze();
        }
        assert_eq!(backoff.step, SPIN_LIMIT + 1);
    }
}
