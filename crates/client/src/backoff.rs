//! Bounded reconnect backoff.
//!
//! Attempts walk a fixed slot schedule and stay on the last slot forever;
//! the wait never grows past it. A little jitter keeps a fleet of clients
//! from reconnecting in lockstep after a server restart.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    slots: Vec<Duration>,
    jitter_ratio: f64,
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        ReconnectSchedule {
            slots: vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            jitter_ratio: 0.1,
        }
    }
}

impl ReconnectSchedule {
    pub fn new(slots: Vec<Duration>, jitter_ratio: f64) -> Self {
        assert!(!slots.is_empty(), "schedule needs at least one slot");
        ReconnectSchedule {
            slots,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// The scheduled wait before attempt `attempt` (zero-based), without
    /// jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.slots.len() - 1);
        self.slots[index]
    }

    /// The actual wait before attempt `attempt`: the scheduled slot plus
    /// up to `jitter_ratio` of it.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter_ratio == 0.0 {
            return base;
        }
        let jitter = base.as_secs_f64() * self.jitter_ratio * rand::thread_rng().gen::<f64>();
        base + Duration::from_secs_f64(jitter)
    }

    pub fn max_delay(&self) -> Duration {
        *self.slots.last().expect("non-empty schedule")
    }
}
