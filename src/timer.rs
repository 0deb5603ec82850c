//! Election and heartbeat timers.
//!
//! Both timers are plain deadlines kept inside the node state and polled by
//! the node's timer driver, so resetting or stopping them only needs the node
//! lock and never races with a pending tokio timer.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

/// Randomized election timeout. The random source is seeded once per timer.
#[derive(Debug)]
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    deadline: Instant,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let mut timer = Self {
            min,
            max,
            deadline: Instant::now(),
            rng: StdRng::from_os_rng(),
        };
        timer.reset();
        timer
    }

    #[cfg(test)]
    pub(crate) fn with_seed(min: Duration, max: Duration, seed: u64) -> Self {
        let mut timer = Self {
            min,
            max,
            deadline: Instant::now(),
            rng: StdRng::seed_from_u64(seed),
        };
        timer.reset();
        timer
    }

    /// 重新随机一个超时时间并返回它
    pub fn reset(&mut self) -> Duration {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let timeout = Duration::from_millis(self.rng.random_range(min_ms..=max_ms));
        self.deadline = Instant::now() + timeout;
        timeout
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Fixed-period ticker that only runs while the node leads.
#[derive(Debug)]
pub struct HeartbeatTicker {
    interval: Duration,
    next: Option<Instant>,
}

impl HeartbeatTicker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    /// 启动心跳；立即广播由调用方负责，所以第一次触发在一个周期之后
    pub fn start(&mut self) {
        self.next = Some(Instant::now() + self.interval);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn is_running(&self) -> bool {
        self.next.is_some()
    }

    /// Returns true at most once per period and schedules the next beat.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now >= next => {
                self.next = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
