//! Outbound send-rate throttle.
//!
//! Lock-free so the capture thread can ask "may I send?" every cycle
//! while the consumer adjusts the interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NEVER: u64 = u64::MAX;

/// Minimum-interval gate between accepted sends.
#[derive(Debug)]
pub struct SendThrottle {
    origin: Instant,
    /// Nanoseconds since `origin` of the last accepted send.
    last_send_ns: AtomicU64,
    interval_ns: AtomicU64,
}

impl SendThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_send_ns: AtomicU64::new(NEVER),
            interval_ns: AtomicU64::new(nanos(interval)),
        }
    }

    pub fn can_send(&self) -> bool {
        self.can_send_at(Instant::now())
    }

    /// `true` once `interval` has elapsed since the last accepted send.
    pub fn can_send_at(&self, now: Instant) -> bool {
        let last = self.last_send_ns.load(Ordering::Acquire);
        if last == NEVER {
            return true;
        }
        let elapsed = Duration::from_nanos(self.nanos_at(now).saturating_sub(last));
        elapsed >= self.interval()
    }

    pub fn record_send(&self) {
        self.record_send_at(Instant::now());
    }

    pub fn record_send_at(&self, now: Instant) {
        self.last_send_ns.store(self.nanos_at(now), Ordering::Release);
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_ns.store(nanos(interval), Ordering::Relaxed);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns.load(Ordering::Relaxed))
    }

    /// Forget the last send; the next `can_send` is `true`.
    pub fn reset(&self) {
        self.last_send_ns.store(NEVER, Ordering::Release);
    }

    fn nanos_at(&self, now: Instant) -> u64 {
        // Stays below NEVER for ~584 years of uptime.
        nanos(now.saturating_duration_since(self.origin)).min(NEVER - 1)
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(NEVER - 1)
}
