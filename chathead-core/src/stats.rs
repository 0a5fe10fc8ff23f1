//! Network traffic meter behind `bytes_sent_last_second` and
//! `bytes_received_last_second`.
//!
//! Bytes are binned into ten 100 ms buckets per direction. Reading the
//! meter sums the buckets that still overlap the last second, so the
//! figure trails real time by at most one bucket. No allocation after
//! construction; the worker records every datagram.

use std::time::{Duration, Instant};

const BUCKET: Duration = Duration::from_millis(100);
const BUCKETS: usize = 10;

/// Sent and received bytes over the last second.
#[derive(Debug)]
pub struct TrafficMeter {
    origin: Instant,
    sent: Buckets,
    received: Buckets,
}

impl TrafficMeter {
    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            sent: Buckets::default(),
            received: Buckets::default(),
        }
    }

    pub fn record_sent(&mut self, now: Instant, bytes: usize) {
        let tick = self.tick(now);
        self.sent.add(tick, bytes as u64);
    }

    pub fn record_received(&mut self, now: Instant, bytes: usize) {
        let tick = self.tick(now);
        self.received.add(tick, bytes as u64);
    }

    /// `(sent, received)` during the second ending at `now`.
    pub fn last_second(&mut self, now: Instant) -> (u64, u64) {
        let tick = self.tick(now);
        (self.sent.total(tick), self.received.total(tick))
    }

    fn tick(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / BUCKET.as_nanos()) as u64
    }
}

/// One direction: a ring of per-bucket byte counts ending at `head`.
#[derive(Debug, Default)]
struct Buckets {
    bytes: [u64; BUCKETS],
    head: u64,
}

impl Buckets {
    fn add(&mut self, tick: u64, bytes: u64) {
        self.advance(tick);
        // Late samples still land in their bucket while it is live.
        if self.head - tick < BUCKETS as u64 {
            let slot = &mut self.bytes[(tick % BUCKETS as u64) as usize];
            *slot = slot.saturating_add(bytes);
        }
    }

    fn total(&mut self, tick: u64) -> u64 {
        self.advance(tick);
        self.bytes.iter().sum()
    }

    /// Move `head` forward to `tick`, zeroing the buckets that expire.
    fn advance(&mut self, tick: u64) {
        if tick <= self.head {
            return;
        }
        let expired = (tick - self.head).min(BUCKETS as u64);
        for step in 1..=expired {
            self.bytes[((self.head + step) % BUCKETS as u64) as usize] = 0;
        }
        self.head = tick;
    }
}

// ── Tests ────────────────────────────────────────────────────────
