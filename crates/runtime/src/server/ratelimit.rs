//! Token-bucket rate limiting, one bucket per (session, tool class).
//!
//! Two classes: write tools at 20/min, read tools at 120/min, both with a
//! ×2 burst. `stats` and mount metadata operations are exempt. Imports
//! charge one token per item on top of the dispatch token. Single-threaded
//! cooperative scheduling means no locks.

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolClass {
    Write,
    Read,
    Exempt,
}

/// Fixed classification of the tool surface.
pub fn classify(tool: &str) -> ToolClass {
    match tool {
        "write" | "propose" | "import" | "consolidate" | "sync" | "reindex" => ToolClass::Write,
        "recall" | "search" | "read" | "export" | "inspect" | "ask" | "loop" => ToolClass::Read,
        "stats" | "mount" => ToolClass::Exempt,
        _ => ToolClass::Read,
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(per_minute: f64, burst: f64, now: Instant) -> Self {
        let capacity = per_minute * burst;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: per_minute / 60.0,
            last: now,
        }
    }

    fn try_take(&mut self, cost: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub write_per_minute: f64,
    pub read_per_minute: f64,
    pub burst_factor: f64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            write_per_minute: 20.0,
            read_per_minute: 120.0,
            burst_factor: 2.0,
        }
    }
}

pub struct RateLimiter {
    limits: RateLimits,
    buckets: HashMap<(String, ToolClass), Bucket>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: HashMap::new(),
        }
    }

    pub fn try_acquire(&mut self, session: &str, class: ToolClass, cost: f64) -> bool {
        self.try_acquire_at(session, class, cost, Instant::now())
    }

    pub(crate) fn try_acquire_at(
        &mut self,
        session: &str,
        class: ToolClass,
        cost: f64,
        now: Instant,
    ) -> bool {
        if class == ToolClass::Exempt {
            return true;
        }
        let per_minute = match class {
            ToolClass::Write => self.limits.write_per_minute,
            ToolClass::Read => self.limits.read_per_minute,
            ToolClass::Exempt => return true,
        };
        let burst = self.limits.burst_factor;
        let bucket = self
            .buckets
            .entry((session.to_string(), class))
            .or_insert_with(|| Bucket::new(per_minute, burst, now));
        bucket.try_take(cost, now)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}
