//! Connection session bookkeeping
//!
//! One session per `Live` period of the link. A session is never reused:
//! entering `Live` again always starts from a fresh value.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Trailing window for the packet rate
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on arrivals kept in the window
pub const MAX_WINDOW_ENTRIES: usize = 4096;

/// Counters for the current live period
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    started: Instant,
    /// Unix time the session started (for status output)
    started_at: i64,
    packets: u64,
    bytes: u64,
    last_packet: Option<Instant>,
    /// Arrival instants within the trailing window, oldest first
    window: VecDeque<Instant>,
}

/// What gets logged when a session ends
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionSummary {
    pub started_at: i64,
    pub duration_secs: u64,
    pub packets: u64,
    pub bytes: u64,
    /// Packets per minute over the whole session
    pub average_rate: f64,
}

impl ConnectionSession {
    pub fn new(now: Instant, started_at: i64) -> Self {
        Self {
            started: now,
            started_at,
            packets: 0,
            bytes: 0,
            last_packet: None,
            window: VecDeque::new(),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn last_packet(&self) -> Option<Instant> {
        self.last_packet
    }

    /// Count one inbound packet
    pub fn record_packet(&mut self, now: Instant, bytes: u32) {
        self.packets += 1;
        self.bytes += u64::from(bytes);
        self.last_packet = Some(now);

        self.evict(now);
        if self.window.len() >= MAX_WINDOW_ENTRIES {
            self.window.pop_front();
        }
        self.window.push_back(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) > RATE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Packets seen in the trailing minute
    pub fn rate_per_minute(&self, now: Instant) -> f64 {
        self.window
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= RATE_WINDOW)
            .count() as f64
    }

    pub fn duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Packets per minute since the session started
    pub fn average_rate(&self, now: Instant) -> f64 {
        let secs = self.duration(now).as_secs_f64();
        if secs < 1.0 {
            return self.packets as f64;
        }
        self.packets as f64 * 60.0 / secs
    }

    pub fn summary(&self, now: Instant) -> SessionSummary {
        SessionSummary {
            started_at: self.started_at,
            duration_secs: self.duration(now).as_secs(),
            packets: self.packets,
            bytes: self.bytes,
            average_rate: self.average_rate(now),
        }
    }
}
