//! Link health state machine
//!
//! Pure: every method takes `now` and nothing here touches a clock, a
//! socket or a logger. [`super::supervisor`] drives it and does the
//! logging based on the transitions it returns.
//!
//! ```text
//! Disconnected -> Connecting -> Stabilizing -> Live -> Silent -> Reconnecting
//!                    ^                                               |
//!                    +-----------------------------------------------+
//! ```

use std::time::{Duration, Instant};

use serde::Serialize;

use super::session::{ConnectionSession, SessionSummary};

/// Default gap between packets before the link counts as silent
pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::from_secs(120);

/// Default period of the health check timer
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Stabilizing,
    Live,
    Silent,
    Reconnecting,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Stabilizing => "stabilizing",
            LinkState::Live => "live",
            LinkState::Silent => "silent",
            LinkState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a periodic health check
#[derive(Debug, Clone, PartialEq)]
pub enum HealthCheck {
    /// Not live; nothing to report
    Idle,
    /// Live and within the threshold
    Healthy {
        since_last_packet: Option<Duration>,
        rate_per_minute: f64,
        session_packets: u64,
    },
    /// Threshold breached; the link just went silent
    WentSilent {
        silent_for: Duration,
        summary: SessionSummary,
    },
}

/// Snapshot published to status readers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Unix time the current (or last) session went live
    pub session_started_at: Option<i64>,
    pub session_packets: u64,
    pub session_bytes: u64,
    pub rate_per_minute: f64,
    pub seconds_since_last_packet: Option<u64>,
    /// Established links that were torn down
    pub reconnects: u64,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            session_started_at: None,
            session_packets: 0,
            session_bytes: 0,
            rate_per_minute: 0.0,
            seconds_since_last_packet: None,
            reconnects: 0,
        }
    }
}

/// Health monitor for the single active link
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: LinkState,
    silence_threshold: Duration,
    session: Option<ConnectionSession>,
    /// Last packet or, before the first packet, the moment we went live
    last_seen: Option<Instant>,
    reconnects: u64,
}

impl HealthMonitor {
    pub fn new(silence_threshold: Duration) -> Self {
        Self {
            state: LinkState::Disconnected,
            silence_threshold,
            session: None,
            last_seen: None,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn silence_threshold(&self) -> Duration {
        self.silence_threshold
    }

    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Start a connect attempt
    pub fn begin_connect(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// Transport handed us a stream; settle before going live
    pub fn connected(&mut self) {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Stabilizing;
        }
    }

    /// Settle delay elapsed
    ///
    /// The session is replaced here and nowhere else, so counters never
    /// carry data from before this instant.
    pub fn stabilized(&mut self, now: Instant, unix_now: i64) {
        if self.state != LinkState::Stabilizing {
            return;
        }
        self.state = LinkState::Live;
        self.session = Some(ConnectionSession::new(now, unix_now));
        self.last_seen = Some(now);
    }

    /// Count a decoded packet; ignored unless live
    pub fn record_packet(&mut self, now: Instant, bytes: u32) {
        if self.state != LinkState::Live {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.record_packet(now, bytes);
        }
        self.last_seen = Some(now);
    }

    /// Periodic check; the only way into `Silent`
    pub fn check(&mut self, now: Instant) -> HealthCheck {
        if self.state != LinkState::Live {
            return HealthCheck::Idle;
        }

        let elapsed = self
            .last_seen
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();

        if elapsed > self.silence_threshold {
            self.state = LinkState::Silent;
            let summary = match self.session.as_ref() {
                Some(session) => session.summary(now),
                None => ConnectionSession::new(now, 0).summary(now),
            };
            return HealthCheck::WentSilent {
                silent_for: elapsed,
                summary,
            };
        }

        let (rate_per_minute, session_packets, since_last_packet) = match self.session.as_ref() {
            Some(session) => (
                session.rate_per_minute(now),
                session.packets(),
                session.last_packet().map(|t| now.saturating_duration_since(t)),
            ),
            None => (0.0, 0, None),
        };
        HealthCheck::Healthy {
            since_last_packet,
            rate_per_minute,
            session_packets,
        }
    }

    /// Tear the link down and try again
    ///
    /// Called on silence, on a hard transport error and after a failed
    /// connect attempt. Returns the session summary when the link was live
    /// (a hard error skips `Silent`, so the summary has not been logged).
    pub fn begin_reconnect(&mut self, now: Instant) -> Option<SessionSummary> {
        let was_live = self.state == LinkState::Live;
        if matches!(
            self.state,
            LinkState::Stabilizing | LinkState::Live | LinkState::Silent
        ) {
            self.reconnects += 1;
        }
        self.state = LinkState::Reconnecting;
        if was_live {
            self.session.as_ref().map(|s| s.summary(now))
        } else {
            None
        }
    }

    /// Supervisor stopped
    pub fn shutdown(&mut self) {
        self.state = LinkState::Disconnected;
    }

    pub fn status(&self, now: Instant) -> LinkStatus {
        match self.session.as_ref() {
            Some(session) => LinkStatus {
                state: self.state,
                session_started_at: Some(session.started_at()),
                session_packets: session.packets(),
                session_bytes: session.bytes(),
                rate_per_minute: session.rate_per_minute(now),
                seconds_since_last_packet: session
                    .last_packet()
                    .map(|t| now.saturating_duration_since(t).as_secs()),
                reconnects: self.reconnects,
            },
            None => LinkStatus {
                state: self.state,
                reconnects: self.reconnects,
                ..LinkStatus::default()
            },
        }
    }
}
