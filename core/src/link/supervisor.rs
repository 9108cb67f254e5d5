//! Link supervisor task
//!
//! Owns the single active transport. Connects, waits out the settle delay,
//! pumps bytes through the decoder into the ingest queue and runs the
//! health check timer, all in one task. On silence or a hard error the
//! stream is dropped and the cycle starts over. A session only counts as
//! healthy once it delivers a decoded packet; until then its end is treated
//! like a failed connect and waits out the backoff.

use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::data::current_timestamp;
use crate::tasks::IngestQueue;

use super::backoff::{Backoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP};
use super::decode::PacketDecoder;
use super::monitor::{
    HealthCheck, HealthMonitor, LinkState, LinkStatus, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_SILENCE_THRESHOLD,
};
use super::session::SessionSummary;
use super::transport::{LinkStream, LinkTransport, TransportError};

/// Monotonic now that follows tokio's (possibly paused) clock
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Read buffer size for the link
const READ_BUFFER_SIZE: usize = 4096;

/// Timing knobs for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub silence_threshold: Duration,
    pub health_check_interval: Duration,
    /// Overrides the transport kind's default settle delay
    pub stabilization_delay: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            stabilization_delay: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Why a live period ended
#[derive(Debug)]
enum LinkEnd {
    Silent,
    Failed(TransportError),
    Shutdown,
}

/// Supervises one transport
pub struct LinkSupervisor<T, D> {
    transport: T,
    decoder: D,
    config: SupervisorConfig,
    monitor: HealthMonitor,
    backoff: Backoff,
    /// Current session has delivered at least one packet
    proven: bool,
    ingest: IngestQueue,
    status: watch::Sender<LinkStatus>,
}

impl<T: LinkTransport, D: PacketDecoder> LinkSupervisor<T, D> {
    pub fn new(
        transport: T,
        decoder: D,
        config: SupervisorConfig,
        ingest: IngestQueue,
        status: watch::Sender<LinkStatus>,
    ) -> Self {
        Self {
            monitor: HealthMonitor::new(config.silence_threshold),
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
            proven: false,
            transport,
            decoder,
            config,
            ingest,
            status,
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.monitor.status(now()));
    }

    fn stabilization_delay(&self) -> Duration {
        self.config
            .stabilization_delay
            .unwrap_or_else(|| self.transport.kind().stabilization_delay())
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            transport = %self.transport.kind(),
            endpoint = %self.transport.endpoint(),
            silence_secs = self.config.silence_threshold.as_secs(),
            "Link supervisor started"
        );

        while !*shutdown.borrow() {
            self.monitor.begin_connect();
            self.publish();
            debug!(endpoint = %self.transport.endpoint(), "Link: connecting");

            let connected = tokio::select! {
                result = self.transport.connect() => result,
                _ = shutdown.changed() => break,
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    self.monitor.begin_reconnect(now());
                    self.publish();
                    let delay = self.backoff.next_delay();
                    warn!(
                        endpoint = %self.transport.endpoint(),
                        error = %e,
                        attempt = self.backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Link: connect failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            self.monitor.connected();
            self.publish();
            let settle = self.stabilization_delay();
            debug!(settle_ms = settle.as_millis() as u64, "Link: stabilizing");
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = shutdown.changed() => break,
            }

            self.decoder.reset();
            self.monitor.stabilized(now(), current_timestamp());
            self.proven = false;
            self.publish();
            info!(
                transport = %self.transport.kind(),
                endpoint = %self.transport.endpoint(),
                "Link live"
            );

            match self.pump(stream, &mut shutdown).await {
                LinkEnd::Shutdown => break,
                LinkEnd::Silent => {
                    self.monitor.begin_reconnect(now());
                    warn!(
                        reconnects = self.monitor.reconnects(),
                        "Link reconnecting after silence"
                    );
                }
                LinkEnd::Failed(e) => {
                    if let Some(summary) = self.monitor.begin_reconnect(now()) {
                        log_session_end(&summary, "transport error");
                    }
                    warn!(
                        error = %e,
                        reconnects = self.monitor.reconnects(),
                        "Link reconnecting after transport error"
                    );
                }
            }
            self.publish();

            if !self.proven {
                let delay = self.backoff.next_delay();
                warn!(
                    endpoint = %self.transport.endpoint(),
                    attempt = self.backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Link: session ended before any packet"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        self.monitor.shutdown();
        self.publish();
        info!("Link supervisor stopped");
    }

    /// Read and health-check until the live period ends
    ///
    /// The stream is owned here and dropped on return, which abandons any
    /// read still in flight.
    async fn pump(&mut self, mut stream: LinkStream, shutdown: &mut watch::Receiver<bool>) -> LinkEnd {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut health = tokio::time::interval(self.config.health_check_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        health.tick().await;

        loop {
            tokio::select! {
                read = stream.read(&mut buf) => match read {
                    Ok(0) => return LinkEnd::Failed(TransportError::Closed),
                    Ok(n) => self.handle_bytes(&buf[..n]),
                    Err(e) => return LinkEnd::Failed(TransportError::Io(e)),
                },
                _ = health.tick() => {
                    if self.health_check() {
                        return LinkEnd::Silent;
                    }
                }
                _ = shutdown.changed() => return LinkEnd::Shutdown,
            }
        }
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        for result in self.decoder.push(bytes) {
            match result {
                Ok(packet) => {
                    if !self.proven {
                        self.proven = true;
                        self.backoff.reset();
                    }
                    self.monitor.record_packet(now(), packet.size_bytes);
                    self.ingest.submit(packet);
                }
                Err(e) => {
                    self.ingest.counters().record_decode_error();
                    debug!(error = %e, "Dropping undecodable packet");
                }
            }
        }
    }

    /// Returns true when the link just went silent
    fn health_check(&mut self) -> bool {
        let went_silent = match self.monitor.check(now()) {
            HealthCheck::WentSilent { silent_for, summary } => {
                warn!(
                    silent_secs = silent_for.as_secs(),
                    threshold_secs = self.config.silence_threshold.as_secs(),
                    "Link silent"
                );
                log_session_end(&summary, "silence");
                true
            }
            HealthCheck::Healthy {
                since_last_packet,
                rate_per_minute,
                session_packets,
            } => {
                if self.monitor.state() == LinkState::Live {
                    info!(
                        session_packets = session_packets,
                        rate_per_minute = rate_per_minute,
                        last_packet_secs = since_last_packet.map(|d| d.as_secs()),
                        "Link healthy"
                    );
                }
                false
            }
            HealthCheck::Idle => false,
        };
        self.publish();
        went_silent
    }
}

/// One line with everything an operator needs to tell a slowdown from a stop
fn log_session_end(summary: &SessionSummary, reason: &str) {
    warn!(
        reason = reason,
        duration_secs = summary.duration_secs,
        packets = summary.packets,
        bytes = summary.bytes,
        average_rate_per_minute = summary.average_rate,
        "Link session ended"
    );
}
