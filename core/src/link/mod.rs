//! Radio link
//!
//! - `transport`: opening a byte stream to the radio (TCP or serial)
//! - `decode`: turning bytes into [`crate::mesh::DecodedPacket`]s
//! - `monitor`: link state machine and silence detection
//! - `session`: per-connection counters
//! - `backoff`: reconnect delays
//! - `supervisor`: the task tying them together

pub mod backoff;
pub mod decode;
pub mod monitor;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use backoff::{Backoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP};
pub use decode::{decode_object, DecodeError, JsonLinesDecoder, PacketDecoder, DEFAULT_MAX_LINE};
pub use monitor::{
    HealthCheck, HealthMonitor, LinkState, LinkStatus, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_SILENCE_THRESHOLD,
};
pub use session::{ConnectionSession, SessionSummary};
pub use supervisor::{LinkSupervisor, SupervisorConfig};
pub use transport::{
    AnyTransport, LinkStream, LinkTransport, SerialTransport, TcpTransport, TransportError,
    TransportKind, DEFAULT_BAUD_RATE, DEFAULT_CONNECT_TIMEOUT,
};
