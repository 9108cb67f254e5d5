//! Bridge configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::data::{RetentionError, RetentionPolicy};
use crate::link::{
    AnyTransport, SerialTransport, SupervisorConfig, TcpTransport, DEFAULT_BAUD_RATE,
};
use crate::mesh::{NodeId, NodeIdError};
use crate::tasks::DEFAULT_INGEST_QUEUE_CAPACITY;

/// How to reach the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// USB/serial attached radio
    Serial { path: String, baud_rate: u32 },
    /// Network attached radio, `host:port`
    Tcp { addr: String },
}

impl TransportConfig {
    pub fn serial(path: impl Into<String>) -> Self {
        TransportConfig::Serial {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        TransportConfig::Tcp { addr: addr.into() }
    }

    /// Build the concrete transport
    pub fn build(&self, connect_timeout: Duration) -> AnyTransport {
        match self {
            TransportConfig::Serial { path, baud_rate } => AnyTransport::Serial(
                SerialTransport::new(path.clone())
                    .with_baud_rate(*baud_rate)
                    .with_connect_timeout(connect_timeout),
            ),
            TransportConfig::Tcp { addr } => AnyTransport::Tcp(
                TcpTransport::new(addr.clone()).with_connect_timeout(connect_timeout),
            ),
        }
    }
}

/// Rejected configuration; reported before any link is opened
#[derive(Debug)]
pub enum ConfigError {
    /// A value that must be positive was zero
    Zero(&'static str),
    /// A value outside its accepted range
    OutOfRange { field: &'static str, reason: String },
    /// Local node id did not parse
    LocalNode(NodeIdError),
    /// Retention window rejected
    Retention(RetentionError),
    /// Transport endpoint is empty or malformed
    Transport(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Zero(field) => write!(f, "{} must be greater than zero", field),
            ConfigError::OutOfRange { field, reason } => write!(f, "{}: {}", field, reason),
            ConfigError::LocalNode(e) => write!(f, "invalid local node id: {}", e),
            ConfigError::Retention(e) => write!(f, "{}", e),
            ConfigError::Transport(e) => write!(f, "invalid transport: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<RetentionError> for ConfigError {
    fn from(e: RetentionError) -> Self {
        ConfigError::Retention(e)
    }
}

impl From<NodeIdError> for ConfigError {
    fn from(e: NodeIdError) -> Self {
        ConfigError::LocalNode(e)
    }
}

/// Configuration for a bridge process
#[derive(Clone)]
pub struct BridgeConfig {
    /// Path to the database file
    /// If None, the store lives in memory
    pub db_path: Option<PathBuf>,

    /// Radio to supervise
    /// If None, only the relay entry point feeds the store
    pub transport: Option<TransportConfig>,

    /// Our own radio's node id, in any accepted encoding
    /// Never used as an inference target
    pub local_node: Option<String>,

    /// Live link with no packet for longer than this is silent (seconds)
    /// Default: 120
    pub silence_threshold_secs: u64,

    /// Health check period (seconds)
    /// Default: 30
    pub health_check_interval_secs: u64,

    /// Bound on one connect attempt (seconds)
    /// Default: 10
    pub connect_timeout_secs: u64,

    /// Settle delay after connect (milliseconds)
    /// If None, the transport kind's default is used (TCP 5 s, serial 1 s)
    pub stabilization_delay_ms: Option<u64>,

    /// First reconnect delay (milliseconds)
    /// Default: 2000
    pub backoff_base_ms: u64,

    /// Longest reconnect delay (seconds)
    /// Default: 300
    pub backoff_cap_secs: u64,

    /// Packet log retention (seconds)
    /// Default: 48 hours
    pub packet_retention_secs: u64,

    /// Neighbor edge retention (seconds)
    /// Default: 30 days
    pub edge_retention_secs: u64,

    /// Node statistics retention (seconds)
    /// Default: 30 days
    pub stat_retention_secs: u64,

    /// Retention sweep interval (seconds)
    /// Default: 3600 (1 hour)
    pub cleanup_interval_secs: u64,

    /// Compact storage after this many sweeps
    /// Default: 24
    pub compact_every_sweeps: u32,

    /// Compact early once this many rows were deleted
    /// Default: 50000
    pub compact_row_threshold: usize,

    /// Depth of the ingest queue
    /// Default: 1024
    pub ingest_queue_capacity: usize,

    /// Default distance limit for topology queries (kilometres)
    pub max_distance_km: Option<f64>,
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("db_path", &self.db_path)
            .field("transport", &self.transport)
            .field("local_node", &self.local_node)
            .field("silence_threshold_secs", &self.silence_threshold_secs)
            .field("health_check_interval_secs", &self.health_check_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("stabilization_delay_ms", &self.stabilization_delay_ms)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_cap_secs", &self.backoff_cap_secs)
            .field("packet_retention_secs", &self.packet_retention_secs)
            .field("edge_retention_secs", &self.edge_retention_secs)
            .field("stat_retention_secs", &self.stat_retention_secs)
            .field("cleanup_interval_secs", &self.cleanup_interval_secs)
            .field("compact_every_sweeps", &self.compact_every_sweeps)
            .field("compact_row_threshold", &self.compact_row_threshold)
            .field("ingest_queue_capacity", &self.ingest_queue_capacity)
            .field("max_distance_km", &self.max_distance_km)
            .finish()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let retention = RetentionPolicy::default();
        Self {
            db_path: None,
            transport: None,
            local_node: None,
            silence_threshold_secs: 120,
            health_check_interval_secs: 30,
            connect_timeout_secs: 10,
            stabilization_delay_ms: None,
            backoff_base_ms: 2_000,
            backoff_cap_secs: 300,
            packet_retention_secs: retention.packets.as_secs(),
            edge_retention_secs: retention.neighbor_edges.as_secs(),
            stat_retention_secs: retention.node_stats.as_secs(),
            cleanup_interval_secs: 3600,
            compact_every_sweeps: 24,
            compact_row_threshold: 50_000,
            ingest_queue_capacity: DEFAULT_INGEST_QUEUE_CAPACITY,
            max_distance_km: None,
        }
    }
}

impl BridgeConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for testing (short timers, in-memory store)
    pub fn for_testing() -> Self {
        Self {
            db_path: None,
            transport: None,
            local_node: None,
            silence_threshold_secs: 10,
            health_check_interval_secs: 2,
            connect_timeout_secs: 2,
            stabilization_delay_ms: Some(10),
            backoff_base_ms: 100,
            backoff_cap_secs: 2,
            packet_retention_secs: 2 * 60 * 60,
            edge_retention_secs: 24 * 60 * 60,
            stat_retention_secs: 24 * 60 * 60,
            cleanup_interval_secs: 5,
            compact_every_sweeps: 2,
            compact_row_threshold: 100,
            ingest_queue_capacity: 64,
            max_distance_km: None,
        }
    }

    /// Set the database path
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Set the radio transport
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set our own node id
    pub fn with_local_node(mut self, node: impl Into<String>) -> Self {
        self.local_node = Some(node.into());
        self
    }

    /// Set the silence threshold
    pub fn with_silence_threshold(mut self, secs: u64) -> Self {
        self.silence_threshold_secs = secs;
        self
    }

    /// Set the health check interval
    pub fn with_health_check_interval(mut self, secs: u64) -> Self {
        self.health_check_interval_secs = secs;
        self
    }

    /// Set packet retention
    pub fn with_packet_retention(mut self, secs: u64) -> Self {
        self.packet_retention_secs = secs;
        self
    }

    /// Set neighbor edge retention
    pub fn with_edge_retention(mut self, secs: u64) -> Self {
        self.edge_retention_secs = secs;
        self
    }

    /// Set node statistics retention
    pub fn with_stat_retention(mut self, secs: u64) -> Self {
        self.stat_retention_secs = secs;
        self
    }

    /// Set the retention sweep interval
    pub fn with_cleanup_interval(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Set the default topology distance limit
    pub fn with_max_distance_km(mut self, km: f64) -> Self {
        self.max_distance_km = Some(km);
        self
    }

    /// Set the ingest queue depth
    pub fn with_ingest_queue_capacity(mut self, capacity: usize) -> Self {
        self.ingest_queue_capacity = capacity;
        self
    }

    /// Retention windows as a policy
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            packets: Duration::from_secs(self.packet_retention_secs),
            neighbor_edges: Duration::from_secs(self.edge_retention_secs),
            node_stats: Duration::from_secs(self.stat_retention_secs),
        }
    }

    /// Supervisor timing derived from this config
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            silence_threshold: Duration::from_secs(self.silence_threshold_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            stabilization_delay: self.stabilization_delay_ms.map(Duration::from_millis),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }

    /// Parsed local node id
    pub fn local_node_id(&self) -> Result<Option<NodeId>, ConfigError> {
        match self.local_node.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let id = NodeId::parse(raw)?;
                if id.is_broadcast() {
                    return Err(ConfigError::OutOfRange {
                        field: "local_node",
                        reason: "broadcast id cannot be a local node".to_string(),
                    });
                }
                Ok(Some(id))
            }
        }
    }

    /// Check every value; nothing is started when this fails
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("silence_threshold_secs", self.silence_threshold_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_cap_secs", self.backoff_cap_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        if self.ingest_queue_capacity == 0 {
            return Err(ConfigError::Zero("ingest_queue_capacity"));
        }
        if self.compact_every_sweeps == 0 {
            return Err(ConfigError::Zero("compact_every_sweeps"));
        }
        if self.backoff_cap_secs.saturating_mul(1000) < self.backoff_base_ms {
            return Err(ConfigError::OutOfRange {
                field: "backoff_cap_secs",
                reason: "cap is shorter than the base delay".to_string(),
            });
        }
        if let Some(km) = self.max_distance_km {
            if !km.is_finite() || km <= 0.0 {
                return Err(ConfigError::OutOfRange {
                    field: "max_distance_km",
                    reason: format!("{} is not a positive distance", km),
                });
            }
        }

        self.retention().validate()?;
        self.local_node_id()?;

        match &self.transport {
            Some(TransportConfig::Serial { path, baud_rate }) => {
                if path.trim().is_empty() {
                    return Err(ConfigError::Transport("serial path is empty".to_string()));
                }
                if *baud_rate == 0 {
                    return Err(ConfigError::Zero("baud_rate"));
                }
            }
            Some(TransportConfig::Tcp { addr }) => {
                let valid = addr
                    .rsplit_once(':')
                    .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                    .unwrap_or(false);
                if !valid {
                    return Err(ConfigError::Transport(format!(
                        "expected host:port, got {:?}",
                        addr
                    )));
                }
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.silence_threshold_secs, 120);
        assert_eq!(config.packet_retention_secs, 48 * 60 * 60);
        assert_eq!(config.edge_retention_secs, 30 * 24 * 60 * 60);
        assert_eq!(config.compact_every_sweeps, 24);
        assert_eq!(config.ingest_queue_capacity, 1024);
        assert!(config.transport.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config_is_valid() {
        let config = BridgeConfig::for_testing();
        assert!(config.validate().is_ok());
        assert!(config.silence_threshold_secs < BridgeConfig::default().silence_threshold_secs);
    }

    #[test]
    fn test_builder_chain() {
        let config = BridgeConfig::new()
            .with_db_path(PathBuf::from("/tmp/mesh.db"))
            .with_transport(TransportConfig::tcp("192.168.1.20:4403"))
            .with_local_node("!16fa4fdc")
            .with_silence_threshold(300)
            .with_packet_retention(3600);

        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/mesh.db")));
        assert_eq!(config.silence_threshold_secs, 300);
        assert_eq!(config.retention().packets, Duration::from_secs(3600));
        assert_eq!(
            config.local_node_id().unwrap(),
            Some(NodeId::new(0x16fa4fdc).unwrap())
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = BridgeConfig::new().with_silence_threshold(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("silence_threshold_secs"))
        ));

        let config = BridgeConfig::new().with_ingest_queue_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("ingest_queue_capacity"))
        ));
    }

    #[test]
    fn test_retention_rejected() {
        let config = BridgeConfig::new().with_edge_retention(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Retention(_)));
        assert!(err.to_string().contains("neighbor_edges"));
    }

    #[test]
    fn test_bad_local_node_rejected() {
        let config = BridgeConfig::new().with_local_node("not-a-node");
        assert!(matches!(config.validate(), Err(ConfigError::LocalNode(_))));

        let config = BridgeConfig::new().with_local_node("!ffffffff");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "local_node", .. })
        ));
    }

    #[test]
    fn test_transport_validation() {
        let config = BridgeConfig::new().with_transport(TransportConfig::tcp("radio.local"));
        assert!(matches!(config.validate(), Err(ConfigError::Transport(_))));

        let config = BridgeConfig::new().with_transport(TransportConfig::serial("  "));
        assert!(matches!(config.validate(), Err(ConfigError::Transport(_))));

        let config = BridgeConfig::new().with_transport(TransportConfig::serial("/dev/ttyUSB0"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_distance_limit_must_be_positive() {
        let config = BridgeConfig::new().with_max_distance_km(-5.0);
        assert!(config.validate().is_err());
        let config = BridgeConfig::new().with_max_distance_km(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supervisor_config_mapping() {
        let config = BridgeConfig::for_testing();
        let supervisor = config.supervisor();
        assert_eq!(supervisor.silence_threshold, Duration::from_secs(10));
        assert_eq!(supervisor.stabilization_delay, Some(Duration::from_millis(10)));
        assert_eq!(supervisor.backoff_base, Duration::from_millis(100));
    }

    #[test]
    fn test_debug_lists_transport() {
        let config = BridgeConfig::new().with_transport(TransportConfig::serial("/dev/ttyACM0"));
        let debug_output = format!("{:?}", config);
        assert!(debug_output.contains("/dev/ttyACM0"));
        assert!(debug_output.contains("silence_threshold_secs: 120"));
    }
}
