//! Packet types shared between the decoder, the store and the recorder
//!
//! A [`DecodedPacket`] is what a decoder hands us: identifiers are still in
//! whatever textual form the producer used. Ingestion normalizes them and
//! turns the packet into an immutable [`PacketRecord`].

use serde::{Deserialize, Serialize};

use super::node_id::{NodeId, NodeIdError};

/// Destination the firmware uses for channel-wide messages
const BROADCAST_ALIAS: &str = "^all";

/// Application-level packet kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    TextMessage,
    Position,
    NodeInfo,
    Telemetry,
    NeighborInfo,
    Routing,
    Traceroute,
    Admin,
    Other,
}

impl PacketKind {
    /// All kinds, in storage order
    pub const ALL: [PacketKind; 9] = [
        PacketKind::TextMessage,
        PacketKind::Position,
        PacketKind::NodeInfo,
        PacketKind::Telemetry,
        PacketKind::NeighborInfo,
        PacketKind::Routing,
        PacketKind::Traceroute,
        PacketKind::Admin,
        PacketKind::Other,
    ];

    /// Stable name used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::TextMessage => "text_message",
            PacketKind::Position => "position",
            PacketKind::NodeInfo => "node_info",
            PacketKind::Telemetry => "telemetry",
            PacketKind::NeighborInfo => "neighbor_info",
            PacketKind::Routing => "routing",
            PacketKind::Traceroute => "traceroute",
            PacketKind::Admin => "admin",
            PacketKind::Other => "other",
        }
    }

    /// Map a stored or decoded name back to a kind
    ///
    /// Accepts both our storage names and the firmware port names
    /// (`TEXT_MESSAGE_APP`, `NEIGHBORINFO_APP`, ...). Unknown names are
    /// [`PacketKind::Other`].
    pub fn from_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.strip_suffix("_APP").unwrap_or(&upper);
        match base {
            "TEXT_MESSAGE" | "TEXT" => PacketKind::TextMessage,
            "POSITION" => PacketKind::Position,
            "NODE_INFO" | "NODEINFO" => PacketKind::NodeInfo,
            "TELEMETRY" => PacketKind::Telemetry,
            "NEIGHBOR_INFO" | "NEIGHBORINFO" => PacketKind::NeighborInfo,
            "ROUTING" => PacketKind::Routing,
            "TRACEROUTE" => PacketKind::Traceroute,
            "ADMIN" => PacketKind::Admin,
            _ => PacketKind::Other,
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which producer delivered a neighbor report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Heard by our own radio
    DirectRadio,
    /// Collected by a remote relay/bridge and forwarded to us
    RelayBridge,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::DirectRadio => "direct_radio",
            Provenance::RelayBridge => "relay_bridge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "direct_radio" => Some(Provenance::DirectRadio),
            "relay_bridge" => Some(Provenance::RelayBridge),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl Position {
    /// Positions at exactly 0,0 are what firmware reports before a GPS fix
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Device metrics carried by telemetry packets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_util_tx: Option<f64>,
}

/// Decoded application payload kept alongside the packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketPayload {
    Position(Position),
    Telemetry(Telemetry),
    NodeInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        long_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        short_name: Option<String>,
    },
}

/// One entry of a neighbor report, identifiers not yet normalized
#[derive(Debug, Clone, PartialEq)]
pub struct RawNeighborEntry {
    pub node_id: String,
    pub snr: Option<f64>,
    /// When the observer last heard this neighbor (unix secs)
    pub last_rx_time: Option<i64>,
    /// Neighbor's own broadcast interval (secs)
    pub broadcast_interval_secs: Option<u32>,
}

/// Neighbor list reported by an observer
#[derive(Debug, Clone, PartialEq)]
pub struct RawNeighborReport {
    pub observer: String,
    /// Observer's neighbor-info broadcast interval (secs)
    pub broadcast_interval_secs: Option<u32>,
    pub neighbors: Vec<RawNeighborEntry>,
}

/// Packet as produced by a decoder
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Receive time (unix secs)
    pub received_at: i64,
    pub from: String,
    pub to: Option<String>,
    pub kind: PacketKind,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub channel: Option<u32>,
    pub size_bytes: u32,
    pub payload: Option<PacketPayload>,
    pub neighbor_report: Option<RawNeighborReport>,
    pub provenance: Provenance,
}

impl DecodedPacket {
    /// Minimal packet, mostly for tests and relay adapters
    pub fn new(received_at: i64, from: impl Into<String>, kind: PacketKind) -> Self {
        Self {
            received_at,
            from: from.into(),
            to: None,
            kind,
            snr: None,
            rssi: None,
            hops_away: None,
            channel: None,
            size_bytes: 0,
            payload: None,
            neighbor_report: None,
            provenance: Provenance::DirectRadio,
        }
    }

    /// Normalize identifiers and build the immutable record
    ///
    /// A missing destination, or the firmware's `^all`, is broadcast. Any
    /// other id that does not parse drops the whole packet.
    pub fn to_record(&self) -> Result<PacketRecord, NodeIdError> {
        let from = NodeId::parse(&self.from)?;
        let to = match self.to.as_deref().map(str::trim) {
            None | Some(BROADCAST_ALIAS) => NodeId::BROADCAST,
            Some(raw) => NodeId::parse(raw)?,
        };
        Ok(PacketRecord {
            timestamp: self.received_at,
            from,
            to,
            kind: self.kind,
            snr: self.snr,
            rssi: self.rssi,
            hops_away: self.hops_away,
            channel: self.channel,
            size_bytes: self.size_bytes,
            payload: self.payload.clone(),
            source: self.provenance,
        })
    }
}

/// Stored packet (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp: i64,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: PacketKind,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub channel: Option<u32>,
    pub size_bytes: u32,
    pub payload: Option<PacketPayload>,
    /// Hop counts are only meaningful relative to our radio for direct packets
    pub source: Provenance,
}
