//! Packet decoding at the ingestion boundary
//!
//! Producers disagree on field names for the same value (`channel` vs
//! `channel_index`, `fromId` vs `from`, ...). Every logical field has one
//! ordered candidate list in [`fields`]; the first candidate present with a
//! non-null value wins. Nothing past this module looks at raw JSON.

use serde_json::{Map, Value};
use tracing::trace;

use crate::data::current_timestamp;
use crate::mesh::{
    DecodedPacket, PacketKind, PacketPayload, Position, Provenance, RawNeighborEntry,
    RawNeighborReport, Telemetry,
};

/// Longest line accepted before the buffer is discarded
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Ordered candidate names per logical field
pub mod fields {
    pub const FROM: &[&str] = &["from", "fromId", "from_id", "sender"];
    pub const TO: &[&str] = &["to", "toId", "to_id", "destination"];
    pub const KIND: &[&str] = &["type", "portnum", "kind"];
    pub const RECEIVED_AT: &[&str] = &["rxTime", "rx_time", "timestamp"];
    pub const SNR: &[&str] = &["snr", "rxSnr", "rx_snr"];
    pub const RSSI: &[&str] = &["rssi", "rxRssi", "rx_rssi"];
    pub const HOPS_AWAY: &[&str] = &["hops_away", "hopsAway", "hops"];
    pub const HOP_START: &[&str] = &["hopStart", "hop_start"];
    pub const HOP_LIMIT: &[&str] = &["hopLimit", "hop_limit"];
    pub const CHANNEL: &[&str] = &["channel", "channel_index", "channelIndex", "chan"];
    pub const SIZE: &[&str] = &["size", "size_bytes", "payload_size"];
    pub const VIA_MQTT: &[&str] = &["viaMqtt", "via_mqtt"];
    pub const PAYLOAD: &[&str] = &["payload", "decoded"];

    pub const LATITUDE: &[&str] = &["latitude", "lat"];
    pub const LATITUDE_I: &[&str] = &["latitude_i", "latitudeI"];
    pub const LONGITUDE: &[&str] = &["longitude", "lon", "lng"];
    pub const LONGITUDE_I: &[&str] = &["longitude_i", "longitudeI"];
    pub const ALTITUDE: &[&str] = &["altitude", "alt"];

    pub const DEVICE_METRICS: &[&str] = &["device_metrics", "deviceMetrics"];
    pub const BATTERY_LEVEL: &[&str] = &["battery_level", "batteryLevel"];
    pub const VOLTAGE: &[&str] = &["voltage"];
    pub const CHANNEL_UTILIZATION: &[&str] = &["channel_utilization", "channelUtilization"];
    pub const AIR_UTIL_TX: &[&str] = &["air_util_tx", "airUtilTx"];

    pub const LONG_NAME: &[&str] = &["long_name", "longName", "longname"];
    pub const SHORT_NAME: &[&str] = &["short_name", "shortName", "shortname"];

    pub const OBSERVER: &[&str] = &["node_id", "nodeId"];
    pub const NEIGHBORS: &[&str] = &["neighbors"];
    pub const NEIGHBOR_ID: &[&str] = &["node_id", "nodeId", "id"];
    pub const LAST_RX_TIME: &[&str] = &["last_rx_time", "lastRxTime"];
    pub const BROADCAST_INTERVAL: &[&str] = &[
        "node_broadcast_interval_secs",
        "nodeBroadcastIntervalSecs",
        "broadcast_interval",
    ];
}

/// A single packet could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Line is not valid UTF-8
    InvalidUtf8,
    /// Line looked like JSON but did not parse
    Json(String),
    /// Top-level JSON value is not an object
    NotAnObject,
    /// Required field missing under every candidate name
    MissingField(&'static str),
    /// No newline within the line limit; buffered bytes dropped
    LineTooLong(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidUtf8 => write!(f, "invalid UTF-8"),
            DecodeError::Json(e) => write!(f, "malformed JSON: {}", e),
            DecodeError::NotAnObject => write!(f, "expected a JSON object"),
            DecodeError::MissingField(name) => write!(f, "missing field: {}", name),
            DecodeError::LineTooLong(len) => write!(f, "line too long ({} bytes)", len),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Turns link bytes into packets
///
/// Fed arbitrary chunks; partial frames are buffered until complete.
pub trait PacketDecoder: Send {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<DecodedPacket, DecodeError>>;

    /// Drop buffered partial input (called on every new connection)
    fn reset(&mut self);
}

/// Newline-delimited JSON decoder
///
/// Lines that do not start with `{` are radio console output and are
/// skipped without error.
#[derive(Debug)]
pub struct JsonLinesDecoder {
    buf: Vec<u8>,
    max_line: usize,
    /// Inside an over-long line; skip until the next newline
    discarding: bool,
    clock: fn() -> i64,
}

impl Default for JsonLinesDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLinesDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            max_line: DEFAULT_MAX_LINE,
            discarding: false,
            clock: current_timestamp,
        }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Receive-time source for packets that carry none
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    fn decode_line(&self, raw: &[u8]) -> Option<Result<DecodedPacket, DecodeError>> {
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.trim(),
            Err(_) => return Some(Err(DecodeError::InvalidUtf8)),
        };
        if text.is_empty() {
            return None;
        }
        if !text.starts_with('{') {
            trace!(line = %text, "Skipping non-JSON line");
            return None;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return Some(Err(DecodeError::Json(e.to_string()))),
        };
        let Some(obj) = value.as_object() else {
            return Some(Err(DecodeError::NotAnObject));
        };
        Some(decode_object(obj, text.len() as u32, (self.clock)()))
    }
}

impl PacketDecoder for JsonLinesDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<DecodedPacket, DecodeError>> {
        let mut out = Vec::new();
        self.buf.extend_from_slice(bytes);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(result) = self.decode_line(&line[..pos]) {
                out.push(result);
            }
        }

        if self.buf.len() > self.max_line {
            if !self.discarding {
                out.push(Err(DecodeError::LineTooLong(self.buf.len())));
            }
            self.buf.clear();
            self.discarding = true;
        }
        out
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}

/// Decode one JSON object into a packet
pub fn decode_object(
    obj: &Map<String, Value>,
    line_len: u32,
    now: i64,
) -> Result<DecodedPacket, DecodeError> {
    let from = field(obj, fields::FROM)
        .and_then(node_text)
        .ok_or(DecodeError::MissingField("from"))?;

    // Payload fields are nested for some producers and flat for others
    let body = field(obj, fields::PAYLOAD)
        .and_then(Value::as_object)
        .unwrap_or(obj);

    let kind = match field(obj, fields::KIND).and_then(Value::as_str) {
        Some(name) => PacketKind::from_name(name),
        None if field(body, fields::NEIGHBORS).is_some() => PacketKind::NeighborInfo,
        None => PacketKind::Other,
    };

    let received_at = field(obj, fields::RECEIVED_AT)
        .and_then(as_i64)
        .filter(|t| *t > 0)
        .unwrap_or(now);

    let mut packet = DecodedPacket::new(received_at, from, kind);
    packet.to = field(obj, fields::TO).and_then(node_text);
    packet.snr = field(obj, fields::SNR).and_then(as_f64);
    packet.rssi = field(obj, fields::RSSI)
        .and_then(as_i64)
        .and_then(|v| i32::try_from(v).ok());
    packet.hops_away = field(obj, fields::HOPS_AWAY)
        .and_then(as_u32)
        .or_else(|| {
            let start = field(obj, fields::HOP_START).and_then(as_u32)?;
            let limit = field(obj, fields::HOP_LIMIT).and_then(as_u32)?;
            start.checked_sub(limit)
        });
    packet.channel = field(obj, fields::CHANNEL).and_then(as_u32);
    packet.size_bytes = field(obj, fields::SIZE).and_then(as_u32).unwrap_or(line_len);
    if field(obj, fields::VIA_MQTT).and_then(Value::as_bool) == Some(true) {
        packet.provenance = Provenance::RelayBridge;
    }

    match kind {
        PacketKind::Position => {
            packet.payload = position(body).map(PacketPayload::Position);
        }
        PacketKind::Telemetry => {
            let metrics = field(body, fields::DEVICE_METRICS)
                .and_then(Value::as_object)
                .unwrap_or(body);
            packet.payload = telemetry(metrics).map(PacketPayload::Telemetry);
        }
        PacketKind::NodeInfo => {
            let long_name = field(body, fields::LONG_NAME)
                .and_then(Value::as_str)
                .map(str::to_string);
            let short_name = field(body, fields::SHORT_NAME)
                .and_then(Value::as_str)
                .map(str::to_string);
            if long_name.is_some() || short_name.is_some() {
                packet.payload = Some(PacketPayload::NodeInfo { long_name, short_name });
            }
        }
        PacketKind::NeighborInfo => {
            packet.neighbor_report = Some(neighbor_report(body, &packet.from)?);
        }
        _ => {}
    }

    Ok(packet)
}

fn position(body: &Map<String, Value>) -> Option<Position> {
    let latitude = field(body, fields::LATITUDE).and_then(as_f64).or_else(|| {
        field(body, fields::LATITUDE_I)
            .and_then(as_i64)
            .map(|v| v as f64 * 1e-7)
    })?;
    let longitude = field(body, fields::LONGITUDE).and_then(as_f64).or_else(|| {
        field(body, fields::LONGITUDE_I)
            .and_then(as_i64)
            .map(|v| v as f64 * 1e-7)
    })?;
    Some(Position {
        latitude,
        longitude,
        altitude: field(body, fields::ALTITUDE).and_then(as_f64),
    })
}

fn telemetry(metrics: &Map<String, Value>) -> Option<Telemetry> {
    let telemetry = Telemetry {
        battery_level: field(metrics, fields::BATTERY_LEVEL).and_then(as_u32),
        voltage: field(metrics, fields::VOLTAGE).and_then(as_f64),
        channel_utilization: field(metrics, fields::CHANNEL_UTILIZATION).and_then(as_f64),
        air_util_tx: field(metrics, fields::AIR_UTIL_TX).and_then(as_f64),
    };
    if telemetry == Telemetry::default() {
        None
    } else {
        Some(telemetry)
    }
}

fn neighbor_report(body: &Map<String, Value>, from: &str) -> Result<RawNeighborReport, DecodeError> {
    let list = field(body, fields::NEIGHBORS)
        .and_then(Value::as_array)
        .ok_or(DecodeError::MissingField("neighbors"))?;

    let observer = field(body, fields::OBSERVER)
        .and_then(node_text)
        .unwrap_or_else(|| from.to_string());

    let neighbors = list
        .iter()
        .filter_map(Value::as_object)
        .map(|entry| RawNeighborEntry {
            // Kept even when missing so the recorder can count the drop
            node_id: field(entry, fields::NEIGHBOR_ID)
                .and_then(node_text)
                .unwrap_or_default(),
            snr: field(entry, fields::SNR).and_then(as_f64),
            last_rx_time: field(entry, fields::LAST_RX_TIME).and_then(as_i64),
            broadcast_interval_secs: field(entry, fields::BROADCAST_INTERVAL).and_then(as_u32),
        })
        .collect();

    Ok(RawNeighborReport {
        observer,
        broadcast_interval_secs: field(body, fields::BROADCAST_INTERVAL).and_then(as_u32),
        neighbors,
    })
}

/// First candidate present with a non-null value
fn field<'a>(obj: &'a Map<String, Value>, candidates: &[&str]) -> Option<&'a Value> {
    candidates
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|v| !v.is_null())
}

/// Node ids arrive as strings or bare JSON numbers
fn node_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_u64().map(|v| v.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    as_i64(value).and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_clock() -> i64 {
        1_700_000_000
    }

    fn decoder() -> JsonLinesDecoder {
        JsonLinesDecoder::new().with_clock(fixed_clock)
    }

    fn decode_one(line: &str) -> Result<DecodedPacket, DecodeError> {
        let mut d = decoder();
        let mut out = d.push(format!("{}\n", line).as_bytes());
        assert_eq!(out.len(), 1, "expected one result for {}", line);
        out.remove(0)
    }

    #[test]
    fn test_text_message() {
        let packet = decode_one(
            r#"{"from": 385503196, "to": 4294967295, "type": "TEXT_MESSAGE_APP", "snr": 6.25, "rssi": -95, "hopsAway": 2, "channel": 0, "rxTime": 1700000500}"#,
        )
        .unwrap();
        assert_eq!(packet.from, "385503196");
        assert_eq!(packet.to.as_deref(), Some("4294967295"));
        assert_eq!(packet.kind, PacketKind::TextMessage);
        assert_eq!(packet.snr, Some(6.25));
        assert_eq!(packet.rssi, Some(-95));
        assert_eq!(packet.hops_away, Some(2));
        assert_eq!(packet.channel, Some(0));
        assert_eq!(packet.received_at, 1_700_000_500);
        assert_eq!(packet.provenance, Provenance::DirectRadio);
    }

    #[test]
    fn test_channel_spellings() {
        for name in fields::CHANNEL {
            let packet = decode_one(&format!(r#"{{"from": "!0000000a", "{}": 3}}"#, name)).unwrap();
            assert_eq!(packet.channel, Some(3), "field {}", name);
        }
    }

    #[test]
    fn test_candidate_order_wins() {
        let packet =
            decode_one(r#"{"from": "!0000000a", "channel_index": 5, "channel": 2}"#).unwrap();
        assert_eq!(packet.channel, Some(2));

        // Null does not shadow a later candidate
        let packet =
            decode_one(r#"{"from": null, "fromId": "!0000000b", "channel": null, "chan": 1}"#)
                .unwrap();
        assert_eq!(packet.from, "!0000000b");
        assert_eq!(packet.channel, Some(1));
    }

    #[test]
    fn test_defaults() {
        let line = r#"{"sender": "!0000000a"}"#;
        let packet = decode_one(line).unwrap();
        assert_eq!(packet.kind, PacketKind::Other);
        assert_eq!(packet.received_at, fixed_clock());
        assert_eq!(packet.size_bytes, line.len() as u32);
        assert!(packet.to.is_none());
    }

    #[test]
    fn test_hops_from_start_and_limit() {
        let packet = decode_one(r#"{"from": "!0a", "hopStart": 3, "hopLimit": 1}"#).unwrap();
        assert_eq!(packet.hops_away, Some(2));
    }

    #[test]
    fn test_via_mqtt_is_relay() {
        let packet = decode_one(r#"{"from": "!0a", "viaMqtt": true}"#).unwrap();
        assert_eq!(packet.provenance, Provenance::RelayBridge);
    }

    #[test]
    fn test_position_payload() {
        let packet = decode_one(
            r#"{"from": "!0a", "type": "position", "payload": {"latitude_i": 475000000, "longitude_i": 85000000, "altitude": 410}}"#,
        )
        .unwrap();
        match packet.payload {
            Some(PacketPayload::Position(p)) => {
                assert!((p.latitude - 47.5).abs() < 1e-9);
                assert!((p.longitude - 8.5).abs() < 1e-9);
                assert_eq!(p.altitude, Some(410.0));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_telemetry_payload() {
        let packet = decode_one(
            r#"{"from": "!0a", "portnum": "TELEMETRY_APP", "decoded": {"deviceMetrics": {"batteryLevel": 87, "voltage": 4.01, "channelUtilization": 12.5}}}"#,
        )
        .unwrap();
        assert_eq!(
            packet.payload,
            Some(PacketPayload::Telemetry(Telemetry {
                battery_level: Some(87),
                voltage: Some(4.01),
                channel_utilization: Some(12.5),
                air_util_tx: None,
            }))
        );
    }

    #[test]
    fn test_node_info_payload() {
        let packet = decode_one(
            r#"{"from": "!0a", "type": "nodeinfo", "payload": {"longname": "Ridge", "shortname": "RDG"}}"#,
        )
        .unwrap();
        assert_eq!(
            packet.payload,
            Some(PacketPayload::NodeInfo {
                long_name: Some("Ridge".to_string()),
                short_name: Some("RDG".to_string()),
            })
        );
    }

    #[test]
    fn test_neighbor_report() {
        let packet = decode_one(
            r#"{"from": 385503196, "type": "neighborinfo", "payload": {"node_broadcast_interval_secs": 900, "neighbors": [{"node_id": 10, "snr": 7.5, "last_rx_time": 1699999990}, {"nodeId": "!0000000b", "snr": -3}, {"snr": 1}]}}"#,
        )
        .unwrap();
        let report = packet.neighbor_report.unwrap();
        assert_eq!(report.observer, "385503196");
        assert_eq!(report.broadcast_interval_secs, Some(900));
        assert_eq!(report.neighbors.len(), 3);
        assert_eq!(report.neighbors[0].node_id, "10");
        assert_eq!(report.neighbors[0].last_rx_time, Some(1_699_999_990));
        assert_eq!(report.neighbors[1].node_id, "!0000000b");
        assert_eq!(report.neighbors[1].snr, Some(-3.0));
        assert_eq!(report.neighbors[2].node_id, "");
    }

    #[test]
    fn test_neighbor_kind_inferred_from_shape() {
        let packet = decode_one(r#"{"from": "!0a", "neighbors": []}"#).unwrap();
        assert_eq!(packet.kind, PacketKind::NeighborInfo);
        assert!(packet.neighbor_report.unwrap().neighbors.is_empty());
    }

    #[test]
    fn test_neighbor_info_without_list_is_error() {
        assert_eq!(
            decode_one(r#"{"from": "!0a", "type": "NEIGHBORINFO_APP"}"#),
            Err(DecodeError::MissingField("neighbors"))
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(decode_one(r#"{"to": "!0a"}"#), Err(DecodeError::MissingField("from")));
        assert!(matches!(decode_one(r#"{"from": "#), Err(DecodeError::Json(_))));
        assert!(matches!(decode_one("{}[]"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_chunked_input_and_console_noise() {
        let mut d = decoder();
        assert!(d.push(b"INFO | ??:??:?? booting\n{\"from\": \"!0").is_empty());
        assert!(d.push(b"a\", \"type\": \"text\"").is_empty());
        let out = d.push(b"}\r\n\n{\"from\": \"!0b\"}\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().from, "!0a");
        assert_eq!(out[1].as_ref().unwrap().from, "!0b");
    }

    #[test]
    fn test_over_long_line_discarded() {
        let mut d = decoder().with_max_line(16);
        let out = d.push(b"{\"from\": \"!0a\", \"padding\": \"xxxxxxxx");
        assert_eq!(out, vec![Err(DecodeError::LineTooLong(36))]);

        // Rest of the long line is skipped, next line decodes
        let out = d.push(b"yyyy\"}\n{\"from\": \"!0b\"}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().from, "!0b");
    }

    #[test]
    fn test_reset_drops_partial_line() {
        let mut d = decoder();
        assert!(d.push(b"{\"from\": \"!0a\"").is_empty());
        d.reset();
        let out = d.push(b"{\"from\": \"!0b\"}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().from, "!0b");
    }

    #[test]
    fn test_invalid_utf8() {
        let mut d = decoder();
        let out = d.push(b"{\"from\": \"\xff\"}\n");
        assert_eq!(out, vec![Err(DecodeError::InvalidUtf8)]);
    }
}
