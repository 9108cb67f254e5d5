//! Canonical node identifiers
//!
//! Radio firmware, relay bridges and JSON exporters all spell the same
//! 32-bit node number differently:
//! - decimal: `385503196`
//! - `!`-prefixed hex: `!16fa4fdc`
//! - `0x`-prefixed hex: `0x16FA4FDC`
//! - bare hex: `16fa4fdc`
//!
//! Every one of them must collapse into the same [`NodeId`] before it is
//! used as a storage key, otherwise joins between tables silently miss.
//!
//! # Ambiguity
//!
//! A bare string made only of decimal digits is always read as decimal.
//! Bare hex is accepted only when it contains at least one `a-f` letter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Canonical identifier of a mesh node (the radio's 32-bit node number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

/// Error when a textual node identifier cannot be normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeIdError {
    /// Nothing left after trimming
    Empty,
    /// Not decimal and not hex
    Malformed(String),
    /// Parsed, but does not fit in 32 bits
    OutOfRange(String),
    /// Node number zero is never assigned to a radio
    Zero,
}

impl fmt::Display for NodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeIdError::Empty => write!(f, "empty node id"),
            NodeIdError::Malformed(s) => write!(f, "malformed node id: {:?}", s),
            NodeIdError::OutOfRange(s) => write!(f, "node id out of range: {:?}", s),
            NodeIdError::Zero => write!(f, "node id zero is reserved"),
        }
    }
}

impl std::error::Error for NodeIdError {}

impl NodeId {
    /// Destination used by packets addressed to everyone
    pub const BROADCAST: NodeId = NodeId(u32::MAX);

    /// Wrap a raw node number, rejecting the reserved zero value
    pub fn new(num: u32) -> Result<Self, NodeIdError> {
        if num == 0 {
            return Err(NodeIdError::Zero);
        }
        Ok(NodeId(num))
    }

    /// Normalize a numeric identifier (e.g. a JSON number)
    pub fn from_number(num: u64) -> Result<Self, NodeIdError> {
        let num = u32::try_from(num).map_err(|_| NodeIdError::OutOfRange(num.to_string()))?;
        Self::new(num)
    }

    /// Normalize any supported textual encoding
    pub fn parse(raw: &str) -> Result<Self, NodeIdError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }

        let (digits, radix) = if let Some(rest) = s.strip_prefix('!') {
            (rest, 16)
        } else if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            (rest, 16)
        } else if s.bytes().all(|b| b.is_ascii_digit()) {
            (s, 10)
        } else if s.bytes().all(|b| b.is_ascii_hexdigit()) {
            (s, 16)
        } else {
            return Err(NodeIdError::Malformed(raw.to_string()));
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(NodeIdError::Malformed(raw.to_string()));
        }

        // Digits are already validated, so the only failure left is overflow
        let value = u64::from_str_radix(digits, radix)
            .map_err(|_| NodeIdError::OutOfRange(raw.to_string()))?;
        Self::from_number(value).map_err(|e| match e {
            NodeIdError::OutOfRange(_) => NodeIdError::OutOfRange(raw.to_string()),
            other => other,
        })
    }

    /// Raw node number
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the all-nodes destination
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Canonical storage key (`!xxxxxxxx`)
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NodeId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl rusqlite::ToSql for NodeId {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.key()))
    }
}

impl rusqlite::types::FromSql for NodeId {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let text = value.as_str()?;
        NodeId::parse(text).map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM: u32 = 385_503_196;

    #[test]
    fn test_all_encodings_of_same_node_agree() {
        let encodings = [
            "385503196",
            "!16fa4fdc",
            "!16FA4FDC",
            "!16Fa4fDc",
            "0x16fa4fdc",
            "0X16FA4FDC",
            "0x16FA4fdc",
            "16fa4fdc",
            "16FA4FDC",
            " 385503196 ",
            "\t!16fa4fdc\n",
            "  0x16fa4fdc",
            "0385503196",
            "!016fa4fdc",
        ];

        let expected = NodeId::new(NUM).unwrap();
        for raw in encodings {
            assert_eq!(NodeId::parse(raw), Ok(expected), "encoding {:?}", raw);
        }
        assert_eq!(NodeId::from_number(NUM as u64), Ok(expected));
    }

    #[test]
    fn test_canonical_key_format() {
        let id = NodeId::parse("385503196").unwrap();
        assert_eq!(id.key(), "!16fa4fdc");

        let small = NodeId::parse("!1").unwrap();
        assert_eq!(small.key(), "!00000001");
        assert_eq!(NodeId::parse("1").unwrap(), small);
    }

    #[test]
    fn test_key_round_trips_through_parse() {
        for num in [1u32, 0xab, 0x0000_ffff, NUM, 0xdead_beef, u32::MAX] {
            let id = NodeId::new(num).unwrap();
            assert_eq!(NodeId::parse(&id.key()), Ok(id));
            assert_eq!(NodeId::parse(&num.to_string()), Ok(id));
            assert_eq!(NodeId::parse(&format!("0x{:x}", num)), Ok(id));
        }
    }

    #[test]
    fn test_all_digit_string_is_decimal() {
        // "12345678" could be hex too; digits only means decimal
        let id = NodeId::parse("12345678").unwrap();
        assert_eq!(id.as_u32(), 12_345_678);
        assert_ne!(id, NodeId::parse("!12345678").unwrap());
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(NodeId::parse(""), Err(NodeIdError::Empty));
        assert_eq!(NodeId::parse("   "), Err(NodeIdError::Empty));
        assert!(matches!(NodeId::parse("!"), Err(NodeIdError::Malformed(_))));
        assert!(matches!(NodeId::parse("0x"), Err(NodeIdError::Malformed(_))));
        assert!(matches!(NodeId::parse("!xyz"), Err(NodeIdError::Malformed(_))));
        assert!(matches!(NodeId::parse("node-7"), Err(NodeIdError::Malformed(_))));
        assert!(matches!(NodeId::parse("-5"), Err(NodeIdError::Malformed(_))));
        assert!(matches!(NodeId::parse("!!16fa4fdc"), Err(NodeIdError::Malformed(_))));
        assert!(matches!(NodeId::parse("!16fa 4fdc"), Err(NodeIdError::Malformed(_))));
    }

    #[test]
    fn test_rejects_out_of_range_and_zero() {
        assert!(matches!(NodeId::parse("4294967296"), Err(NodeIdError::OutOfRange(_))));
        assert!(matches!(NodeId::parse("!100000000"), Err(NodeIdError::OutOfRange(_))));
        assert!(matches!(
            NodeId::parse("999999999999999999999999"),
            Err(NodeIdError::OutOfRange(_))
        ));
        assert_eq!(NodeId::parse("0"), Err(NodeIdError::Zero));
        assert_eq!(NodeId::parse("!00000000"), Err(NodeIdError::Zero));
        assert_eq!(NodeId::from_number(0), Err(NodeIdError::Zero));
    }

    #[test]
    fn test_broadcast() {
        let id = NodeId::parse("!ffffffff").unwrap();
        assert!(id.is_broadcast());
        assert_eq!(NodeId::parse("4294967295").unwrap(), NodeId::BROADCAST);
    }

    #[test]
    fn test_serde_uses_canonical_key() {
        let id = NodeId::parse("385503196").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"!16fa4fdc\"");

        let back: NodeId = serde_json::from_str("\"0x16FA4FDC\"").unwrap();
        assert_eq!(back, id);
    }
}
