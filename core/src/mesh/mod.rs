//! Mesh domain types and logic
//!
//! - `node_id`: canonical node identifiers
//! - `packet`: decoded packets and stored records
//! - `recorder`: neighbor reports into edge upserts
//! - `topology`: merge of recorded and inferred edges
//! - `directory`: node names and positions
//! - `geo`: distance helpers

pub mod directory;
pub mod geo;
pub mod node_id;
pub mod packet;
pub mod recorder;
pub mod topology;

pub use directory::{MemoryDirectory, NodeDirectory, NodeIdentity};
pub use node_id::{NodeId, NodeIdError};
pub use packet::{
    DecodedPacket, PacketKind, PacketPayload, PacketRecord, Position, Provenance,
    RawNeighborEntry, RawNeighborReport, Telemetry,
};
pub use recorder::{NeighborRecorder, RecordError, RecordOutcome};
pub use topology::{
    merge, EdgeTag, MergeInput, MergeOptions, TopologyEdge, TopologyNode, TopologySnapshot,
    TopologyStats,
};
