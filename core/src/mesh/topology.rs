//! Topology merge
//!
//! Combines recorded neighbor edges with hop-count inference into one
//! tagged edge list. The merge is a pure function over its inputs so it can
//! be tested without a store; [`crate::bridge::QueryService`] feeds it.
//!
//! # Precedence
//!
//! 1. Recorded edges are taken as-is and tagged by provenance
//! 2. An observer with no recorded edge may get one inferred edge towards
//!    a node exactly one hop closer to us
//! 3. Inference never targets a zero-hop node or the local node
//!
//! A pair seen by both our radio and a relay yields two edges with
//! different tags; the same (observer, neighbor, tag) never appears twice.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::data::{HopObservation, NeighborEdge};

use super::directory::{NodeDirectory, NodeIdentity};
use super::geo::distance_km;
use super::node_id::NodeId;
use super::packet::{Position, Provenance};

/// How an edge in the result is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTag {
    /// Neighbor report heard by our own radio
    DirectMeasurement,
    /// Neighbor report forwarded by a relay/bridge
    RelayCollected,
    /// Derived from hop counts, never measured
    Inferred,
}

impl EdgeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeTag::DirectMeasurement => "direct_measurement",
            EdgeTag::RelayCollected => "relay_collected",
            EdgeTag::Inferred => "inferred",
        }
    }
}

impl From<Provenance> for EdgeTag {
    fn from(source: Provenance) -> Self {
        match source {
            Provenance::DirectRadio => EdgeTag::DirectMeasurement,
            Provenance::RelayBridge => EdgeTag::RelayCollected,
        }
    }
}

impl std::fmt::Display for EdgeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One edge of the merged topology
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyEdge {
    pub observer: NodeId,
    pub neighbor: NodeId,
    pub tag: EdgeTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    pub last_seen: i64,
    /// Set when both endpoints have a position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// A node placed on the map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyNode {
    pub id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hops_away: Option<u32>,
    /// Has published at least one neighbor report
    pub reports_topology: bool,
}

/// Counters describing one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopologyStats {
    /// Every node referenced, positioned or not
    pub total_nodes: usize,
    pub unpositioned_nodes: usize,
    pub direct_edges: usize,
    pub relay_edges: usize,
    pub inferred_edges: usize,
    /// Observers without evidence for which no valid target existed
    pub inference_skipped: usize,
    pub dropped_by_distance: usize,
}

/// Result of a topology query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologySnapshot {
    pub since: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_node: Option<NodeId>,
    /// Only nodes with a known position
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
    pub stats: TopologyStats,
}

impl TopologySnapshot {
    pub fn edges_tagged(&self, tag: EdgeTag) -> impl Iterator<Item = &TopologyEdge> {
        self.edges.iter().filter(move |e| e.tag == tag)
    }
}

/// Evidence the merge works from
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeInput<'a> {
    pub since: i64,
    pub edges: &'a [NeighborEdge],
    pub hop_counts: &'a [HopObservation],
    pub reporters: &'a [NodeId],
}

/// Knobs for one merge
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MergeOptions {
    /// Our own radio; never an inference target
    pub local_node: Option<NodeId>,
    /// Drop edges whose endpoints are further apart than this
    pub max_distance_km: Option<f64>,
}

/// Merge recorded and inferred edges
pub fn merge(
    input: &MergeInput<'_>,
    directory: &dyn NodeDirectory,
    options: &MergeOptions,
) -> TopologySnapshot {
    let hops = latest_hops(input.hop_counts);

    // Recorded evidence, one edge per (observer, neighbor, tag), newest kept
    let mut recorded: BTreeMap<(NodeId, NodeId, EdgeTag), TopologyEdge> = BTreeMap::new();
    let mut with_evidence: BTreeSet<NodeId> = BTreeSet::new();
    for edge in input.edges {
        if edge.observer == edge.neighbor
            || edge.observer.is_broadcast()
            || edge.neighbor.is_broadcast()
        {
            continue;
        }
        with_evidence.insert(edge.observer);

        let tag = EdgeTag::from(edge.source);
        let candidate = TopologyEdge {
            observer: edge.observer,
            neighbor: edge.neighbor,
            tag,
            snr: edge.snr,
            last_seen: edge.last_seen,
            distance_km: None,
        };
        recorded
            .entry((edge.observer, edge.neighbor, tag))
            .and_modify(|existing| {
                if candidate.last_seen >= existing.last_seen {
                    *existing = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    let mut stats = TopologyStats::default();
    let mut edges: Vec<TopologyEdge> = recorded.into_values().collect();

    for obs in hops.values() {
        if with_evidence.contains(&obs.node) || Some(obs.node) == options.local_node {
            continue;
        }
        // Zero-hop nodes are heard directly; nothing to infer
        if obs.hops_away == 0 {
            continue;
        }
        match inference_target(obs, &hops, options.local_node) {
            Some(target) => edges.push(TopologyEdge {
                observer: obs.node,
                neighbor: target,
                tag: EdgeTag::Inferred,
                snr: None,
                last_seen: obs.last_heard,
                distance_km: None,
            }),
            None => stats.inference_skipped += 1,
        }
    }

    // Resolve every referenced node once
    let mut ids: BTreeSet<NodeId> = hops.keys().copied().collect();
    ids.extend(input.reporters.iter().copied().filter(|n| !n.is_broadcast()));
    for edge in &edges {
        ids.insert(edge.observer);
        ids.insert(edge.neighbor);
    }
    if let Some(local) = options.local_node {
        ids.insert(local);
    }
    let identities: BTreeMap<NodeId, NodeIdentity> = ids
        .iter()
        .filter_map(|id| directory.resolve(*id).map(|identity| (*id, identity)))
        .collect();
    let position_of = |id: &NodeId| {
        identities
            .get(id)
            .and_then(|identity| identity.position)
            .filter(Position::is_valid)
    };

    edges.retain_mut(|edge| {
        edge.distance_km = match (position_of(&edge.observer), position_of(&edge.neighbor)) {
            (Some(a), Some(b)) => Some(distance_km(&a, &b)),
            _ => None,
        };
        match (options.max_distance_km, edge.distance_km) {
            (Some(max), Some(d)) if d > max => {
                stats.dropped_by_distance += 1;
                false
            }
            _ => true,
        }
    });
    edges.sort_by(|a, b| (a.observer, a.neighbor, a.tag).cmp(&(b.observer, b.neighbor, b.tag)));

    for edge in &edges {
        match edge.tag {
            EdgeTag::DirectMeasurement => stats.direct_edges += 1,
            EdgeTag::RelayCollected => stats.relay_edges += 1,
            EdgeTag::Inferred => stats.inferred_edges += 1,
        }
    }

    let reporters: BTreeSet<NodeId> = input.reporters.iter().copied().collect();
    let mut nodes = Vec::new();
    for id in &ids {
        match position_of(id) {
            Some(position) => nodes.push(TopologyNode {
                id: *id,
                display_name: identities.get(id).and_then(|i| i.display_name.clone()),
                position,
                hops_away: hops.get(id).map(|h| h.hops_away),
                reports_topology: reporters.contains(id),
            }),
            None => stats.unpositioned_nodes += 1,
        }
    }
    stats.total_nodes = ids.len();

    TopologySnapshot {
        since: input.since,
        local_node: options.local_node,
        nodes,
        edges,
        stats,
    }
}

/// Latest hop observation per node
fn latest_hops(observations: &[HopObservation]) -> BTreeMap<NodeId, HopObservation> {
    let mut hops: BTreeMap<NodeId, HopObservation> = BTreeMap::new();
    for obs in observations.iter().filter(|o| !o.node.is_broadcast()) {
        hops.entry(obs.node)
            .and_modify(|existing| {
                if obs.last_heard >= existing.last_heard {
                    *existing = *obs;
                }
            })
            .or_insert(*obs);
    }
    hops
}

/// Pick the relay one hop closer to us
///
/// Candidates sit at exactly `hops_away - 1`; the most recently heard wins,
/// ties go to the lowest id. A zero-hop target carries no information, so
/// an observer at one hop never gets an inferred edge.
fn inference_target(
    observer: &HopObservation,
    hops: &BTreeMap<NodeId, HopObservation>,
    local_node: Option<NodeId>,
) -> Option<NodeId> {
    let wanted = observer.hops_away.checked_sub(1)?;
    if wanted == 0 {
        return None;
    }
    hops.values()
        .filter(|c| c.node != observer.node)
        .filter(|c| Some(c.node) != local_node)
        .filter(|c| c.hops_away == wanted)
        .max_by(|a, b| {
            a.last_heard
                .cmp(&b.last_heard)
                .then_with(|| b.node.cmp(&a.node))
        })
        .map(|c| c.node)
}
