//! Peer registry: every controller periodically broadcasts an
//! announcement on the info socket; each node keeps an aging table of who
//! it has heard from, so UIs can list the installation's members.

use std::collections::BTreeMap;

use pixel_protocol::packets::NodeAnnounce;
use tracing::{debug, info};

/// Hard cap on tracked peers. Once full, announcements from unseen units
/// are dropped; known units still update in place.
pub const MAX_NODES: usize = 32;
/// Registry ticks without a fresh announcement before a peer is dropped.
pub const NODE_TIMEOUT_TICKS: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub ip: [u8; 4],
    pub name: String,
    pub node_type: u8,
    pub build: u32,
    pub age: u8,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    map: BTreeMap<u8, NodeRecord>,
}

impl NodeRegistry {
    /// Record an announcement. Returns false when the registry is full and
    /// the unit is unseen (the announcement is dropped, not evicted for).
    pub fn upsert(&mut self, announce: &NodeAnnounce) -> bool {
        if !self.map.contains_key(&announce.unit_id) && self.map.len() >= MAX_NODES {
            debug!(unit = announce.unit_id, "node registry full, announcement dropped");
            return false;
        }

        let fresh = !self.map.contains_key(&announce.unit_id);
        self.map.insert(
            announce.unit_id,
            NodeRecord {
                ip: announce.ip,
                name: announce.name.clone(),
                node_type: announce.node_type,
                build: announce.build,
                age: 0,
            },
        );
        if fresh {
            info!(
                unit = announce.unit_id,
                name = %announce.name,
                ip = ?announce.ip,
                "new node discovered"
            );
        }
        true
    }

    /// Age every entry; peers silent for [`NODE_TIMEOUT_TICKS`] drop out.
    pub fn tick(&mut self) {
        self.map.retain(|unit, rec| {
            rec.age += 1;
            let keep = rec.age < NODE_TIMEOUT_TICKS;
            if !keep {
                info!(unit, name = %rec.name, "node aged out");
            }
            keep
        });
    }

    pub fn get(&self, unit_id: u8) -> Option<&NodeRecord> {
        self.map.get(&unit_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u8, &NodeRecord)> {
        self.map.iter()
    }
}
