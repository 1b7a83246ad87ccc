//! Bidirectional flow buckets.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::model::{Endpoint, FlowKey, Packet};

pub const DEFAULT_FLOW_CAPACITY: usize = 10_000;

/// Packets grouped by unordered endpoint pair, in arrival order.
///
/// At most `capacity` flows exist. Once full, the table is frozen: no packet
/// is bucketed until the next `clear`.
#[derive(Debug)]
pub struct FlowTable {
    index: HashMap<FlowKey, usize>,
    flows: Vec<(FlowKey, Vec<Arc<Packet>>)>,
    capacity: usize,
    full_logged: bool,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_CAPACITY)
    }
}

impl FlowTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::new(),
            flows: Vec::new(),
            capacity,
            full_logged: false,
        }
    }

    /// Buckets `packet`. Returns `false`, leaving the table untouched, once
    /// `capacity` flows exist.
    pub fn add_packet(&mut self, packet: Arc<Packet>) -> bool {
        let key = FlowKey::new(packet.src, packet.dst);
        if self.flows.len() >= self.capacity {
            if !self.full_logged {
                debug!(
                    event.name = "flow.table_full",
                    capacity = self.capacity,
                    flow = %key,
                    "flow table at capacity, packets are no longer bucketed"
                );
                self.full_logged = true;
            }
            return false;
        }
        match self.index.get(&key) {
            Some(&slot) => self.flows[slot].1.push(packet),
            None => {
                self.index.insert(key, self.flows.len());
                self.flows.push((key, vec![packet]));
            }
        }
        true
    }

    /// Every flow with its packets, in creation order.
    pub fn all_flows(&self) -> impl Iterator<Item = (&FlowKey, &[Arc<Packet>])> + '_ {
        self.flows.iter().map(|(key, packets)| (key, packets.as_slice()))
    }

    pub fn flow(&self, key: &FlowKey) -> Option<&[Arc<Packet>]> {
        self.index.get(key).map(|&slot| self.flows[slot].1.as_slice())
    }

    /// Every packet of every flow with `endpoint` on either side. An endpoint
    /// without a MAC matches on address and port alone.
    pub fn packets_involving(&self, endpoint: &Endpoint) -> Vec<Arc<Packet>> {
        let matches = |side: &Endpoint| {
            side.ip == endpoint.ip
                && side.port == endpoint.port
                && (endpoint.mac.is_none() || side.mac == endpoint.mac)
        };
        self.flows
            .iter()
            .filter(|(key, _)| {
                let (a, b) = key.endpoints();
                matches(a) || matches(b)
            })
            .flat_map(|(_, packets)| packets.iter().cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.flows.clear();
        self.full_logged = false;
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
