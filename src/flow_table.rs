//! Flow table: the single owner of all open flow aggregates.
//!
//! Every aggregate is created, mutated, and removed here and nowhere else.
//! Flows are keyed by a canonicalized 5-tuple so both directions of a
//! conversation land on one entry, and closed by idle timeout, active
//! timeout, shutdown flush, or cap eviction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

/// 5-tuple identifying a unidirectional packet; `canonical()` folds the two
/// directions of a conversation onto one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Transport,
}

impl FlowKey {
    /// Canonical form plus whether this packet ran in the canonical (forward)
    /// direction. The endpoint with the smaller `(addr, port)` pair is the
    /// canonical source; any total order works as long as it is applied
    /// consistently.
    pub fn canonical(&self) -> (FlowKey, bool) {
        if (self.src_addr, self.src_port) <= (self.dst_addr, self.dst_port) {
            (*self, true)
        } else {
            (
                FlowKey {
                    src_addr: self.dst_addr,
                    dst_addr: self.src_addr,
                    src_port: self.dst_port,
                    dst_port: self.src_port,
                    protocol: self.protocol,
                },
                false,
            )
        }
    }
}

/// One packet's worth of decoded header fields, consumed immediately by the
/// aggregator. The key is in raw (as-captured) orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub key: FlowKey,
    pub timestamp: DateTime<Utc>,
    pub frame_len: u64,
    pub host_hint: Option<String>,
}

/// Open flow state. Counters only grow while the aggregate is open, and
/// `last_seen >= first_seen` always holds.
#[derive(Debug, Clone)]
pub struct FlowAggregate {
    pub key: FlowKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packets_forward: u64,
    pub bytes_forward: u64,
    pub packets_reverse: u64,
    pub bytes_reverse: u64,
    pub host: Option<String>,
}

impl FlowAggregate {
    fn new(key: FlowKey, pkt: &DecodedPacket, forward: bool) -> Self {
        let mut agg = FlowAggregate {
            key,
            first_seen: pkt.timestamp,
            last_seen: pkt.timestamp,
            packets_forward: 0,
            bytes_forward: 0,
            packets_reverse: 0,
            bytes_reverse: 0,
            host: pkt.host_hint.clone(),
        };
        agg.count(pkt, forward);
        agg
    }

    fn count(&mut self, pkt: &DecodedPacket, forward: bool) {
        if forward {
            self.packets_forward += 1;
            self.bytes_forward += pkt.frame_len;
        } else {
            self.packets_reverse += 1;
            self.bytes_reverse += pkt.frame_len;
        }
    }

    fn update(&mut self, pkt: &DecodedPacket, forward: bool) {
        self.count(pkt, forward);
        // The capture layer may deliver packets slightly out of timestamp
        // order; last_seen never moves backward and first_seen never forward.
        if pkt.timestamp > self.last_seen {
            self.last_seen = pkt.timestamp;
        }
        if pkt.timestamp < self.first_seen {
            self.first_seen = pkt.timestamp;
        }
        if self.host.is_none() {
            self.host = pkt.host_hint.clone();
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_forward + self.packets_reverse
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_forward + self.bytes_reverse
    }
}

pub struct FlowTable {
    flows: HashMap<FlowKey, FlowAggregate>,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        FlowTable {
            flows: HashMap::new(),
            max_flows,
        }
    }

    /// Applies one packet. A new flow past the size cap force-closes the
    /// aggregate with the oldest first-seen; it is returned so the caller can
    /// export it instead of losing it.
    pub fn upsert(&mut self, pkt: &DecodedPacket) -> Option<FlowAggregate> {
        let (key, forward) = pkt.key.canonical();

        if let Some(agg) = self.flows.get_mut(&key) {
            agg.update(pkt, forward);
            return None;
        }

        let evicted = if self.flows.len() >= self.max_flows {
            self.evict_oldest()
        } else {
            None
        };
        self.flows.insert(key, FlowAggregate::new(key, pkt, forward));
        evicted
    }

    fn evict_oldest(&mut self) -> Option<FlowAggregate> {
        let oldest = self
            .flows
            .values()
            .min_by_key(|agg| agg.first_seen)
            .map(|agg| agg.key)?;
        self.flows.remove(&oldest)
    }

    /// Removes and returns every flow idle for `idle_timeout` or open for
    /// `active_timeout`, relative to `now`.
    pub fn collect_expired(
        &mut self,
        now: DateTime<Utc>,
        idle_timeout: Duration,
        active_timeout: Duration,
    ) -> Vec<FlowAggregate> {
        let idle = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);
        let active = chrono::Duration::from_std(active_timeout).unwrap_or(chrono::Duration::MAX);

        let expired: Vec<FlowKey> = self
            .flows
            .values()
            .filter(|agg| now - agg.last_seen >= idle || now - agg.first_seen >= active)
            .map(|agg| agg.key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.flows.remove(&key))
            .collect()
    }

    /// Drains every open flow; used at shutdown so nothing is lost.
    pub fn flush_all(&mut self) -> Vec<FlowAggregate> {
        self.flows.drain().map(|(_, agg)| agg).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
