// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The bucketed routing table.
//!
//! Bucket `i` holds peers whose common prefix length with the local id is
//! exactly `i`. A peer lives in at most one bucket and the local peer is
//! never present.

use std::time::Instant;

use tracing::trace;

use kad_protocol::keyspace::KEY_BITS;
use kad_protocol::{Address, KadId, PeerId};

use crate::kbucket::{Bucket, PeerEntry};

/// Number of buckets: one per possible CPL of a distinct id.
pub const NUM_BUCKETS: usize = KEY_BITS as usize;

/// Outcome of a `try_add`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
    /// Peer inserted, possibly after evicting a replaceable entry
    Added,
    /// Peer was already present; bookkeeping refreshed
    Updated,
    /// Bucket full of irreplaceable peers, table at capacity, or self
    Rejected,
}

/// Bucketed view of known peers, keyed by CPL to the local peer.
#[derive(Debug)]
pub struct RoutingTable {
    local: PeerId,
    local_id: KadId,
    buckets: Vec<Bucket>,
    bucket_size: usize,
    max_size: usize,
    size: usize,
}

impl RoutingTable {
    pub fn new(local: PeerId, bucket_size: usize, max_size: usize) -> Self {
        let local_id = KadId::from_peer(&local);
        Self {
            local,
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
            bucket_size,
            max_size,
            size: 0,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn local_id(&self) -> &KadId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn bucket_index(&self, id: &KadId) -> Option<usize> {
        let cpl = self.local_id.common_prefix_len(id);
        if cpl >= KEY_BITS {
            // Distance zero: the local peer itself.
            return None;
        }
        Some(cpl as usize)
    }

    /// Offer a peer to the table.
    ///
    /// `queried` marks the peer as having answered an outbound query (or
    /// contacted us), confirming liveness in that direction. `replaceable`
    /// only applies to newly inserted entries; bootstrap peers pass `false`
    /// and are pinned.
    pub fn try_add(
        &mut self,
        peer: PeerId,
        addrs: &[Address],
        queried: bool,
        replaceable: bool,
    ) -> AddResult {
        if peer == self.local {
            return AddResult::Rejected;
        }
        let id = KadId::from_peer(&peer);
        let Some(idx) = self.bucket_index(&id) else {
            return AddResult::Rejected;
        };
        let bucket_size = self.bucket_size;
        let at_capacity = self.size >= self.max_size;
        let bucket = &mut self.buckets[idx];

        if let Some(entry) = bucket.get_mut(&peer) {
            entry.merge_addrs(addrs);
            if queried {
                entry.mark_query_ok();
            } else {
                entry.mark_useful();
            }
            return AddResult::Updated;
        }

        if bucket.len() >= bucket_size {
            let Some(victim) = bucket.least_useful_replaceable() else {
                trace!(%peer, bucket = idx, "bucket full of pinned peers, rejecting");
                return AddResult::Rejected;
            };
            let evicted = bucket.evict(victim);
            trace!(peer = %evicted.peer, bucket = idx, "evicted replaceable peer");
            self.size -= 1;
        } else if at_capacity {
            return AddResult::Rejected;
        }

        let mut entry = PeerEntry::new(peer, addrs.to_vec(), replaceable);
        if queried {
            entry.mark_query_ok();
        }
        bucket.push(entry);
        self.size += 1;
        AddResult::Added
    }

    /// Remove a peer unconditionally.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerEntry> {
        let id = KadId::from_peer(peer);
        let idx = self.bucket_index(&id)?;
        let removed = self.buckets[idx].remove(peer);
        if removed.is_some() {
            self.size -= 1;
        }
        removed
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let id = KadId::from_peer(peer);
        self.bucket_index(&id)
            .map(|idx| self.buckets[idx].get(peer).is_some())
            .unwrap_or(false)
    }

    /// Record a successful outbound query to `peer`.
    pub fn mark_query_ok(&mut self, peer: &PeerId) {
        let id = KadId::from_peer(peer);
        if let Some(idx) = self.bucket_index(&id) {
            if let Some(entry) = self.buckets[idx].get_mut(peer) {
                entry.mark_query_ok();
            }
        }
    }

    /// Up to `n` known peers, closest to `target` first.
    pub fn nearest(&self, target: &KadId, n: usize) -> Vec<PeerEntry> {
        let mut all: Vec<&PeerEntry> = self.buckets.iter().flat_map(|b| b.iter()).collect();
        all.sort_by_key(|e| e.id.distance(target));
        all.into_iter().take(n).cloned().collect()
    }

    /// Snapshot of every tracked peer.
    pub fn list_peers(&self) -> Vec<PeerEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .cloned()
            .collect()
    }

    /// Last-refreshed instant per CPL, for the refresh scheduler.
    pub fn cpl_refresh_times(&self) -> Vec<Instant> {
        self.buckets.iter().map(|b| b.last_refreshed()).collect()
    }

    pub fn reset_cpl_refreshed_at(&mut self, cpl: usize, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(cpl) {
            bucket.set_last_refreshed(now);
        }
    }

    pub fn bucket_len(&self, cpl: usize) -> usize {
        self.buckets.get(cpl).map(Bucket::len).unwrap_or(0)
    }

    /// Peers whose last successful outbound query is older than the grace
    /// period (candidates for a liveness ping).
    pub fn peers_overdue(&self, grace: std::time::Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|e| match e.last_query_ok {
                Some(at) => now.duration_since(at) > grace,
                None => now.duration_since(e.last_seen_useful) > grace,
            })
            .map(|e| e.peer.clone())
            .collect()
    }
}
