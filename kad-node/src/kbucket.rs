// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! K-bucket entries and the single-bucket structure.
//!
//! A bucket holds the peers whose common prefix length with the local id
//! equals the bucket's index. Eviction only ever sacrifices replaceable
//! entries; peers pinned at insertion (bootstrap peers) stay until removed
//! explicitly.

use std::time::Instant;

use kad_protocol::{Address, KadId, PeerId};

/// A peer tracked by the routing table.
#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub peer: PeerId,
    /// Cached keyspace position of `peer`.
    pub id: KadId,
    pub addrs: Vec<Address>,
    /// Last time the peer was useful to us (answered, or contacted us).
    pub last_seen_useful: Instant,
    /// Last time an outbound query to the peer succeeded.
    pub last_query_ok: Option<Instant>,
    /// Whether a full bucket may evict this entry.
    pub replaceable: bool,
}

impl PeerEntry {
    pub fn new(peer: PeerId, addrs: Vec<Address>, replaceable: bool) -> Self {
        let id = KadId::from_peer(&peer);
        Self {
            peer,
            id,
            addrs,
            last_seen_useful: Instant::now(),
            last_query_ok: None,
            replaceable,
        }
    }

    /// Merge newly learned addresses, keeping existing ones.
    pub fn merge_addrs(&mut self, addrs: &[Address]) {
        for addr in addrs {
            if !self.addrs.contains(addr) {
                self.addrs.push(addr.clone());
            }
        }
    }

    pub fn mark_useful(&mut self) {
        self.last_seen_useful = Instant::now();
    }

    pub fn mark_query_ok(&mut self) {
        let now = Instant::now();
        self.last_query_ok = Some(now);
        self.last_seen_useful = now;
    }
}

/// One bucket of the routing table.
#[derive(Clone, Debug)]
pub struct Bucket {
    entries: Vec<PeerEntry>,
    last_refreshed: Instant,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refreshed: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.entries.iter().find(|e| e.peer == *peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerEntry> {
        self.entries.iter_mut().find(|e| e.peer == *peer)
    }

    pub fn push(&mut self, entry: PeerEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerEntry> {
        let pos = self.entries.iter().position(|e| e.peer == *peer)?;
        Some(self.entries.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerEntry> {
        self.entries.iter_mut()
    }

    /// Pick the eviction victim in a full bucket: the replaceable entry with
    /// the oldest successful outbound query, ties broken by the oldest
    /// `last_seen_useful`. Entries that never answered a query sort oldest.
    pub fn least_useful_replaceable(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.replaceable)
            .min_by_key(|(_, e)| (e.last_query_ok, e.last_seen_useful))
            .map(|(idx, _)| idx)
    }

    pub fn evict(&mut self, idx: usize) -> PeerEntry {
        self.entries.remove(idx)
    }

    pub fn last_refreshed(&self) -> Instant {
        self.last_refreshed
    }

    pub fn set_last_refreshed(&mut self, when: Instant) {
        self.last_refreshed = when;
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(id: u8, replaceable: bool) -> PeerEntry {
        PeerEntry::new(PeerId::new(vec![id]), Vec::new(), replaceable)
    }

    #[test]
    fn test_merge_addrs_deduplicates() {
        let mut e = entry(1, true);
        e.merge_addrs(&[Address::new("tcp", "192.0.2.1:4001")]);
        e.merge_addrs(&[
            Address::new("tcp", "192.0.2.1:4001"),
            Address::new("tcp", "192.0.2.2:4001"),
        ]);
        assert_eq!(e.addrs.len(), 2);
    }

    #[test]
    fn test_least_useful_prefers_never_queried() {
        let mut bucket = Bucket::new();
        let mut answered = entry(1, true);
        answered.mark_query_ok();
        bucket.push(answered);
        bucket.push(entry(2, true));

        let victim = bucket.least_useful_replaceable().unwrap();
        assert_eq!(bucket.evict(victim).peer, PeerId::new(vec![2]));
    }

    #[test]
    fn test_least_useful_skips_pinned_entries() {
        let mut bucket = Bucket::new();
        bucket.push(entry(1, false));
        assert!(bucket.least_useful_replaceable().is_none());

        bucket.push(entry(2, true));
        let victim = bucket.least_useful_replaceable().unwrap();
        assert_eq!(bucket.evict(victim).peer, PeerId::new(vec![2]));
    }

    #[test]
    fn test_least_useful_orders_by_query_age() {
        let mut bucket = Bucket::new();
        let mut old = entry(1, true);
        old.last_query_ok = Some(Instant::now() - Duration::from_secs(120));
        let mut fresh = entry(2, true);
        fresh.last_query_ok = Some(Instant::now());
        bucket.push(fresh);
        bucket.push(old);

        let victim = bucket.least_useful_replaceable().unwrap();
        assert_eq!(bucket.evict(victim).peer, PeerId::new(vec![1]));
    }
}
