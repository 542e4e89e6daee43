// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-memory provider records.
//!
//! A provider entry says "this peer claims to hold the content behind this
//! id". The relation outlives the address copy: addresses stop being
//! advertised after `addr_ttl` while the relation itself holds until
//! `provide_validity`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use kad_protocol::{Address, KadId, Peer, PeerId};

#[derive(Clone, Debug)]
pub struct ProviderEntry {
    pub provider: PeerId,
    pub addrs: Vec<Address>,
    pub added: Instant,
}

/// Map of content id to the peers providing it, with TTL-based eviction.
#[derive(Debug)]
pub struct ProviderStore {
    provide_validity: Duration,
    addr_ttl: Duration,
    entries: HashMap<KadId, Vec<ProviderEntry>>,
}

impl ProviderStore {
    pub fn new(provide_validity: Duration, addr_ttl: Duration) -> Self {
        Self {
            provide_validity,
            addr_ttl,
            entries: HashMap::new(),
        }
    }

    /// Register (or refresh) a provider for a content id.
    pub fn add_provider(&mut self, key: KadId, provider: PeerId, addrs: Vec<Address>) {
        let entries = self.entries.entry(key).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.provider == provider) {
            existing.addrs = addrs;
            existing.added = Instant::now();
        } else {
            entries.push(ProviderEntry {
                provider,
                addrs,
                added: Instant::now(),
            });
        }
    }

    /// Providers for a content id, lazily purging expired entries.
    ///
    /// Entries past the address TTL are returned without addresses; the
    /// relation is still useful since the peer can be resolved separately.
    pub fn providers_for(&mut self, key: &KadId) -> Vec<Peer> {
        let validity = self.provide_validity;
        let addr_ttl = self.addr_ttl;
        let Some(entries) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        entries.retain(|e| e.added.elapsed() <= validity);
        let result = entries
            .iter()
            .map(|e| {
                let addrs = if e.added.elapsed() <= addr_ttl {
                    e.addrs.clone()
                } else {
                    Vec::new()
                };
                Peer::new(e.provider.clone(), addrs)
            })
            .collect();
        if entries.is_empty() {
            self.entries.remove(key);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Purge all expired provider relations. Returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        let validity = self.provide_validity;
        let before = self.len();
        self.entries
            .retain(|_, entries| {
                entries.retain(|e| e.added.elapsed() <= validity);
                !entries.is_empty()
            });
        let removed = before - self.len();
        if removed > 0 {
            debug!(removed, "swept expired provider entries");
        }
        removed
    }
}
