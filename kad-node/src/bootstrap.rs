// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Bootstrap and routing-table refresh.
//!
//! Bootstrap seeds the table from configured entry points and then walks
//! the keyspace to populate it. The periodic refresh keeps buckets warm:
//! stale buckets get a targeted random walk, overdue peers get a liveness
//! ping and are evicted on failure. A node whose addresses change walks
//! towards itself to tell its neighborhood.

use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use kad_protocol::{KadId, Message, PeerId};

use crate::error::Result;
use crate::node::{Dht, SideChannels};
use crate::query::QueryPeerSet;
use crate::routing_table::NUM_BUCKETS;

/// Targeted refresh keys are only generated up to this CPL; deeper buckets
/// are beyond what rejection sampling can reach and are practically always
/// empty anyway.
pub(crate) const MAX_REFRESH_CPL: u32 = 15;

/// How many bootstrap entry points are dialed at once.
const CONCURRENT_DIALS: usize = 3;

/// Random key material whose keyspace position shares `cpl` leading bits
/// with `local` (capped at [`MAX_REFRESH_CPL`]). Returns the wire key and
/// its keyspace id.
pub(crate) fn random_key_with_cpl<R: Rng>(
    local: &KadId,
    cpl: u32,
    rng: &mut R,
) -> (Bytes, KadId) {
    let wanted = cpl.min(MAX_REFRESH_CPL);
    loop {
        let mut material = [0u8; 32];
        rng.fill(&mut material);
        let id = KadId::hash(&material);
        if local.common_prefix_len(&id) == wanted {
            return (Bytes::copy_from_slice(&material), id);
        }
    }
}

/// Uniformly random key material and its keyspace position.
pub(crate) fn random_key<R: Rng>(rng: &mut R) -> (Bytes, KadId) {
    let mut material = [0u8; 32];
    rng.fill(&mut material);
    let id = KadId::hash(&material);
    (Bytes::copy_from_slice(&material), id)
}

impl Dht {
    /// Seed the routing table from the configured bootstrap peers.
    ///
    /// `quick` returns once the entry points are contacted and lets the
    /// deeper populate step run in the background; `quick = false` runs it
    /// synchronously. Unreachable entry points are logged and skipped, not
    /// errors.
    pub async fn bootstrap(&self, quick: bool) -> Result<()> {
        self.ensure_started()?;

        let bootstrap_peers = self.config().bootstrap_peers.clone();
        let configured = bootstrap_peers.len();
        let host = self.inner.host.clone();
        let dialed: Vec<_> = stream::iter(bootstrap_peers.into_iter())
            .map(|entry| {
                let host = host.clone();
                async move {
                    match host.connect(&entry.id, &entry.addrs).await {
                        Ok(()) => Some(entry),
                        Err(err) => {
                            warn!(peer = %entry.id, %err, "bootstrap peer unreachable");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(CONCURRENT_DIALS)
            .collect()
            .await;

        let mut connected = 0usize;
        for entry in dialed.into_iter().flatten() {
            self.inner.host.add_addrs(
                &entry.id,
                entry.addrs.clone(),
                self.config().provider_addr_ttl,
            );
            let mut rt = self.inner.routing_table.write().await;
            // Bootstrap peers are pinned: a full bucket never trades them
            // away for in-session discoveries.
            rt.try_add(entry.id.clone(), &entry.addrs, false, false);
            connected += 1;
        }
        debug!(connected, configured, "bootstrap seeding done");

        if quick {
            let dht = self.clone();
            let mut shutdown = self.inner.shutdown.subscribe();
            let task = tokio::spawn(async move {
                tokio::select! {
                    _ = dht.populate() => {}
                    _ = shutdown.changed() => {}
                }
            });
            self.track_task(task);
            return Ok(());
        }

        self.populate().await;
        Ok(())
    }

    /// Deep population: tell existing neighbors about us, then walk a
    /// random key to let the XOR geometry spread the table.
    pub(crate) async fn populate(&self) {
        let self_key = Bytes::copy_from_slice(self.local_peer().as_bytes());
        let peers: Vec<PeerId> = {
            let rt = self.inner.routing_table.read().await;
            rt.list_peers().into_iter().map(|e| e.peer).collect()
        };

        // A FIND_NODE for our own id is harmless and refreshes our entry
        // in the remote's table while handing us its neighborhood.
        let refreshes = peers.iter().map(|peer| {
            let message = Message::find_node(self_key.clone());
            async move {
                if let Err(err) = self.query_one(peer.clone(), message, SideChannels::default()).await {
                    trace!(%peer, %err, "presence refresh failed");
                }
            }
        });
        futures::future::join_all(refreshes).await;

        // Self-walk: converge on our own neighborhood.
        let self_target = KadId::from_peer(self.local_peer());
        let _ = self
            .run_query(
                self_target,
                Message::find_node(self_key),
                SideChannels::default(),
                |_: &QueryPeerSet| false,
            )
            .await;

        // Random walk for coverage further out.
        let (wire_key, target) = random_key(&mut SmallRng::from_entropy());
        let _ = self
            .run_query(
                target,
                Message::find_node(wire_key),
                SideChannels::default(),
                |_: &QueryPeerSet| false,
            )
            .await;
    }

    /// One refresh pass: liveness-sweep overdue peers, then walk every
    /// stale bucket. An empty bucket bounds how much further the pass
    /// looks: up to `2 * (cpl + 1)` follow-on buckets get their walk, then
    /// the cycle stops.
    pub(crate) async fn refresh_cycle(&self) {
        self.ping_and_evict_overdue().await;

        let interval = self.config().refresh_interval;
        let times = {
            let rt = self.inner.routing_table.read().await;
            rt.cpl_refresh_times()
        };
        let stale = |at: Instant| at.elapsed() >= interval;

        let mut cpl = 0usize;
        while cpl < NUM_BUCKETS {
            if stale(times[cpl]) {
                self.refresh_cpl(cpl).await;
            }
            let empty = {
                let rt = self.inner.routing_table.read().await;
                rt.bucket_len(cpl) == 0
            };
            if empty {
                let limit = (2 * (cpl + 1)).min(NUM_BUCKETS - 1);
                for follow_on in (cpl + 1)..=limit {
                    if stale(times[follow_on]) {
                        self.refresh_cpl(follow_on).await;
                    }
                }
                break;
            }
            cpl += 1;
        }
    }

    async fn refresh_cpl(&self, cpl: usize) {
        let (wire_key, target) = random_key_with_cpl(
            &self.inner.local_id,
            cpl as u32,
            &mut SmallRng::from_entropy(),
        );
        trace!(cpl, target = %target, "refreshing bucket");
        let _ = self
            .run_query(
                target,
                Message::find_node(wire_key),
                SideChannels::default(),
                |_: &QueryPeerSet| false,
            )
            .await;
        let mut rt = self.inner.routing_table.write().await;
        rt.reset_cpl_refreshed_at(cpl, Instant::now());
    }

    /// Ping peers that have not answered an outbound query within the
    /// grace period; evict the ones that fail.
    pub(crate) async fn ping_and_evict_overdue(&self) {
        let overdue = {
            let rt = self.inner.routing_table.read().await;
            rt.peers_overdue(self.config().usefulness_grace_period)
        };
        if overdue.is_empty() {
            return;
        }
        debug!(count = overdue.len(), "liveness-checking overdue peers");

        let checks = overdue.into_iter().map(|peer| async move {
            if self.ping(&peer).await.is_err() {
                let mut rt = self.inner.routing_table.write().await;
                if rt.remove(&peer).is_some() {
                    info!(%peer, "evicted unresponsive peer");
                }
            }
        });
        futures::future::join_all(checks).await;
    }
}

/// Spawn the periodic refresh task. Idempotent: at most one task per node
/// lifetime.
pub(crate) fn spawn_refresh_task(dht: &Dht) {
    if dht
        .inner
        .refresh_task_started
        .swap(true, Ordering::SeqCst)
    {
        return;
    }

    let task_dht = dht.clone();
    let mut shutdown = task_dht.inner.shutdown.subscribe();
    let task = tokio::spawn(async move {
        let dht = task_dht;
        let mut refresh_tick = tokio::time::interval(dht.config().refresh_interval);
        // The immediate first tick; buckets were just refreshed by bootstrap.
        refresh_tick.tick().await;
        let mut watermark_tick = tokio::time::interval(dht.config().auto_mode_poll_interval);
        watermark_tick.tick().await;

        loop {
            tokio::select! {
                _ = refresh_tick.tick() => {
                    dht.refresh_cycle().await;
                }
                _ = watermark_tick.tick() => {
                    let size = dht.inner.routing_table.read().await.len();
                    if size < dht.config().bootstrap_low_watermark
                        && !dht.config().bootstrap_peers.is_empty()
                    {
                        debug!(size, "routing table below watermark, re-bootstrapping");
                        let _ = dht.bootstrap(true).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
    dht.track_task(task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_key_hits_requested_cpl() {
        let mut rng = SmallRng::seed_from_u64(11);
        let local = KadId::hash(b"local");
        for cpl in [0u32, 1, 3, 7, 10] {
            let (material, id) = random_key_with_cpl(&local, cpl, &mut rng);
            assert_eq!(local.common_prefix_len(&id), cpl);
            assert_eq!(KadId::hash(&material), id);
        }
    }

    #[test]
    fn test_deep_cpl_is_capped() {
        let mut rng = SmallRng::seed_from_u64(11);
        let local = KadId::hash(b"local");
        let (_, id) = random_key_with_cpl(&local, 200, &mut rng);
        assert_eq!(local.common_prefix_len(&id), MAX_REFRESH_CPL);
    }
}
