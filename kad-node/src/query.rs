// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The iterative alpha-parallel lookup engine.
//!
//! A lookup keeps up to alpha `query_fn` calls in flight, always aimed at
//! the closest peers not yet contacted. Peers a response names are merged
//! into the set as `Heard`; a failed peer becomes `Unreachable` and is never
//! retried within the lookup. The lookup succeeds once the caller's stop
//! condition fires or the frontier stabilizes: the beta closest responders
//! are queried and nothing closer is left to ask.
//!
//! All peer-set mutation happens on the lookup's own task between awaits;
//! no lock is involved.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use kad_protocol::{Distance, KadId, Peer, PeerId};

use crate::error::DhtError;

/// State of one peer within a single lookup. Transitions are monotonic:
/// `Heard -> Waiting -> (Queried | Unreachable)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// Known but not yet contacted
    Heard,
    /// Request in flight
    Waiting,
    /// Answered
    Queried,
    /// Failed to answer
    Unreachable,
}

/// A peer tracked by a lookup.
#[derive(Clone, Debug)]
pub struct TrackedPeer {
    pub peer: PeerId,
    pub id: KadId,
    pub state: PeerState,
    /// Round trip of the successful query, if any.
    pub rtt: Option<Duration>,
}

/// The per-lookup peer set, ordered by distance to the target.
#[derive(Debug)]
pub struct QueryPeerSet {
    target: KadId,
    peers: HashMap<PeerId, TrackedPeer>,
}

impl QueryPeerSet {
    pub fn new(target: KadId) -> Self {
        Self {
            target,
            peers: HashMap::new(),
        }
    }

    pub fn target(&self) -> &KadId {
        &self.target
    }

    /// Track a peer as heard. Returns false if it was already tracked.
    pub fn add_heard(&mut self, peer: PeerId) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        let id = KadId::from_peer(&peer);
        self.peers.insert(
            peer.clone(),
            TrackedPeer {
                peer,
                id,
                state: PeerState::Heard,
                rtt: None,
            },
        );
        true
    }

    fn transition(&mut self, peer: &PeerId, next: PeerState) {
        if let Some(tracked) = self.peers.get_mut(peer) {
            let legal = matches!(
                (tracked.state, next),
                (PeerState::Heard, PeerState::Waiting)
                    | (PeerState::Waiting, PeerState::Queried)
                    | (PeerState::Waiting, PeerState::Unreachable)
            );
            debug_assert!(legal, "illegal transition {:?} -> {next:?}", tracked.state);
            if legal {
                tracked.state = next;
            }
        }
    }

    fn mark_waiting(&mut self, peer: &PeerId) {
        self.transition(peer, PeerState::Waiting);
    }

    fn mark_queried(&mut self, peer: &PeerId, rtt: Duration) {
        self.transition(peer, PeerState::Queried);
        if let Some(tracked) = self.peers.get_mut(peer) {
            tracked.rtt = Some(rtt);
        }
    }

    fn mark_unreachable(&mut self, peer: &PeerId) {
        self.transition(peer, PeerState::Unreachable);
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<PeerState> {
        self.peers.get(peer).map(|t| t.state)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn distance(&self, tracked: &TrackedPeer) -> Distance {
        tracked.id.distance(&self.target)
    }

    fn count_in(&self, state: PeerState) -> usize {
        self.peers.values().filter(|t| t.state == state).count()
    }

    /// Peers in any of `states`, closest to the target first.
    pub fn peers_in_states(&self, states: &[PeerState]) -> Vec<PeerId> {
        let mut matching: Vec<&TrackedPeer> = self
            .peers
            .values()
            .filter(|t| states.contains(&t.state))
            .collect();
        matching.sort_by_key(|t| self.distance(t));
        matching.into_iter().map(|t| t.peer.clone()).collect()
    }

    /// The closest peer still in `Heard`.
    fn next_heard(&self) -> Option<PeerId> {
        self.peers
            .values()
            .filter(|t| t.state == PeerState::Heard)
            .min_by_key(|t| self.distance(t))
            .map(|t| t.peer.clone())
    }

    /// Frontier stability: at least `beta` peers queried, and no heard or
    /// waiting peer sits closer than the beta-th closest queried one.
    fn is_stable(&self, beta: usize) -> bool {
        let mut queried: Vec<Distance> = self
            .peers
            .values()
            .filter(|t| t.state == PeerState::Queried)
            .map(|t| self.distance(t))
            .collect();
        if queried.len() < beta {
            return false;
        }
        queried.sort_unstable();
        let threshold = queried[beta - 1];

        !self.peers.values().any(|t| {
            matches!(t.state, PeerState::Heard | PeerState::Waiting)
                && self.distance(t) < threshold
        })
    }
}

/// Why a lookup ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupTermination {
    /// Stop condition fired or the frontier stabilized
    Completed,
    /// Ran out of peers to contact
    Starved,
    /// Whole-lookup wall clock exceeded
    TimedOut,
    /// Cancelled by the owner
    Cancelled,
}

/// Outcome of a lookup: the final peer set, why it stopped, and the
/// per-peer errors collected along the way.
#[derive(Debug)]
pub struct LookupResult {
    pub peers: QueryPeerSet,
    pub termination: LookupTermination,
    pub errors: Vec<(PeerId, DhtError)>,
}

impl LookupResult {
    /// Peers that answered, closest first.
    pub fn queried(&self) -> Vec<PeerId> {
        self.peers.peers_in_states(&[PeerState::Queried])
    }

    /// Whether any peer failed with an exhausted retry budget.
    pub fn saw_max_retries(&self) -> bool {
        self.errors
            .iter()
            .any(|(_, e)| matches!(e, DhtError::MaxRetries { .. }))
    }
}

/// Tuning for a single lookup.
#[derive(Clone, Debug)]
pub struct LookupParams {
    pub target: KadId,
    /// Concurrent in-flight queries (alpha)
    pub alpha: usize,
    /// Queried peers required for frontier stability (beta)
    pub beta: usize,
    pub timeout: Duration,
}

/// Drive one iterative lookup to completion.
///
/// `query_fn` sends a single request to a peer and returns the peers the
/// remote reported as closer. `stop_fn` is evaluated after every
/// completion and ends the lookup early when it returns true. Dropping a
/// true value into `cancel` aborts in-flight queries at their next await.
pub async fn run_lookup<F, Fut, S>(
    params: LookupParams,
    seeds: Vec<PeerId>,
    query_fn: F,
    mut stop_fn: S,
    mut cancel: watch::Receiver<bool>,
) -> LookupResult
where
    F: Fn(PeerId) -> Fut,
    Fut: Future<Output = crate::error::Result<Vec<Peer>>>,
    S: FnMut(&QueryPeerSet) -> bool,
{
    let mut set = QueryPeerSet::new(params.target);
    let mut errors = Vec::new();
    for seed in seeds {
        set.add_heard(seed);
    }

    let deadline = tokio::time::sleep(params.timeout);
    tokio::pin!(deadline);

    let mut inflight = FuturesUnordered::new();
    let termination = loop {
        // Keep alpha queries in flight, aimed at the closest heard peers.
        while inflight.len() < params.alpha {
            let Some(peer) = set.next_heard() else { break };
            set.mark_waiting(&peer);
            let fut = query_fn(peer.clone());
            let started = Instant::now();
            inflight.push(async move { (peer, started, fut.await) });
        }

        if inflight.is_empty() {
            break LookupTermination::Starved;
        }

        tokio::select! {
            _ = &mut deadline => break LookupTermination::TimedOut,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break LookupTermination::Cancelled;
                }
            }
            Some((peer, started, result)) = inflight.next() => {
                match result {
                    Ok(closer) => {
                        trace!(%peer, reported = closer.len(), "lookup hop answered");
                        set.mark_queried(&peer, started.elapsed());
                        for found in closer {
                            set.add_heard(found.id);
                        }
                    }
                    Err(err) => {
                        debug!(%peer, %err, "lookup hop failed");
                        set.mark_unreachable(&peer);
                        errors.push((peer, err));
                    }
                }

                if stop_fn(&set) {
                    break LookupTermination::Completed;
                }
                if set.is_stable(params.beta) {
                    break LookupTermination::Completed;
                }
            }
        }
    };

    debug!(
        ?termination,
        tracked = set.len(),
        queried = set.count_in(PeerState::Queried),
        unreachable = set.count_in(PeerState::Unreachable),
        "lookup finished"
    );

    LookupResult {
        peers: set,
        termination,
        errors,
    }
}
