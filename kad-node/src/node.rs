// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The DHT node handle and its routing operations.
//!
//! `Dht` is a cheap-to-clone handle over the shared node state. Operations
//! plan lookups from the routing table seed, drive the query engine through
//! the network client, and feed what comes back into the routing table and
//! the stores. Background work (refresh, sweepers, auto-mode polling) runs
//! in tasks owned by the node and cancelled on close.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use kad_protocol::{KadId, Message, Peer, PeerId, Record};

use crate::bootstrap;
use crate::client::MessageClient;
use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::handler::InboundHandler;
use crate::host::Host;
use crate::mode::{Mode, ModeController};
use crate::provider_store::ProviderStore;
use crate::query::{
    run_lookup, LookupParams, LookupResult, LookupTermination, PeerState, QueryPeerSet,
};
use crate::record_store::{RecordStore, DEFAULT_RECORD_TTL};
use crate::routing_table::RoutingTable;
use crate::validator::ValidatorRegistry;

/// How long `close` waits for in-flight queries before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Buffer of the provider discovery stream.
const PROVIDER_STREAM_BUFFER: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Closed,
}

/// A peer found through `find_peer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundPeer {
    pub id: PeerId,
    pub addrs: Vec<kad_protocol::Address>,
}

/// Point-in-time operational counters.
#[derive(Clone, Debug, Default)]
pub struct DhtStats {
    pub queries_started: u64,
    pub queries_completed: u64,
    pub queries_failed: u64,
    pub requests_sent: u64,
    pub requests_failed: u64,
    pub routing_table_size: usize,
    pub records: usize,
    pub providers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    queries_started: AtomicU64,
    queries_completed: AtomicU64,
    queries_failed: AtomicU64,
    requests_sent: AtomicU64,
    requests_failed: AtomicU64,
}

/// Tracks in-flight lookups so close() can wait them out.
#[derive(Debug, Default)]
struct ActiveQueries {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveQueries {
    fn guard(self: &Arc<Self>) -> QueryGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        QueryGuard {
            tracker: Arc::clone(self),
        }
    }

    async fn wait_idle(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.count.load(Ordering::SeqCst) > 0 {
            if tokio::time::timeout_at(deadline, self.idle.notified())
                .await
                .is_err()
            {
                warn!(
                    remaining = self.count.load(Ordering::SeqCst),
                    "closing with queries still in flight"
                );
                break;
            }
        }
    }
}

struct QueryGuard {
    tracker: Arc<ActiveQueries>,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

pub(crate) struct DhtInner {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) config: DhtConfig,
    pub(crate) local: PeerId,
    pub(crate) local_id: KadId,
    pub(crate) routing_table: Arc<RwLock<RoutingTable>>,
    pub(crate) records: Arc<RwLock<RecordStore>>,
    pub(crate) providers: Arc<RwLock<ProviderStore>>,
    pub(crate) validators: Arc<ValidatorRegistry>,
    pub(crate) client: MessageClient,
    pub(crate) mode: ModeController,
    handler: Arc<InboundHandler>,
    lifecycle: StdMutex<Lifecycle>,
    pub(crate) shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    active: Arc<ActiveQueries>,
    pub(crate) refresh_task_started: AtomicBool,
    counters: Counters,
}

/// Handle to a running DHT node. Clones share state.
#[derive(Clone)]
pub struct Dht {
    pub(crate) inner: Arc<DhtInner>,
}

/// Side channels a lookup can feed while it runs.
#[derive(Clone, Default)]
pub(crate) struct SideChannels {
    pub(crate) records: Option<mpsc::Sender<Record>>,
    pub(crate) providers: Option<mpsc::Sender<Peer>>,
}

impl Dht {
    pub fn new(host: Arc<dyn Host>, config: DhtConfig) -> Self {
        let local = host.local_peer();
        let local_id = KadId::from_peer(&local);

        let routing_table = Arc::new(RwLock::new(RoutingTable::new(
            local.clone(),
            config.bucket_size,
            config.max_routing_table_size,
        )));
        let records = Arc::new(RwLock::new(RecordStore::new(DEFAULT_RECORD_TTL)));
        let providers = Arc::new(RwLock::new(ProviderStore::new(
            config.provide_validity,
            config.provider_addr_ttl,
        )));
        let validators = Arc::new(ValidatorRegistry::with_defaults(host.clone()));
        let client = MessageClient::new(host.clone(), &config);
        let handler = Arc::new(InboundHandler::new(
            host.clone(),
            routing_table.clone(),
            records.clone(),
            providers.clone(),
            validators.clone(),
            &config,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(DhtInner {
                mode: ModeController::new(config.mode),
                host,
                local,
                local_id,
                routing_table,
                records,
                providers,
                validators,
                client,
                handler,
                config,
                lifecycle: StdMutex::new(Lifecycle::Idle),
                shutdown,
                tasks: StdMutex::new(Vec::new()),
                active: Arc::new(ActiveQueries::default()),
                refresh_task_started: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode.current()
    }

    pub(crate) fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub async fn routing_table_size(&self) -> usize {
        self.inner.routing_table.read().await.len()
    }

    /// Start the node: register the handler (Server mode), kick off the
    /// background tasks, and seed the routing table from the configured
    /// bootstrap peers.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().expect("lifecycle lock");
            match *lifecycle {
                Lifecycle::Started => return Ok(()),
                Lifecycle::Closed => return Err(DhtError::Closed),
                Lifecycle::Idle => *lifecycle = Lifecycle::Started,
            }
        }
        info!(local = %self.inner.local, mode = ?self.inner.config.mode, "starting DHT");

        if self.inner.mode.is_server() {
            self.register_server_handler().await;
        }
        if self.inner.mode.configured() == Mode::Auto {
            self.spawn_auto_mode_task();
        }
        self.spawn_sweeper_task();
        self.spawn_address_update_task();

        self.bootstrap(true).await?;

        if self.inner.config.auto_refresh {
            bootstrap::spawn_refresh_task(self);
        }
        Ok(())
    }

    /// Shut the node down: cancel queries and background work, then
    /// unregister the inbound handler.
    pub async fn close(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock().expect("lifecycle lock");
            if *lifecycle == Lifecycle::Closed {
                return;
            }
            *lifecycle = Lifecycle::Closed;
        }
        info!(local = %self.inner.local, "closing DHT");

        let _ = self.inner.shutdown.send(true);
        self.inner.active.wait_idle(SHUTDOWN_GRACE).await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().expect("task lock");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.inner
            .host
            .remove_stream_handler(&self.inner.config.protocol_id)
            .await;
    }

    pub(crate) fn ensure_started(&self) -> Result<()> {
        match *self.inner.lifecycle.lock().expect("lifecycle lock") {
            Lifecycle::Started => Ok(()),
            Lifecycle::Idle => Err(DhtError::NotStarted),
            Lifecycle::Closed => Err(DhtError::Closed),
        }
    }

    pub async fn stats(&self) -> DhtStats {
        let c = &self.inner.counters;
        DhtStats {
            queries_started: c.queries_started.load(Ordering::Relaxed),
            queries_completed: c.queries_completed.load(Ordering::Relaxed),
            queries_failed: c.queries_failed.load(Ordering::Relaxed),
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            requests_failed: c.requests_failed.load(Ordering::Relaxed),
            routing_table_size: self.inner.routing_table.read().await.len(),
            records: self.inner.records.read().await.len(),
            providers: self.inner.providers.read().await.len(),
        }
    }

    // ---- routing operations -------------------------------------------

    /// Locate a peer's reachable addresses.
    ///
    /// Always walks the network, even for locally known peers, so the
    /// answer reflects current reachability. Absence is `Ok(None)`.
    pub async fn find_peer(&self, target: &PeerId) -> Result<Option<FoundPeer>> {
        self.ensure_started()?;
        if *target == self.inner.local {
            return Ok(Some(FoundPeer {
                id: target.clone(),
                addrs: self.inner.host.local_addrs(),
            }));
        }

        let target_id = KadId::from_peer(target);
        let seen = |set: &QueryPeerSet, peer: &PeerId| {
            matches!(
                set.state_of(peer),
                Some(PeerState::Heard | PeerState::Waiting | PeerState::Queried)
            )
        };
        let wanted = target.clone();
        let result = self
            .run_query(
                target_id,
                Message::find_node(Bytes::copy_from_slice(target.as_bytes())),
                SideChannels::default(),
                move |set: &QueryPeerSet| seen(set, &wanted),
            )
            .await?;

        if seen(&result.peers, target) {
            Ok(Some(FoundPeer {
                id: target.clone(),
                addrs: self.inner.host.addrs_of(target),
            }))
        } else {
            Ok(None)
        }
    }

    /// The closest peers this node can name for a key, optionally walking
    /// the network when the local table is too thin.
    pub async fn get_closest_peers(&self, key: &[u8], enable_network: bool) -> Result<Vec<Peer>> {
        self.ensure_started()?;
        let target = KadId::hash(key);

        let local: Vec<Peer> = {
            let rt = self.inner.routing_table.read().await;
            rt.nearest(&target, self.inner.config.bucket_size)
                .into_iter()
                .map(|e| self.wire_peer(e.peer, e.addrs))
                .collect()
        };
        if !enable_network || local.len() >= self.inner.config.resiliency {
            return Ok(local);
        }

        let result = self
            .run_query(
                target,
                Message::find_node(Bytes::copy_from_slice(key)),
                SideChannels::default(),
                |_: &QueryPeerSet| false,
            )
            .await?;

        // Network-learned addresses were written to the address book as
        // responses arrived, so `wire_peer` picks them up here.
        let from_lookup = result
            .peers
            .peers_in_states(&[PeerState::Queried, PeerState::Heard, PeerState::Waiting]);
        let merged = from_lookup
            .into_iter()
            .chain(local.into_iter().map(|p| p.id))
            .filter(|peer| *peer != self.inner.local)
            .unique()
            .take(self.inner.config.bucket_size)
            .map(|peer| self.wire_peer(peer, Vec::new()))
            .collect();
        Ok(merged)
    }

    /// Sign, store, and replicate a record under `key`.
    ///
    /// The record lands locally first; replication failures to individual
    /// peers do not fail the operation.
    pub async fn put_value(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_started()?;

        let mut signed = Vec::with_capacity(key.len() + value.len());
        signed.extend_from_slice(key);
        signed.extend_from_slice(value);
        let signature = self
            .inner
            .host
            .sign(&signed)
            .await
            .map_err(DhtError::Transient)?;
        let record = Record::new(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            self.inner.local.clone(),
            signature,
        );
        self.inner.validators.validate(&record)?;
        self.inner.records.write().await.put(record.clone());

        let result = self
            .run_query(
                KadId::hash(key),
                Message::find_node(Bytes::copy_from_slice(key)),
                SideChannels::default(),
                |_: &QueryPeerSet| false,
            )
            .await?;

        let targets: Vec<PeerId> = result
            .queried()
            .into_iter()
            .take(self.inner.config.resiliency)
            .collect();
        let message = Message::put_value(record);
        let sends = targets.iter().map(|peer| {
            let message = message.clone();
            async move {
                if let Err(err) = self.inner.client.send_request(peer, &message).await {
                    debug!(%peer, %err, "replicating record failed");
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }

    /// Fetch the best available record value for `key`.
    ///
    /// Locally stored records win outright. Otherwise every record the
    /// lookup surfaces is validated and the namespace validator picks the
    /// survivor. `Ok(None)` means the network does not have it; an
    /// unreachable network surfaces as `MaxRetries`.
    pub async fn get_value(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_started()?;

        if let Some(record) = self.inner.records.write().await.get(key) {
            return Ok(Some(record.value));
        }

        let (record_tx, mut record_rx) = mpsc::channel(PROVIDER_STREAM_BUFFER);
        let lookup = self.run_query(
            KadId::hash(key),
            Message::get_value(Bytes::copy_from_slice(key)),
            SideChannels {
                records: Some(record_tx),
                providers: None,
            },
            |_: &QueryPeerSet| false,
        );
        tokio::pin!(lookup);

        // Drain collected records while the lookup runs; the channel closes
        // once the lookup (and with it every sender clone) is done.
        let mut collected = Vec::new();
        let mut outcome = None;
        loop {
            tokio::select! {
                result = &mut lookup, if outcome.is_none() => outcome = Some(result),
                record = record_rx.recv() => match record {
                    Some(record) => collected.push(record),
                    None => break,
                },
            }
        }
        let result = match outcome {
            Some(result) => result?,
            None => return Err(DhtError::Internal("lookup ended without a result".into())),
        };

        let mut candidates = Vec::new();
        for record in collected {
            if record.key.as_ref() != key {
                continue;
            }
            match self.inner.validators.validate(&record) {
                Ok(()) => candidates.push(record),
                Err(err) => debug!(%err, "discarding invalid record from lookup"),
            }
        }

        if candidates.is_empty() {
            if let Some((peer, attempts)) = result.errors.iter().find_map(|(p, e)| match e {
                DhtError::MaxRetries { attempts, .. } => Some((p.clone(), *attempts)),
                _ => None,
            }) {
                return Err(DhtError::MaxRetries { peer, attempts });
            }
            return Ok(None);
        }

        let best = self.inner.validators.select(key, &candidates)?;
        Ok(candidates.into_iter().nth(best).map(|r| r.value))
    }

    /// Announce this node as a provider for a content id.
    pub async fn provide(&self, key: &[u8], announce: bool) -> Result<()> {
        self.ensure_started()?;
        let id = KadId::hash(key);
        let self_peer = self.wire_peer(self.inner.local.clone(), self.inner.host.local_addrs());
        {
            let mut providers = self.inner.providers.write().await;
            providers.add_provider(id, self.inner.local.clone(), self_peer.addrs.clone());
        }
        if !announce {
            return Ok(());
        }

        let result = self
            .run_query(
                id,
                Message::find_node(Bytes::copy_from_slice(key)),
                SideChannels::default(),
                |_: &QueryPeerSet| false,
            )
            .await?;

        let message = Message::add_provider(Bytes::copy_from_slice(key), self_peer);
        let targets: Vec<PeerId> = result
            .queried()
            .into_iter()
            .take(self.inner.config.resiliency)
            .collect();
        let sends = targets.iter().map(|peer| {
            let message = message.clone();
            async move {
                if let Err(err) = self.inner.client.send_oneway(peer, &message).await {
                    debug!(%peer, %err, "provider announcement failed");
                }
            }
        });
        futures::future::join_all(sends).await;
        Ok(())
    }

    /// Discover providers for a content id as a stream.
    ///
    /// Local providers are emitted immediately; the network lookup feeds
    /// the rest. The stream ends when `count` providers were seen, the
    /// lookup finishes, or the receiver is dropped.
    pub async fn find_providers(&self, key: &[u8], count: usize) -> Result<mpsc::Receiver<Peer>> {
        self.ensure_started()?;
        let id = KadId::hash(key);
        let key = Bytes::copy_from_slice(key);
        let (out_tx, out_rx) = mpsc::channel(PROVIDER_STREAM_BUFFER);

        let dht = self.clone();
        tokio::spawn(async move {
            let _guard = dht.inner.active.guard();
            let mut seen: HashSet<PeerId> = HashSet::new();
            let mut emitted = 0usize;

            let local = {
                let mut providers = dht.inner.providers.write().await;
                providers.providers_for(&id)
            };
            for peer in local {
                if seen.insert(peer.id.clone()) {
                    if out_tx.send(peer).await.is_err() {
                        return;
                    }
                    emitted += 1;
                    if count > 0 && emitted >= count {
                        return;
                    }
                }
            }

            let found = Arc::new(AtomicUsize::new(emitted));
            let (provider_tx, mut provider_rx) = mpsc::channel(PROVIDER_STREAM_BUFFER);
            let stop_found = found.clone();
            let wanted = count;
            let lookup_dht = dht.clone();
            let lookup_key = key.clone();
            let lookup = tokio::spawn(async move {
                let _ = lookup_dht
                    .run_query(
                        id,
                        Message::get_providers(lookup_key),
                        SideChannels {
                            records: None,
                            providers: Some(provider_tx),
                        },
                        move |_: &QueryPeerSet| {
                            wanted > 0 && stop_found.load(Ordering::SeqCst) >= wanted
                        },
                    )
                    .await;
            });

            while let Some(peer) = provider_rx.recv().await {
                if !seen.insert(peer.id.clone()) {
                    continue;
                }
                if out_tx.send(peer).await.is_err() {
                    break;
                }
                emitted += 1;
                found.store(emitted, Ordering::SeqCst);
                if count > 0 && emitted >= count {
                    break;
                }
            }
            lookup.abort();
        });

        Ok(out_rx)
    }

    /// Advertise this node under a service namespace. Returns how long the
    /// advertisement is valid.
    pub async fn advertise(&self, namespace: &str) -> Result<Duration> {
        let cid = KadId::hash(namespace.as_bytes());
        self.provide(cid.as_bytes(), true).await?;
        Ok(self.inner.config.provide_validity)
    }

    /// Discover peers advertising a service namespace.
    pub async fn find_peers(&self, namespace: &str, count: usize) -> Result<mpsc::Receiver<Peer>> {
        let cid = KadId::hash(namespace.as_bytes());
        self.find_providers(cid.as_bytes().as_slice(), count).await
    }

    /// Round-trip liveness check against one peer.
    pub async fn ping(&self, peer: &PeerId) -> Result<()> {
        self.ensure_started()?;
        self.inner.client.send_request(peer, &Message::ping()).await?;
        self.inner.routing_table.write().await.mark_query_ok(peer);
        Ok(())
    }

    /// A peer's public key, if the host's peer store holds it. Useful for
    /// verifying records authored by that peer.
    pub fn get_public_key(&self, peer: &PeerId) -> Option<Bytes> {
        self.inner.host.public_key(peer)
    }

    // ---- lookup plumbing ----------------------------------------------

    /// Drive one iterative lookup seeded from the routing table.
    pub(crate) async fn run_query<S>(
        &self,
        target: KadId,
        message: Message,
        side: SideChannels,
        stop_fn: S,
    ) -> Result<LookupResult>
    where
        S: FnMut(&QueryPeerSet) -> bool,
    {
        let _guard = self.inner.active.guard();
        self.inner
            .counters
            .queries_started
            .fetch_add(1, Ordering::Relaxed);

        let seeds: Vec<PeerId> = {
            let rt = self.inner.routing_table.read().await;
            rt.nearest(&target, self.inner.config.bucket_size)
                .into_iter()
                .map(|e| e.peer)
                .collect()
        };

        let params = LookupParams {
            target,
            alpha: self.inner.config.concurrency,
            beta: self.inner.config.resiliency,
            timeout: self.inner.config.query_timeout,
        };
        let cancel = self.inner.shutdown.subscribe();

        let dht = self.clone();
        let query_fn = move |peer: PeerId| {
            let dht = dht.clone();
            let message = message.clone();
            let side = side.clone();
            async move { dht.query_one(peer, message, side).await }
        };

        let result = run_lookup(params, seeds, query_fn, stop_fn, cancel).await;
        match result.termination {
            LookupTermination::Completed | LookupTermination::Starved => {
                self.inner
                    .counters
                    .queries_completed
                    .fetch_add(1, Ordering::Relaxed);
            }
            LookupTermination::TimedOut | LookupTermination::Cancelled => {
                self.inner
                    .counters
                    .queries_failed
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        if result.termination == LookupTermination::Cancelled {
            return Err(DhtError::Cancelled);
        }
        Ok(result)
    }

    /// One hop of a lookup: send the request, absorb the response into the
    /// routing table and address book, surface side-channel payloads.
    pub(crate) async fn query_one(
        &self,
        peer: PeerId,
        message: Message,
        side: SideChannels,
    ) -> Result<Vec<Peer>> {
        self.inner
            .counters
            .requests_sent
            .fetch_add(1, Ordering::Relaxed);

        let response = match self.inner.client.send_request(&peer, &message).await {
            Ok(response) => response,
            Err(err) => {
                self.inner
                    .counters
                    .requests_failed
                    .fetch_add(1, Ordering::Relaxed);
                // The peer was a routing candidate and has now failed us.
                let mut rt = self.inner.routing_table.write().await;
                if rt.remove(&peer).is_some() {
                    debug!(%peer, "evicted unreachable peer");
                }
                return Err(err);
            }
        };

        {
            let addrs = self.inner.host.addrs_of(&peer);
            let mut rt = self.inner.routing_table.write().await;
            rt.try_add(peer.clone(), &addrs, true, true);
        }

        for found in response
            .closer_peers
            .iter()
            .chain(response.provider_peers.iter())
        {
            if found.id == self.inner.local || found.addrs.is_empty() {
                continue;
            }
            // Network-sourced addresses are authoritative for this peer.
            self.inner.host.add_addrs(
                &found.id,
                found.addrs.clone(),
                self.inner.config.observed_addr_ttl,
            );
        }

        if let (Some(tx), Some(record)) = (&side.records, response.record.clone()) {
            let _ = tx.send(record).await;
        }
        if let Some(tx) = &side.providers {
            for provider in response.provider_peers.clone() {
                let _ = tx.send(provider).await;
            }
        }

        trace!(%peer, closer = response.closer_peers.len(), "lookup hop processed");
        Ok(response
            .closer_peers
            .into_iter()
            .filter(|p| p.id != self.inner.local)
            .collect())
    }

    fn wire_peer(&self, peer: PeerId, mut addrs: Vec<kad_protocol::Address>) -> Peer {
        for addr in self.inner.host.addrs_of(&peer) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        Peer::new(peer, addrs)
    }

    // ---- background tasks ---------------------------------------------

    pub(crate) async fn register_server_handler(&self) {
        self.inner
            .host
            .set_stream_handler(&self.inner.config.protocol_id, self.inner.handler.clone())
            .await;
        debug!(protocol = %self.inner.config.protocol_id, "inbound handler registered");
    }

    pub(crate) fn track_task(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().expect("task lock");
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn spawn_auto_mode_task(&self) {
        let dht = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dht.inner.config.auto_mode_poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let size = dht.inner.routing_table.read().await.len();
                        if dht
                            .inner
                            .mode
                            .should_activate_server(size, dht.inner.config.server_mode_min_peers)
                        {
                            info!(size, "routing table grown, switching to server mode");
                            dht.register_server_handler().await;
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.track_task(task);
    }

    fn spawn_sweeper_task(&self) {
        let records = self.inner.records.clone();
        let providers = self.inner.providers.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        records.write().await.sweep();
                        providers.write().await.sweep();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.track_task(task);
    }

    fn spawn_address_update_task(&self) {
        let dht = self.clone();
        let mut events = self.inner.host.subscribe_address_updates();
        let mut shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(_) => {
                            info!("local addresses changed, walking towards self");
                            if let Err(err) = dht.bootstrap(true).await {
                                warn!(%err, "self-walk after address change failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.track_task(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemNet;

    fn solo_node() -> Dht {
        let net = MemNet::new();
        let host = net.host(PeerId::new(vec![1]), Vec::new());
        let config = DhtConfig {
            query_timeout: Duration::from_secs(2),
            ..DhtConfig::default()
        };
        Dht::new(host, config)
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let dht = solo_node();
        assert!(matches!(
            dht.get_value(b"/v/k").await,
            Err(DhtError::NotStarted)
        ));
        assert!(matches!(
            dht.put_value(b"/v/k", b"v").await,
            Err(DhtError::NotStarted)
        ));
        assert!(matches!(
            dht.provide(b"cid", false).await,
            Err(DhtError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_put_then_get_same_node() {
        let dht = solo_node();
        dht.start().await.unwrap();

        dht.put_value(b"/v/greeting", b"hello").await.unwrap();
        let value = dht.get_value(b"/v/greeting").await.unwrap();
        assert_eq!(value.as_deref(), Some(b"hello".as_slice()));

        dht.close().await;
    }

    #[tokio::test]
    async fn test_provide_then_find_providers_includes_self() {
        let dht = solo_node();
        dht.start().await.unwrap();

        dht.provide(b"some-cid", false).await.unwrap();
        let mut stream = dht.find_providers(b"some-cid", 1).await.unwrap();
        let first = stream.recv().await.unwrap();
        assert_eq!(first.id, *dht.local_peer());

        dht.close().await;
    }

    #[tokio::test]
    async fn test_advertise_returns_validity() {
        let dht = solo_node();
        dht.start().await.unwrap();

        let ttl = dht.advertise("my-service").await.unwrap();
        assert_eq!(ttl, dht.inner.config.provide_validity);

        let mut stream = dht.find_peers("my-service", 1).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().id, *dht.local_peer());

        dht.close().await;
    }

    #[tokio::test]
    async fn test_closed_node_rejects_operations() {
        let dht = solo_node();
        dht.start().await.unwrap();
        dht.close().await;
        // Idempotent close.
        dht.close().await;

        assert!(matches!(
            dht.get_value(b"/v/k").await,
            Err(DhtError::Closed)
        ));
        assert!(matches!(dht.start().await, Err(DhtError::Closed)));
    }

    #[tokio::test]
    async fn test_find_peer_with_empty_network_is_absent() {
        let dht = solo_node();
        dht.start().await.unwrap();

        let found = dht.find_peer(&PeerId::new(vec![9])).await.unwrap();
        assert!(found.is_none());

        dht.close().await;
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let dht = solo_node();
        dht.start().await.unwrap();
        dht.put_value(b"/v/k", b"v").await.unwrap();

        let stats = dht.stats().await;
        assert_eq!(stats.records, 1);
        assert!(stats.queries_started >= 1);

        dht.close().await;
    }
}
