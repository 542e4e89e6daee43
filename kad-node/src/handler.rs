// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Server-side dispatch for inbound DHT streams.
//!
//! Each stream carries one request. The handler reads it under a timeout,
//! caches the remote's observed address, admits the remote into the routing
//! table, answers per message type, and closes. Anything malformed resets
//! the stream without a response; a bad stream never takes the handler down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, trace};

use kad_protocol::{
    decode_message, encode_message, KadId, Message, MessageType, Peer, PeerId,
};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::host::{Host, HostStream, StreamHandler};
use crate::kbucket::PeerEntry;
use crate::provider_store::ProviderStore;
use crate::record_store::RecordStore;
use crate::routing_table::RoutingTable;
use crate::validator::ValidatorRegistry;

/// Inbound request handler registered under the DHT protocol id.
pub struct InboundHandler {
    host: Arc<dyn Host>,
    routing_table: Arc<RwLock<RoutingTable>>,
    records: Arc<RwLock<RecordStore>>,
    providers: Arc<RwLock<ProviderStore>>,
    validators: Arc<ValidatorRegistry>,
    bucket_size: usize,
    request_timeout: Duration,
    observed_addr_ttl: Duration,
    provider_addr_ttl: Duration,
    filter_loopback: bool,
}

impl InboundHandler {
    pub fn new(
        host: Arc<dyn Host>,
        routing_table: Arc<RwLock<RoutingTable>>,
        records: Arc<RwLock<RecordStore>>,
        providers: Arc<RwLock<ProviderStore>>,
        validators: Arc<ValidatorRegistry>,
        config: &DhtConfig,
    ) -> Self {
        Self {
            host,
            routing_table,
            records,
            providers,
            validators,
            bucket_size: config.bucket_size,
            request_timeout: config.request_timeout,
            observed_addr_ttl: config.observed_addr_ttl,
            provider_addr_ttl: config.provider_addr_ttl,
            filter_loopback: config.filter_loopback_in_responses,
        }
    }

    async fn serve(&self, remote: PeerId, stream: &mut Box<dyn HostStream>) -> Result<()> {
        let frame = timeout(self.request_timeout, stream.read())
            .await
            .map_err(|_| DhtError::Timeout)?
            .map_err(DhtError::Transient)?;
        let request = decode_message(&frame)?;

        if let Some(addr) = stream.remote_addr() {
            self.host
                .add_addrs(&remote, vec![addr], self.observed_addr_ttl);
        }

        {
            let addrs = self.host.addrs_of(&remote);
            let mut rt = self.routing_table.write().await;
            rt.try_add(remote.clone(), &addrs, true, true);
        }

        trace!(%remote, msg_type = ?request.msg_type, "inbound request");
        match self.dispatch(&remote, request).await? {
            Some(response) => {
                let frame = encode_message(&response)?;
                timeout(self.request_timeout, stream.write(frame))
                    .await
                    .map_err(|_| DhtError::Timeout)?
                    .map_err(DhtError::Transient)?;
                let _ = stream.close().await;
            }
            None => {
                let _ = stream.close().await;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, remote: &PeerId, request: Message) -> Result<Option<Message>> {
        match request.msg_type {
            MessageType::Ping => Ok(Some(Message::response_to(&request))),

            MessageType::FindNode => {
                let key = request.key.as_ref().ok_or(DhtError::Protocol(
                    kad_protocol::ProtocolError::MalformedKey,
                ))?;
                let closer = self.closer_peers(&KadId::hash(key), remote).await;
                Ok(Some(Message::response_to(&request).with_closer_peers(closer)))
            }

            MessageType::GetValue => {
                let key = request.key.as_ref().ok_or(DhtError::Protocol(
                    kad_protocol::ProtocolError::MalformedKey,
                ))?;
                let record = self.records.write().await.get(key);
                let closer = self.closer_peers(&KadId::hash(key), remote).await;
                let mut response = Message::response_to(&request).with_closer_peers(closer);
                if let Some(record) = record {
                    response = response.with_record(record);
                }
                Ok(Some(response))
            }

            MessageType::PutValue => {
                let record = request.record.clone().ok_or(DhtError::Protocol(
                    kad_protocol::ProtocolError::MalformedKey,
                ))?;
                self.validators.validate(&record)?;

                let mut records = self.records.write().await;
                let accept = match records.get(&record.key) {
                    Some(existing) => {
                        // Incoming first: the generic namespace prefers the
                        // newer arrival on ties.
                        let candidates = [record.clone(), existing];
                        self.validators.select(&record.key, &candidates)? == 0
                    }
                    None => true,
                };
                if accept {
                    debug!(%remote, key = ?record.key, "stored record");
                    records.put(record.clone());
                }
                Ok(Some(Message::response_to(&request).with_record(record)))
            }

            MessageType::GetProviders => {
                let key = request.key.as_ref().ok_or(DhtError::Protocol(
                    kad_protocol::ProtocolError::MalformedKey,
                ))?;
                let id = KadId::hash(key);
                let provider_peers = {
                    let mut providers = self.providers.write().await;
                    providers.providers_for(&id)
                };
                let provider_peers = self.filter_peers(provider_peers);
                let closer = self.closer_peers(&id, remote).await;
                Ok(Some(
                    Message::response_to(&request)
                        .with_provider_peers(provider_peers)
                        .with_closer_peers(closer),
                ))
            }

            MessageType::AddProvider => {
                let key = request.key.as_ref().ok_or(DhtError::Protocol(
                    kad_protocol::ProtocolError::MalformedKey,
                ))?;
                let id = KadId::hash(key);
                for peer in &request.provider_peers {
                    // Only the sender may announce itself as a provider.
                    if peer.id != *remote {
                        continue;
                    }
                    self.host.add_addrs(
                        &peer.id,
                        peer.addrs.clone(),
                        self.provider_addr_ttl,
                    );
                    let mut providers = self.providers.write().await;
                    providers.add_provider(id, peer.id.clone(), peer.addrs.clone());
                    debug!(%remote, "registered provider");
                }
                // The initiator closes the stream; no response travels back.
                Ok(None)
            }
        }
    }

    /// Up to K peers closest to `target`, excluding the requester, with
    /// address-book addresses merged in.
    async fn closer_peers(&self, target: &KadId, requester: &PeerId) -> Vec<Peer> {
        let rt = self.routing_table.read().await;
        let local = rt.local_peer().clone();
        let entries = rt.nearest(target, self.bucket_size + 1);
        drop(rt);

        let peers = entries
            .into_iter()
            .filter(|e| e.peer != *requester && e.peer != local)
            .take(self.bucket_size)
            .map(|e| self.wire_peer(e))
            .collect();
        self.filter_peers(peers)
    }

    fn wire_peer(&self, entry: PeerEntry) -> Peer {
        let mut peer = Peer::new(entry.peer.clone(), entry.addrs);
        for addr in self.host.addrs_of(&entry.peer) {
            if !peer.addrs.contains(&addr) {
                peer.addrs.push(addr);
            }
        }
        peer
    }

    fn filter_peers(&self, peers: Vec<Peer>) -> Vec<Peer> {
        if !self.filter_loopback {
            return peers;
        }
        peers.into_iter().map(Peer::without_loopback).collect()
    }
}

#[async_trait]
impl StreamHandler for InboundHandler {
    async fn handle(&self, remote: PeerId, mut stream: Box<dyn HostStream>) {
        if let Err(err) = self.serve(remote.clone(), &mut stream).await {
            debug!(%remote, %err, "inbound stream failed, resetting");
            stream.reset();
        }
    }
}
