// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-process host implementation for tests and examples.
//!
//! `MemNet` is a fake network: every [`MemHost`] registered on it can open
//! streams to every other, frames travel over tokio channels, and
//! "signatures" are plain hashes so no key material is involved. Peers can
//! be flagged unreachable to exercise failure paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};

use kad_protocol::{Address, PeerId};

use crate::host::{Host, HostError, HostStream, LocalAddressesUpdated, StreamHandler};

const STREAM_BUFFER: usize = 16;

#[derive(Default)]
struct MemNetInner {
    known: std::collections::HashSet<PeerId>,
    handlers: HashMap<(PeerId, String), Arc<dyn StreamHandler>>,
    unreachable: HashMap<PeerId, bool>,
}

/// A fake network connecting `MemHost` instances in one process.
#[derive(Default)]
pub struct MemNet {
    inner: Mutex<MemNetInner>,
}

impl MemNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a host attached to this network.
    pub fn host(self: &Arc<Self>, peer: PeerId, addrs: Vec<Address>) -> Arc<MemHost> {
        let (addr_events, _) = broadcast::channel(8);
        self.inner
            .lock()
            .expect("memnet lock")
            .known
            .insert(peer.clone());
        Arc::new(MemHost {
            net: Arc::clone(self),
            peer,
            addrs: Mutex::new(addrs),
            address_book: Mutex::new(HashMap::new()),
            addr_events,
        })
    }

    /// Flip reachability of a peer; unreachable peers refuse connections
    /// and streams.
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        let mut inner = self.inner.lock().expect("memnet lock");
        inner.unreachable.insert(peer.clone(), unreachable);
    }

    fn is_unreachable(&self, peer: &PeerId) -> bool {
        let inner = self.inner.lock().expect("memnet lock");
        !inner.known.contains(peer) || inner.unreachable.get(peer).copied().unwrap_or(false)
    }

    fn handler_for(&self, peer: &PeerId, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        let inner = self.inner.lock().expect("memnet lock");
        inner
            .handlers
            .get(&(peer.clone(), protocol.to_string()))
            .cloned()
    }
}

/// A channel-backed host on a [`MemNet`].
pub struct MemHost {
    net: Arc<MemNet>,
    peer: PeerId,
    addrs: Mutex<Vec<Address>>,
    address_book: Mutex<HashMap<PeerId, Vec<Address>>>,
    addr_events: broadcast::Sender<LocalAddressesUpdated>,
}

impl MemHost {
    /// Change the local addresses and publish the update event, as a real
    /// host would after a listen-address change.
    pub fn update_local_addrs(&self, addrs: Vec<Address>) {
        *self.addrs.lock().expect("addrs lock") = addrs.clone();
        let _ = self.addr_events.send(LocalAddressesUpdated { addrs });
    }

    /// Test-only signing on behalf of an arbitrary author.
    pub fn sign_as(&self, author: &PeerId, data: &[u8]) -> Bytes {
        let mut hasher = Sha256::new();
        hasher.update(author.as_bytes());
        hasher.update(data);
        Bytes::copy_from_slice(&hasher.finalize())
    }
}

#[async_trait]
impl Host for MemHost {
    fn local_peer(&self) -> PeerId {
        self.peer.clone()
    }

    fn local_addrs(&self) -> Vec<Address> {
        self.addrs.lock().expect("addrs lock").clone()
    }

    async fn connect(&self, peer: &PeerId, addrs: &[Address]) -> Result<(), HostError> {
        if self.net.is_unreachable(peer) || self.net.is_unreachable(&self.peer) {
            return Err(HostError::ConnectionRefused);
        }
        if !addrs.is_empty() {
            self.add_addrs(peer, addrs.to_vec(), Duration::from_secs(600));
        }
        Ok(())
    }

    async fn new_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<Box<dyn HostStream>, HostError> {
        if self.net.is_unreachable(peer) || self.net.is_unreachable(&self.peer) {
            return Err(HostError::ConnectionRefused);
        }
        let handler = self
            .net
            .handler_for(peer, protocol)
            .ok_or_else(|| HostError::ProtocolNegotiation(protocol.to_string()))?;

        let (client_tx, server_rx) = mpsc::channel(STREAM_BUFFER);
        let (server_tx, client_rx) = mpsc::channel(STREAM_BUFFER);

        let client_end = MemStream {
            tx: Some(client_tx),
            rx: client_rx,
            remote_addr: None,
        };
        let server_end = MemStream {
            tx: Some(server_tx),
            rx: server_rx,
            remote_addr: self.local_addrs().into_iter().next(),
        };

        let caller = self.peer.clone();
        tokio::spawn(async move {
            handler.handle(caller, Box::new(server_end)).await;
        });

        Ok(Box::new(client_end))
    }

    async fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        let mut inner = self.net.inner.lock().expect("memnet lock");
        inner
            .handlers
            .insert((self.peer.clone(), protocol.to_string()), handler);
    }

    async fn remove_stream_handler(&self, protocol: &str) {
        let mut inner = self.net.inner.lock().expect("memnet lock");
        inner
            .handlers
            .remove(&(self.peer.clone(), protocol.to_string()));
    }

    fn addrs_of(&self, peer: &PeerId) -> Vec<Address> {
        self.address_book
            .lock()
            .expect("address book lock")
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn add_addrs(&self, peer: &PeerId, addrs: Vec<Address>, _ttl: Duration) {
        let mut book = self.address_book.lock().expect("address book lock");
        let known = book.entry(peer.clone()).or_default();
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
    }

    fn public_key(&self, peer: &PeerId) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(peer.as_bytes()))
    }

    async fn sign(&self, data: &[u8]) -> Result<Bytes, HostError> {
        Ok(self.sign_as(&self.peer, data))
    }

    fn verify(&self, author: &PeerId, data: &[u8], signature: &[u8]) -> bool {
        self.sign_as(author, data).as_ref() == signature
    }

    fn subscribe_address_updates(&self) -> broadcast::Receiver<LocalAddressesUpdated> {
        self.addr_events.subscribe()
    }
}

#[derive(Debug)]
struct MemStream {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
    remote_addr: Option<Address>,
}

#[async_trait]
impl HostStream for MemStream {
    async fn write(&mut self, frame: Bytes) -> Result<(), HostError> {
        let tx = self.tx.as_ref().ok_or(HostError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| HostError::ConnectionReset)
    }

    async fn read(&mut self) -> Result<Bytes, HostError> {
        self.rx.recv().await.ok_or(HostError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), HostError> {
        self.tx = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn remote_addr(&self) -> Option<Address> {
        self.remote_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl StreamHandler for EchoHandler {
        async fn handle(&self, _remote: PeerId, mut stream: Box<dyn HostStream>) {
            if let Ok(frame) = stream.read().await {
                let _ = stream.write(frame).await;
            }
            let _ = stream.close().await;
        }
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());
        b.set_stream_handler("/test/1", Arc::new(EchoHandler)).await;

        let mut stream = a.new_stream(&b.local_peer(), "/test/1").await.unwrap();
        stream.write(Bytes::from_static(b"hello")).await.unwrap();
        let echoed = stream.read().await.unwrap();
        assert_eq!(echoed.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_unreachable_peer_refuses_streams() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());
        b.set_stream_handler("/test/1", Arc::new(EchoHandler)).await;
        net.set_unreachable(&b.local_peer(), true);

        let err = a.new_stream(&b.local_peer(), "/test/1").await.unwrap_err();
        assert_eq!(err, HostError::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_negotiation() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());

        let err = a.new_stream(&b.local_peer(), "/test/1").await.unwrap_err();
        assert!(matches!(err, HostError::ProtocolNegotiation(_)));
    }

    #[tokio::test]
    async fn test_signatures_verify_per_author() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let sig = a.sign(b"payload").await.unwrap();
        assert!(a.verify(&PeerId::new(vec![1]), b"payload", &sig));
        assert!(!a.verify(&PeerId::new(vec![2]), b"payload", &sig));
    }
}
