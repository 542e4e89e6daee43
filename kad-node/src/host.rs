// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The host abstraction consumed by the DHT.
//!
//! The node is transport-agnostic: connection management, stream
//! negotiation, the address book, key custody, and the event bus all live in
//! the host. This trait set is the narrow waist between the two; a test
//! harness can satisfy it with in-process channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

use kad_protocol::{Address, PeerId};

/// Failures surfaced by host operations.
///
/// The network client's retry policy keys off these variants, so hosts
/// should map their transport errors onto the closest one rather than
/// folding everything into `Other`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Network unreachable")]
    Unreachable,

    #[error("Stream operation timed out")]
    Timeout,

    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Host error: {0}")]
    Other(String),
}

impl HostError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::ConnectionRefused
                | HostError::ConnectionReset
                | HostError::ConnectionClosed
                | HostError::Unreachable
                | HostError::Timeout
        )
    }
}

/// A negotiated bidirectional stream to a remote peer.
///
/// Reads and writes are whole frames; framing below that is the host's
/// business. `reset` abandons the stream without a graceful close and is
/// the required teardown after any protocol error.
#[async_trait]
pub trait HostStream: Send + std::fmt::Debug {
    async fn write(&mut self, frame: Bytes) -> Result<(), HostError>;
    async fn read(&mut self) -> Result<Bytes, HostError>;
    async fn close(&mut self) -> Result<(), HostError>;
    fn reset(&mut self);

    /// Observed remote address of the underlying connection, if known.
    fn remote_addr(&self) -> Option<Address>;
}

/// Server-side callback for inbound streams on a registered protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, remote: PeerId, stream: Box<dyn HostStream>);
}

/// Event published by the host when the local listen addresses change.
#[derive(Clone, Debug)]
pub struct LocalAddressesUpdated {
    pub addrs: Vec<Address>,
}

/// The host consumed by the DHT node.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Local peer identity.
    fn local_peer(&self) -> PeerId;

    /// Currently advertised listen addresses.
    fn local_addrs(&self) -> Vec<Address>;

    /// Establish or reuse a connection to `peer`. Idempotent.
    async fn connect(&self, peer: &PeerId, addrs: &[Address]) -> Result<(), HostError>;

    /// Open a stream to `peer` negotiating `protocol`.
    async fn new_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<Box<dyn HostStream>, HostError>;

    /// Register the inbound handler for `protocol`.
    async fn set_stream_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);

    /// Remove the inbound handler for `protocol`.
    async fn remove_stream_handler(&self, protocol: &str);

    /// Known addresses of a peer from the address book.
    fn addrs_of(&self, peer: &PeerId) -> Vec<Address>;

    /// Record addresses for a peer with a bounded lifetime.
    fn add_addrs(&self, peer: &PeerId, addrs: Vec<Address>, ttl: Duration);

    /// Public key of a peer, if the peer store holds it.
    fn public_key(&self, peer: &PeerId) -> Option<Bytes>;

    /// Sign `data` with the local identity key.
    async fn sign(&self, data: &[u8]) -> Result<Bytes, HostError>;

    /// Verify `signature` over `data` against `author`'s public key.
    fn verify(&self, author: &PeerId, data: &[u8], signature: &[u8]) -> bool;

    /// Subscribe to local listen-address changes.
    fn subscribe_address_updates(&self) -> broadcast::Receiver<LocalAddressesUpdated>;
}
