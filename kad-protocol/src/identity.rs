// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Peer identities and transport addresses.
//!
//! `PeerId` is an opaque byte string derived from a peer's public key; the
//! DHT never interprets it beyond equality and hashing to the keyspace.

use std::fmt::{self, Display};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Opaque peer identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    bytes: Vec<u8>,
}

impl PeerId {
    /// Create a new PeerId from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the raw bytes of this peer ID.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.bytes[..8.min(self.bytes.len())]))
    }
}

impl From<&[u8]> for PeerId {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Transport address for a peer.
///
/// Addresses are carried as a protocol tag plus an endpoint string, e.g.
/// `tcp` / `203.0.113.7:4001`. Resolution to actual connections is the
/// host's concern.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub protocol: String,
    pub endpoint: String,
}

impl Address {
    pub fn new(protocol: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Whether this address points at the local loopback interface.
    ///
    /// IPv4 127.0.0.0/8 and IPv6 `::1` are loopback. IPv6 link-local
    /// addresses are deliberately not treated as loopback; they may be
    /// reachable on the local segment.
    pub fn is_loopback(&self) -> bool {
        if let Ok(sock) = self.endpoint.parse::<SocketAddr>() {
            return sock.ip().is_loopback();
        }
        if let Ok(ip) = self.endpoint.parse::<IpAddr>() {
            return ip.is_loopback();
        }
        false
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.protocol, self.endpoint)
    }
}
