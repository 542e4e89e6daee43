// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Request/response message structure for the DHT protocol.
//!
//! One `Message` shape serves both directions; the type tag says which of
//! the optional fields are meaningful. This mirrors the classic Kademlia
//! wire format where a response reuses the request's frame layout.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::identity::{Address, PeerId};
use crate::record::Record;

/// Message type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Ping,
    FindNode,
    GetValue,
    PutValue,
    GetProviders,
    AddProvider,
}

/// Sender's view of its connection to an advertised peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    NotConnected,
    Connected,
    CanConnect,
    CannotConnect,
}

/// A peer advertised inside a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub addrs: Vec<Address>,
    pub connection: ConnectionType,
}

impl Peer {
    pub fn new(id: PeerId, addrs: Vec<Address>) -> Self {
        Self {
            id,
            addrs,
            connection: ConnectionType::NotConnected,
        }
    }

    /// Drop loopback addresses from this peer's advertisement.
    pub fn without_loopback(mut self) -> Self {
        self.addrs.retain(|a| !a.is_loopback());
        self
    }
}

/// A single DHT protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub key: Option<Bytes>,
    pub record: Option<Record>,
    pub closer_peers: Vec<Peer>,
    pub provider_peers: Vec<Peer>,
}

impl Message {
    fn bare(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            key: None,
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    pub fn ping() -> Self {
        Self::bare(MessageType::Ping)
    }

    pub fn find_node(key: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(MessageType::FindNode)
        }
    }

    pub fn get_value(key: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(MessageType::GetValue)
        }
    }

    pub fn put_value(record: Record) -> Self {
        Self {
            key: Some(record.key.clone()),
            record: Some(record),
            ..Self::bare(MessageType::PutValue)
        }
    }

    pub fn get_providers(key: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(MessageType::GetProviders)
        }
    }

    pub fn add_provider(key: impl Into<Bytes>, provider: Peer) -> Self {
        Self {
            key: Some(key.into()),
            provider_peers: vec![provider],
            ..Self::bare(MessageType::AddProvider)
        }
    }

    /// Build the response frame for a request, carrying the same type tag
    /// and key.
    pub fn response_to(request: &Message) -> Self {
        Self {
            key: request.key.clone(),
            ..Self::bare(request.msg_type)
        }
    }

    pub fn with_closer_peers(mut self, peers: Vec<Peer>) -> Self {
        self.closer_peers = peers;
        self
    }

    pub fn with_provider_peers(mut self, peers: Vec<Peer>) -> Self {
        self.provider_peers = peers;
        self
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.record = Some(record);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructors_set_key() {
        let msg = Message::find_node(b"target".as_slice());
        assert_eq!(msg.msg_type, MessageType::FindNode);
        assert_eq!(msg.key.as_deref(), Some(b"target".as_slice()));
        assert!(msg.closer_peers.is_empty());
    }

    #[test]
    fn test_response_echoes_type_and_key() {
        let req = Message::get_value(b"/v/k".as_slice());
        let resp = Message::response_to(&req);
        assert_eq!(resp.msg_type, MessageType::GetValue);
        assert_eq!(resp.key, req.key);
        assert!(resp.record.is_none());
    }

    #[test]
    fn test_without_loopback_filters_addresses() {
        let peer = Peer::new(
            PeerId::new(vec![1]),
            vec![
                Address::new("tcp", "127.0.0.1:4001"),
                Address::new("tcp", "192.0.2.1:4001"),
            ],
        )
        .without_loopback();
        assert_eq!(peer.addrs.len(), 1);
        assert_eq!(peer.addrs[0].endpoint, "192.0.2.1:4001");
    }
}
