// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Kademlia DHT node engine.
//!
//! This crate implements the core of a content-addressed DHT node: a
//! bucketed routing table over the XOR keyspace, an iterative alpha-parallel
//! query engine, in-memory record and provider stores with TTL, namespaced
//! record validation, and the request/response state machine spoken over
//! host-provided streams.
//!
//! The node does not own a transport. It consumes a [`host::Host`]
//! implementation for dialing, stream negotiation, the address book, and
//! signing; everything network-shaped below that line is out of scope here.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod host;
pub mod kbucket;
pub mod mode;
pub mod node;
pub mod provider_store;
pub mod query;
pub mod record_store;
pub mod routing_table;
pub mod testing;
pub mod validator;

pub use config::{BootstrapPeer, DhtConfig};
pub use error::{DhtError, Result};
pub use host::{Host, HostError, HostStream, StreamHandler};
pub use mode::Mode;
pub use node::{Dht, DhtStats, FoundPeer};
pub use query::{LookupResult, LookupTermination, PeerState};

// Convenience re-exports for callers that only need wire types.
pub use kad_protocol::{Address, KadId, Message, MessageType, Peer, PeerId, Record};
