// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire protocol and keyspace types for the kad DHT.
//!
//! This crate holds everything both sides of a DHT stream need to agree on:
//! peer identities and addresses, the 256-bit XOR keyspace, signed records,
//! the request/response message structure, and the length-prefixed codec.

pub mod codec;
pub mod error;
pub mod identity;
pub mod keyspace;
pub mod messages;
pub mod record;

pub use codec::{decode_message, encode_message, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use identity::{Address, PeerId};
pub use keyspace::{Distance, KadId};
pub use messages::{ConnectionType, Message, MessageType, Peer};
pub use record::{split_record_key, Record};

/// Protocol identifier negotiated when opening a DHT stream.
pub const DEFAULT_PROTOCOL_ID: &str = "/ipfs/kad/1.0.0";
