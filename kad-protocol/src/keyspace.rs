// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The 256-bit XOR keyspace.
//!
//! Peers and record keys are mapped onto `KadId` by hashing; routing and
//! lookups order candidates by the XOR distance between ids. The number of
//! leading zero bits of a distance is the common prefix length (CPL), which
//! doubles as the routing-table bucket index.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Number of bits in a `KadId`, and the bucket count upper bound.
pub const KEY_BITS: u32 = 256;

/// A point in the Kademlia keyspace.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KadId([u8; 32]);

impl KadId {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the keyspace position of a peer: SHA-256 of its id bytes.
    pub fn from_peer(peer: &PeerId) -> Self {
        Self::hash(peer.as_bytes())
    }

    /// Derive the keyspace position of an arbitrary key (record key,
    /// content id, namespace string).
    pub fn hash(input: &[u8]) -> Self {
        let digest = Sha256::digest(input);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &KadId) -> Distance {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(bytes)
    }

    /// Number of leading bits shared with `other` (0..=256; 256 iff equal).
    pub fn common_prefix_len(&self, other: &KadId) -> u32 {
        self.distance(other).leading_zeros()
    }
}

impl std::fmt::Display for KadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// XOR distance between two keyspace points.
///
/// `Ord` is lexicographic over the big-endian bytes, which matches numeric
/// ordering of the 256-bit value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 32]);

impl Distance {
    /// Leading zero bits; this is the common prefix length of the two
    /// original ids.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> KadId {
        let mut bytes = [0u8; 32];
        bytes[0] = b;
        KadId::from_bytes(bytes)
    }

    #[test]
    fn test_distance_is_xor() {
        let a = id_with_first_byte(0b1010_1010);
        let b = id_with_first_byte(0b1100_1100);
        let d = a.distance(&b);
        assert_eq!(d.0[0], 0b0110_0110);
        assert_eq!(&d.0[1..], &[0u8; 31]);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = KadId::hash(b"self");
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.common_prefix_len(&a), KEY_BITS);
    }

    #[test]
    fn test_cpl_counts_leading_shared_bits() {
        let a = id_with_first_byte(0b0000_0000);
        let b = id_with_first_byte(0b0001_0000);
        assert_eq!(a.common_prefix_len(&b), 3);

        let c = id_with_first_byte(0b1000_0000);
        assert_eq!(a.common_prefix_len(&c), 0);
    }

    #[test]
    fn test_distance_ordering_is_numeric() {
        let target = id_with_first_byte(0);
        let near = id_with_first_byte(1);
        let far = id_with_first_byte(2);
        assert!(target.distance(&near) < target.distance(&far));
    }

    #[test]
    fn test_peer_hashing_is_deterministic() {
        let peer = PeerId::new(b"peer-1".to_vec());
        assert_eq!(KadId::from_peer(&peer), KadId::from_peer(&peer));
        assert_ne!(
            KadId::from_peer(&peer),
            KadId::from_peer(&PeerId::new(b"peer-2".to_vec()))
        );
    }
}
