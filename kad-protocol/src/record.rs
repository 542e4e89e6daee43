// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Signed key/value records.
//!
//! Record keys are namespaced: `/<namespace>/<suffix>`. The namespace
//! selects which validator gets to accept or reject the record.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::PeerId;

/// A signed key/value pair carried over PUT_VALUE / GET_VALUE.
///
/// The signature covers `key || value` and is produced by `author`.
/// Receive-time metadata is kept by the datastore, not on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    pub author: PeerId,
    pub signature: Bytes,
}

impl Record {
    pub fn new(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        author: PeerId,
        signature: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            author,
            signature: signature.into(),
        }
    }
}

/// Split a record key into its namespace and suffix.
///
/// Keys must look like `/<namespace>/<suffix>` with a non-empty namespace.
pub fn split_record_key(key: &[u8]) -> Result<(&str, &[u8]), ProtocolError> {
    if key.first() != Some(&b'/') {
        return Err(ProtocolError::MalformedKey);
    }
    let rest = &key[1..];
    let sep = rest
        .iter()
        .position(|b| *b == b'/')
        .ok_or(ProtocolError::MalformedKey)?;
    if sep == 0 {
        return Err(ProtocolError::MalformedKey);
    }
    let namespace =
        std::str::from_utf8(&rest[..sep]).map_err(|_| ProtocolError::MalformedKey)?;
    Ok((namespace, &rest[sep + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_record_key() {
        let (ns, suffix) = split_record_key(b"/v/some-name").unwrap();
        assert_eq!(ns, "v");
        assert_eq!(suffix, b"some-name");
    }

    #[test]
    fn test_split_rejects_malformed_keys() {
        assert!(split_record_key(b"no-slash").is_err());
        assert!(split_record_key(b"//empty-ns").is_err());
        assert!(split_record_key(b"/only-ns").is_err());
    }

    #[test]
    fn test_split_allows_empty_suffix_tail() {
        let (ns, suffix) = split_record_key(b"/pk/").unwrap();
        assert_eq!(ns, "pk");
        assert!(suffix.is_empty());
    }
}
