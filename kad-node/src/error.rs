// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Error types for DHT node operations.

use thiserror::Error;

use crate::host::HostError;
use kad_protocol::{PeerId, ProtocolError};

/// Result type used throughout kad-node.
pub type Result<T> = std::result::Result<T, DhtError>;

/// Main error type for DHT operations.
#[derive(Error, Debug)]
pub enum DhtError {
    /// Operation requires a started node
    #[error("DHT not started")]
    NotStarted,

    /// Operation arrived after shutdown
    #[error("DHT closed")]
    Closed,

    /// Transient network failure, absorbed by retry below the query layer
    #[error("Transient network error: {0}")]
    Transient(HostError),

    /// All retry attempts against one peer were exhausted
    #[error("Exhausted {attempts} attempts sending to {peer}")]
    MaxRetries { peer: PeerId, attempts: u32 },

    /// Whole-operation wall clock exceeded
    #[error("Operation timed out")]
    Timeout,

    /// Cooperative cancellation observed
    #[error("Operation cancelled")]
    Cancelled,

    /// Malformed message on the wire; the offending stream is reset
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Record failed its namespace validator
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No validator registered for a record key's namespace
    #[error("No validator for namespace: {0}")]
    UnknownNamespace(String),

    /// Channel or task plumbing failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DhtError {
    /// Whether the underlying failure is worth another attempt at the
    /// network-client layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, DhtError::Transient(_))
    }
}

impl From<HostError> for DhtError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::ProtocolNegotiation(_) => {
                DhtError::Internal(format!("protocol negotiation: {err}"))
            }
            other => DhtError::Transient(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err: DhtError = HostError::ConnectionRefused.into();
        assert!(err.is_transient());
        assert!(!DhtError::Timeout.is_transient());
        assert!(!DhtError::Cancelled.is_transient());
    }
}
