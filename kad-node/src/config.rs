// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! DHT node configuration.

use std::time::Duration;

use kad_protocol::{Address, PeerId, DEFAULT_PROTOCOL_ID};

use crate::mode::Mode;

/// A configured entry point into the network.
#[derive(Clone, Debug)]
pub struct BootstrapPeer {
    pub id: PeerId,
    pub addrs: Vec<Address>,
}

/// Configuration for DHT behavior.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Initial and target DHT mode
    pub mode: Mode,
    /// Max peers per bucket (the Kademlia k value)
    pub bucket_size: usize,
    /// Parallel in-flight requests per lookup (alpha)
    pub concurrency: usize,
    /// Queried peers required for lookup success (beta)
    pub resiliency: usize,
    /// Explicit entry-point peers
    pub bootstrap_peers: Vec<BootstrapPeer>,
    /// Provider-record lifetime
    pub provide_validity: Duration,
    /// Provider address lifetime in the address book
    pub provider_addr_ttl: Duration,
    /// Enable periodic routing-table refresh
    pub auto_refresh: bool,
    /// Periodic refresh period
    pub refresh_interval: Duration,
    /// Per-message retry ceiling
    pub max_retry_attempts: u32,
    /// Retry base delay
    pub retry_initial_backoff: Duration,
    /// Retry delay ceiling
    pub retry_max_backoff: Duration,
    /// Exponential retry factor
    pub retry_backoff_factor: f64,
    /// Omit loopback addresses in outbound responses
    pub filter_loopback_in_responses: bool,
    /// Total routing-table size cap
    pub max_routing_table_size: usize,
    /// Auto mode flips to Server at this routing-table size
    pub server_mode_min_peers: usize,
    /// Per-stream IO timeout (open, read, write)
    pub request_timeout: Duration,
    /// Whole-lookup wall clock
    pub query_timeout: Duration,
    /// Store sweeper cadence
    pub sweep_interval: Duration,
    /// Protocol identifier negotiated on streams
    pub protocol_id: String,
    /// Auto-mode routing-table polling cadence
    pub auto_mode_poll_interval: Duration,
    /// Routing-table size below which a bootstrap is retriggered
    pub bootstrap_low_watermark: usize,
    /// How long a peer may go without a successful outbound query before
    /// the liveness sweep pings it
    pub usefulness_grace_period: Duration,
    /// TTL for addresses observed on inbound streams
    pub observed_addr_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            bucket_size: 20,
            concurrency: 10,
            resiliency: 3,
            bootstrap_peers: Vec::new(),
            provide_validity: Duration::from_secs(24 * 60 * 60),
            provider_addr_ttl: Duration::from_secs(24 * 60 * 60),
            auto_refresh: true,
            refresh_interval: Duration::from_secs(15 * 60),
            max_retry_attempts: 3,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            retry_backoff_factor: 2.0,
            filter_loopback_in_responses: true,
            max_routing_table_size: 1000,
            server_mode_min_peers: 4,
            request_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10 * 60),
            protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            auto_mode_poll_interval: Duration::from_secs(10),
            bootstrap_low_watermark: 10,
            usefulness_grace_period: Duration::from_secs(10 * 60),
            observed_addr_ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_parameters() {
        let config = DhtConfig::default();
        assert_eq!(config.bucket_size, 20);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.resiliency, 3);
        assert_eq!(config.server_mode_min_peers, 4);
        assert_eq!(config.refresh_interval, Duration::from_secs(900));
        assert_eq!(config.protocol_id, "/ipfs/kad/1.0.0");
    }
}
