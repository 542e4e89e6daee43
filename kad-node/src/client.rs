// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Outbound message client: one request, one response, per stream.
//!
//! Transient failures (refused, reset, timed out) are retried with
//! exponentially backed-off, jittered delays; protocol failures are not.
//! A stream that errors is reset, never gracefully closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use kad_protocol::{decode_message, encode_message, Message, PeerId};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::host::{Host, HostError};

/// Sends single request/response exchanges to remote peers.
pub struct MessageClient {
    host: Arc<dyn Host>,
    protocol_id: String,
    request_timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_factor: f64,
}

impl MessageClient {
    pub fn new(host: Arc<dyn Host>, config: &DhtConfig) -> Self {
        Self {
            host,
            protocol_id: config.protocol_id.clone(),
            request_timeout: config.request_timeout,
            max_attempts: config.max_retry_attempts.max(1),
            initial_backoff: config.retry_initial_backoff,
            max_backoff: config.retry_max_backoff,
            backoff_factor: config.retry_backoff_factor,
        }
    }

    /// Send `msg` to `peer` and await the single framed response.
    pub async fn send_request(&self, peer: &PeerId, msg: &Message) -> Result<Message> {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match self.attempt(peer, msg, true).await {
                Ok(Some(response)) => {
                    trace!(%peer, rtt = ?started.elapsed(), "request answered");
                    return Ok(response);
                }
                Ok(None) => {
                    // Only oneway sends may come back without a response.
                    return Err(DhtError::Internal("missing response".into()));
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(%peer, attempt, ?delay, %err, "transient send failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(%peer, attempts = attempt, "exhausted retry budget");
                    return Err(DhtError::MaxRetries {
                        peer: peer.clone(),
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fire-and-forget send: write the frame, close the stream, read
    /// nothing. Used for ADD_PROVIDER. Single attempt.
    pub async fn send_oneway(&self, peer: &PeerId, msg: &Message) -> Result<()> {
        self.attempt(peer, msg, false).await.map(|_| ())
    }

    async fn attempt(
        &self,
        peer: &PeerId,
        msg: &Message,
        want_response: bool,
    ) -> Result<Option<Message>> {
        let addrs = self.host.addrs_of(peer);
        self.host.connect(peer, &addrs).await?;

        let mut stream = timeout(
            self.request_timeout,
            self.host.new_stream(peer, &self.protocol_id),
        )
        .await
        .map_err(|_| DhtError::Transient(HostError::Timeout))??;

        let frame = match encode_message(msg) {
            Ok(frame) => frame,
            Err(err) => {
                stream.reset();
                return Err(err.into());
            }
        };

        if let Err(err) = timeout(self.request_timeout, stream.write(frame))
            .await
            .map_err(|_| HostError::Timeout)
            .and_then(|r| r)
        {
            stream.reset();
            return Err(DhtError::Transient(err));
        }

        if !want_response {
            stream.close().await.map_err(DhtError::Transient)?;
            return Ok(None);
        }

        let reply = match timeout(self.request_timeout, stream.read())
            .await
            .map_err(|_| HostError::Timeout)
            .and_then(|r| r)
        {
            Ok(reply) => reply,
            Err(err) => {
                stream.reset();
                return Err(DhtError::Transient(err));
            }
        };

        let response = match decode_message(&reply) {
            Ok(response) => response,
            Err(err) => {
                stream.reset();
                return Err(err.into());
            }
        };

        if response.msg_type != msg.msg_type {
            stream.reset();
            return Err(DhtError::Internal(format!(
                "response type {:?} does not match request {:?}",
                response.msg_type, msg.msg_type
            )));
        }

        let _ = stream.close().await;
        Ok(Some(response))
    }

    /// Delay before retry `attempt + 1`: exponential growth clamped to the
    /// ceiling, with 20% uniform jitter either way.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_backoff.as_secs_f64() * exp;
        let clamped = base.min(self.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(clamped * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemNet;
    use async_trait::async_trait;
    use kad_protocol::MessageType;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::host::{HostStream, StreamHandler};

    struct PingResponder;

    #[async_trait]
    impl StreamHandler for PingResponder {
        async fn handle(&self, _remote: PeerId, mut stream: Box<dyn HostStream>) {
            if let Ok(frame) = stream.read().await {
                if let Ok(request) = decode_message(&frame) {
                    let response = Message::response_to(&request);
                    if let Ok(encoded) = encode_message(&response) {
                        let _ = stream.write(encoded).await;
                    }
                }
            }
            let _ = stream.close().await;
        }
    }

    /// Responds with garbage bytes instead of a message frame.
    struct GarbageResponder;

    #[async_trait]
    impl StreamHandler for GarbageResponder {
        async fn handle(&self, _remote: PeerId, mut stream: Box<dyn HostStream>) {
            let _ = stream.read().await;
            let _ = stream.write(bytes::Bytes::from_static(&[0, 0, 0, 2, 0xff])).await;
        }
    }

    /// Counts inbound streams without ever answering.
    struct CountingBlackhole(Arc<AtomicU32>);

    #[async_trait]
    impl StreamHandler for CountingBlackhole {
        async fn handle(&self, _remote: PeerId, mut stream: Box<dyn HostStream>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            let _ = stream.read().await;
            // Drop without writing: the client sees a closed connection.
        }
    }

    fn fast_config() -> DhtConfig {
        DhtConfig {
            max_retry_attempts: 3,
            retry_initial_backoff: Duration::from_millis(5),
            retry_max_backoff: Duration::from_millis(20),
            request_timeout: Duration::from_millis(500),
            ..DhtConfig::default()
        }
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());
        let config = fast_config();
        b.set_stream_handler(&config.protocol_id, Arc::new(PingResponder))
            .await;

        let client = MessageClient::new(a, &config);
        let response = client
            .send_request(&PeerId::new(vec![2]), &Message::ping())
            .await
            .unwrap();
        assert_eq!(response.msg_type, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_unreachable_peer_exhausts_retries() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = PeerId::new(vec![2]);
        net.host(b.clone(), Vec::new());
        net.set_unreachable(&b, true);

        let client = MessageClient::new(a, &fast_config());
        let err = client.send_request(&b, &Message::ping()).await.unwrap_err();
        assert!(matches!(
            err,
            DhtError::MaxRetries { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_is_retried() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());
        let config = fast_config();
        let count = Arc::new(AtomicU32::new(0));
        b.set_stream_handler(
            &config.protocol_id,
            Arc::new(CountingBlackhole(count.clone())),
        )
        .await;

        let client = MessageClient::new(a, &config);
        let err = client
            .send_request(&PeerId::new(vec![2]), &Message::ping())
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::MaxRetries { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_retried() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());
        let config = fast_config();
        b.set_stream_handler(&config.protocol_id, Arc::new(GarbageResponder))
            .await;

        let client = MessageClient::new(a, &config);
        let err = client
            .send_request(&PeerId::new(vec![2]), &Message::ping())
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oneway_send_does_not_wait() {
        let net = MemNet::new();
        let a = net.host(PeerId::new(vec![1]), Vec::new());
        let b = net.host(PeerId::new(vec![2]), Vec::new());
        let config = fast_config();
        let count = Arc::new(AtomicU32::new(0));
        b.set_stream_handler(
            &config.protocol_id,
            Arc::new(CountingBlackhole(count.clone())),
        )
        .await;

        let client = MessageClient::new(a, &config);
        client
            .send_oneway(&PeerId::new(vec![2]), &Message::ping())
            .await
            .unwrap();
    }

    #[test]
    fn test_backoff_growth_and_clamp() {
        let net = MemNet::new();
        let host = net.host(PeerId::new(vec![1]), Vec::new());
        let config = DhtConfig {
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(30),
            retry_backoff_factor: 2.0,
            ..DhtConfig::default()
        };
        let client = MessageClient::new(host, &config);

        // 500ms * 2^(n-1), 20% jitter band.
        let first = client.backoff_delay(1);
        assert!(first >= Duration::from_millis(400) && first <= Duration::from_millis(600));

        let tenth = client.backoff_delay(10);
        // 500ms * 2^9 = 256s, clamped to 30s before jitter.
        assert!(tenth <= Duration::from_secs(36));
        assert!(tenth >= Duration::from_secs(24));
    }
}
