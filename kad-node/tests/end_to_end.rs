// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end scenarios over an in-process network.
//!
//! These tests run several DHT nodes against the channel-backed `MemNet`
//! host so real lookups, replication, and bootstrap flows execute without
//! sockets.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::time::timeout;

use kad_node::testing::{MemHost, MemNet};
use kad_node::{Address, BootstrapPeer, Dht, DhtConfig, DhtError, Mode, PeerId};

fn peer(id: u8) -> PeerId {
    PeerId::new(vec![id])
}

fn addr(id: u8) -> Address {
    Address::new("tcp", format!("192.0.2.{id}:4001"))
}

fn test_config(mode: Mode, bootstrap: &[&Dht]) -> DhtConfig {
    DhtConfig {
        mode,
        bootstrap_peers: bootstrap
            .iter()
            .map(|dht| BootstrapPeer {
                id: dht.local_peer().clone(),
                addrs: Vec::new(),
            })
            .collect(),
        query_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        retry_initial_backoff: Duration::from_millis(10),
        retry_max_backoff: Duration::from_millis(50),
        auto_mode_poll_interval: Duration::from_millis(100),
        ..DhtConfig::default()
    }
}

struct TestNode {
    dht: Dht,
    host: Arc<MemHost>,
}

async fn spawn_node(
    net: &Arc<MemNet>,
    id: u8,
    mode: Mode,
    bootstrap: &[&Dht],
) -> Result<TestNode> {
    let host = net.host(peer(id), vec![addr(id)]);
    let dht = Dht::new(host.clone(), test_config(mode, bootstrap));
    dht.start().await?;
    Ok(TestNode { dht, host })
}

/// Poll `predicate` until it holds or `wait` elapses.
async fn eventually<F, Fut>(wait: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_two_node_put_get() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;

    b.dht.put_value(b"/v/foo", b"hi").await?;

    let value = timeout(Duration::from_secs(5), a.dht.get_value(b"/v/foo")).await??;
    assert_eq!(value.as_deref(), Some(b"hi".as_slice()));

    b.dht.close().await;
    a.dht.close().await;
    Ok(())
}

#[tokio::test]
async fn test_provide_and_find_across_nodes() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;
    let c = spawn_node(&net, 3, Mode::Server, &[&a.dht]).await?;

    b.dht.provide(b"QmContentAbc", true).await?;

    let mut stream = c.dht.find_providers(b"QmContentAbc", 1).await?;
    let provider = timeout(Duration::from_secs(10), stream.recv())
        .await?
        .expect("provider stream ended empty");
    assert_eq!(provider.id, *b.dht.local_peer());

    for node in [a, b, c] {
        node.dht.close().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_chain_discovers_transitively() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;
    // C only knows B; B only knows A.
    let c = spawn_node(&net, 3, Mode::Server, &[&b.dht]).await?;

    // Deep bootstrap runs the populate walks synchronously.
    timeout(Duration::from_secs(15), c.dht.bootstrap(false)).await??;

    let c_dht = c.dht.clone();
    let found_both = eventually(Duration::from_secs(15), move || {
        let c_dht = c_dht.clone();
        async move {
            let closest = c_dht.get_closest_peers(b"anything", false).await.unwrap();
            let ids: Vec<PeerId> = closest.into_iter().map(|p| p.id).collect();
            ids.contains(&peer(1)) && ids.contains(&peer(2))
        }
    })
    .await;
    assert!(found_both, "C never learned about both A and B");

    for node in [a, b, c] {
        node.dht.close().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_unreachable_bootstrap_peers_do_not_hang() -> Result<()> {
    let net = MemNet::new();
    let host = net.host(peer(1), vec![addr(1)]);
    let config = DhtConfig {
        bootstrap_peers: vec![
            BootstrapPeer {
                id: peer(101),
                addrs: vec![addr(101)],
            },
            BootstrapPeer {
                id: peer(102),
                addrs: vec![addr(102)],
            },
        ],
        query_timeout: Duration::from_secs(3),
        request_timeout: Duration::from_millis(500),
        retry_initial_backoff: Duration::from_millis(10),
        retry_max_backoff: Duration::from_millis(50),
        ..DhtConfig::default()
    };
    let dht = Dht::new(host, config);

    timeout(Duration::from_secs(30), dht.start()).await??;
    assert_eq!(dht.routing_table_size().await, 0);

    // Queries against an empty network come back absent, not as errors.
    let found = timeout(Duration::from_secs(10), dht.find_peer(&peer(42))).await??;
    assert!(found.is_none());

    dht.close().await;
    Ok(())
}

#[tokio::test]
async fn test_lookup_failure_evicts_peer() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;
    assert_eq!(b.dht.routing_table_size().await, 1);

    // A goes dark; the next lookup through it must fail and evict it.
    net.set_unreachable(&peer(1), true);
    let _ = b.dht.find_peer(&peer(1)).await;

    assert_eq!(b.dht.routing_table_size().await, 0);

    b.dht.close().await;
    a.dht.close().await;
    Ok(())
}

#[tokio::test]
async fn test_address_change_triggers_self_walk() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;

    // Let the initial background populate settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let before = b.dht.stats().await.requests_sent;

    b.host.update_local_addrs(vec![addr(2), addr(202)]);

    let b_dht = b.dht.clone();
    let walked = eventually(Duration::from_secs(5), move || {
        let b_dht = b_dht.clone();
        async move { b_dht.stats().await.requests_sent > before }
    })
    .await;
    assert!(walked, "no outbound traffic after address change");

    b.dht.close().await;
    a.dht.close().await;
    Ok(())
}

#[tokio::test]
async fn test_auto_mode_flips_to_server_once_connected() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;
    let c = spawn_node(&net, 3, Mode::Server, &[&a.dht]).await?;
    let d = spawn_node(&net, 4, Mode::Server, &[&a.dht]).await?;

    // Auto node bootstraps into a 4-peer network, which is exactly the
    // server-mode threshold.
    let auto = spawn_node(&net, 9, Mode::Auto, &[&a.dht, &b.dht, &c.dht, &d.dht]).await?;

    let auto_dht = auto.dht.clone();
    let flipped = eventually(Duration::from_secs(5), move || {
        let auto_dht = auto_dht.clone();
        async move { auto_dht.mode() == Mode::Server }
    })
    .await;
    assert!(flipped, "auto node never reached server mode");

    // Once serving, other nodes can query it directly.
    let value_holder = auto.dht.clone();
    value_holder.put_value(b"/v/from-auto", b"yes").await?;
    let got = a.dht.get_value(b"/v/from-auto").await?;
    assert_eq!(got.as_deref(), Some(b"yes".as_slice()));

    for node in [a, b, c, d, auto] {
        node.dht.close().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_auto_mode_stays_client_below_threshold() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let auto = spawn_node(&net, 9, Mode::Auto, &[&a.dht]).await?;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(auto.dht.mode(), Mode::Client);

    auto.dht.close().await;
    a.dht.close().await;
    Ok(())
}

#[tokio::test]
async fn test_get_value_distinguishes_unreachable_from_absent() -> Result<()> {
    let net = MemNet::new();
    let a = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let b = spawn_node(&net, 2, Mode::Server, &[&a.dht]).await?;

    // Absent but reachable: not found, no error.
    let missing = b.dht.get_value(b"/v/never-stored").await?;
    assert!(missing.is_none());

    // Re-seed the table, then kill the only route.
    b.dht.bootstrap(true).await?;
    net.set_unreachable(&peer(1), true);
    match b.dht.get_value(b"/v/never-stored").await {
        Err(DhtError::MaxRetries { .. }) | Ok(None) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }

    b.dht.close().await;
    a.dht.close().await;
    Ok(())
}

#[tokio::test]
async fn test_record_replicates_to_closest_nodes() -> Result<()> {
    let net = MemNet::new();
    let hub = spawn_node(&net, 1, Mode::Server, &[]).await?;
    let mut nodes = vec![hub];
    for id in 2..=6u8 {
        let node = {
            let hub_dht = &nodes[0].dht;
            spawn_node(&net, id, Mode::Server, &[hub_dht]).await?
        };
        node.dht.bootstrap(false).await?;
        nodes.push(node);
    }

    nodes[5].dht.put_value(b"/v/widely-known", b"data").await?;

    // Any node can resolve the record over the network.
    for node in &nodes {
        let value = timeout(
            Duration::from_secs(5),
            node.dht.get_value(b"/v/widely-known"),
        )
        .await??;
        assert_eq!(value.as_deref(), Some(b"data".as_slice()), "node failed");
    }

    for node in nodes {
        node.dht.close().await;
    }
    Ok(())
}
