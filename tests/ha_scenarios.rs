//! End-to-end replication scenarios on in-process clusters

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use txrelay::context::TransactionContext;
use txrelay::membership::ClusterMembership;
use txrelay::node::ReplicationNode;
use txrelay::replication::{HaSettings, Role, SlotPhase};
use txrelay::transport::{Endpoint, LocalTransport, Request, RequestHandler, Response, Transport};
use txrelay::txlog::{MemoryTxStore, TxPayload, TxRecord, TxStore};
use txrelay::Error;

const PRIMARY: &str = "primary";
const REPLICA: &str = "replica-1";

fn settings() -> HaSettings {
    HaSettings {
        pull_interval: Duration::ZERO,
        push_factor: 1,
        push_timeout: Duration::from_secs(5),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        ..HaSettings::default()
    }
}

fn endpoint(id: &str) -> Endpoint {
    Endpoint::new(id, format!("local:{}", id))
}

fn records(count: u64) -> Vec<TxRecord> {
    (1..=count)
        .map(|i| TxRecord::new(i, PRIMARY, format!("tx-{}", i)))
        .collect()
}

async fn store_with(records: &[TxRecord]) -> Arc<MemoryTxStore> {
    let store = Arc::new(MemoryTxStore::new());
    for record in records {
        store.append(record.clone()).await.unwrap();
    }
    store
}

/// Build a node whose membership knows every id in `members` and has
/// `PRIMARY` as primary, and register it with the transport
async fn start_node(
    id: &str,
    members: &[&str],
    settings: HaSettings,
    store: Arc<MemoryTxStore>,
    transport: &Arc<LocalTransport>,
) -> Arc<ReplicationNode> {
    let membership = Arc::new(ClusterMembership::new(endpoint(id)));
    for member in members {
        membership.join(endpoint(member)).await;
    }
    membership.set_primary(PRIMARY).await.unwrap();

    let node = ReplicationNode::new(endpoint(id), settings, store, membership, transport.clone())
        .await
        .unwrap();
    transport.register(id, node.as_handler());
    node
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check()
}

async fn all_records(node: &ReplicationNode) -> Vec<TxRecord> {
    let tail = node.last_committed_tx_id();
    node.log().stream(0, tail).unwrap().collect_all().await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pull_storm_is_coalesced() {
    let transport = LocalTransport::new();
    // Default response limits: each pull is a single request
    let ha = settings();
    assert!(ha.pull_max_records >= 2000);
    let history = records(2000);
    let primary = start_node(PRIMARY, &[REPLICA], ha.clone(), store_with(&history).await, &transport).await;

    transport.set_latency(Duration::from_millis(50));
    let replica_store = Arc::new(MemoryTxStore::new());
    let replica = start_node(REPLICA, &[PRIMARY], ha, replica_store.clone(), &transport).await;

    // Tail must only ever move forward
    let sampler = {
        let store = replica_store.clone();
        tokio::spawn(async move {
            let mut last = 0;
            while last < 2000 {
                let tail = store.last_committed_tx_id();
                assert!(tail >= last, "tail went back from {} to {}", last, tail);
                last = tail;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let callers: Vec<_> = (0..20)
        .map(|_| {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move { replica.ensure_up_to_date().await })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap().unwrap();
    }
    sampler.await.unwrap();

    let pulls = transport.stats(PRIMARY).pulls();
    assert!(pulls <= 2, "{} pull RPCs reached the primary", pulls);
    assert_eq!(replica.last_committed_tx_id(), 2000);
    assert_eq!(all_records(&replica).await, all_records(&primary).await);
}

#[tokio::test]
async fn test_primary_loss_mid_pull_fails_every_waiter() {
    let transport = LocalTransport::new();
    let _primary = start_node(PRIMARY, &[REPLICA], settings(), store_with(&records(100)).await, &transport).await;

    transport.set_latency(Duration::from_millis(50));
    let replica = start_node(REPLICA, &[PRIMARY], settings(), Arc::new(MemoryTxStore::new()), &transport).await;
    let upstream = endpoint(PRIMARY);
    let waiters: Vec<_> = (0..5)
        .map(|_| replica.coalescer().ensure_up_to_date(&upstream))
        .collect();

    // Let the first request get on the wire, then lose the primary
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(replica.coalescer().phase(PRIMARY), Some(SlotPhase::Running));
    transport.set_reachable(PRIMARY, false);

    for waiter in waiters {
        assert!(matches!(waiter.wait().await, Err(Error::ReplicationUnavailable(_))));
    }
    assert_eq!(replica.last_committed_tx_id(), 0);

    let stats = transport.stats(PRIMARY);
    assert_eq!(stats.pulls(), 1 + u64::from(settings().pull_retry_max));
    assert_eq!(stats.failed(), stats.pulls());
    assert_eq!(replica.coalescer().pulls_dispatched(PRIMARY), 1);
}

#[tokio::test]
async fn test_primary_loss_after_first_response_keeps_applied_records() {
    let transport = LocalTransport::new();
    let ha = HaSettings {
        pull_max_records: 40,
        ..settings()
    };
    let _primary = start_node(PRIMARY, &[REPLICA], ha.clone(), store_with(&records(100)).await, &transport).await;

    transport.set_latency(Duration::from_millis(50));
    let replica = start_node(REPLICA, &[PRIMARY], ha.clone(), Arc::new(MemoryTxStore::new()), &transport).await;
    let upstream = endpoint(PRIMARY);
    let waiters: Vec<_> = (0..5)
        .map(|_| replica.coalescer().ensure_up_to_date(&upstream))
        .collect();

    // First 40 records applied, second request still on the wire
    assert!(wait_until(Duration::from_secs(2), || replica.last_committed_tx_id() >= 40).await);
    transport.set_reachable(PRIMARY, false);

    for waiter in waiters {
        assert!(matches!(waiter.wait().await, Err(Error::ReplicationUnavailable(_))));
    }
    assert_eq!(replica.last_committed_tx_id(), 40);
    let applied: Vec<u64> = all_records(&replica).await.iter().map(|r| r.tx_id).collect();
    assert_eq!(applied, (1..=40).collect::<Vec<_>>());

    let stats = transport.stats(PRIMARY);
    assert_eq!(stats.pulls(), 1 + 1 + u64::from(ha.pull_retry_max));
    assert_eq!(stats.failed(), stats.pulls() - 1);
    assert_eq!(replica.coalescer().pulls_dispatched(PRIMARY), 1);
}

#[tokio::test]
async fn test_push_factor_one_delivers_commit() {
    let transport = LocalTransport::new();
    let history = records(41);
    let primary = start_node(PRIMARY, &[REPLICA], settings(), store_with(&history).await, &transport).await;
    let replica = start_node(REPLICA, &[PRIMARY], settings(), store_with(&history).await, &transport).await;

    let receipt = primary.commit(Bytes::from_static(b"create (n:Person)")).await.unwrap();
    assert_eq!(receipt.tx_id, 42);

    let push = receipt.push.unwrap();
    assert!(push.is_satisfied());
    assert!(!push.timed_out);
    assert!(push.elapsed < settings().push_timeout);
    assert_eq!(replica.last_committed_tx_id(), 42);
    assert_eq!(primary.registry().get(REPLICA).unwrap().known_applied(), 42);
}

#[tokio::test]
async fn test_commit_without_live_replicas_then_rejoin() {
    let transport = LocalTransport::new();
    let primary = start_node(PRIMARY, &[REPLICA], settings(), Arc::new(MemoryTxStore::new()), &transport).await;
    primary.membership().mark_unavailable(REPLICA).await.unwrap();

    let replica_membership = Arc::new(ClusterMembership::new(endpoint(REPLICA)));
    replica_membership.join(endpoint(PRIMARY)).await;
    replica_membership.set_primary(PRIMARY).await.unwrap();
    replica_membership.mark_unavailable(PRIMARY).await.unwrap();
    let replica = ReplicationNode::new(
        endpoint(REPLICA),
        settings(),
        Arc::new(MemoryTxStore::new()),
        Arc::clone(&replica_membership),
        transport.clone(),
    )
    .await
    .unwrap();
    transport.register(REPLICA, replica.as_handler());
    let events = replica.start();
    assert_eq!(replica.role(), Role::Unavailable);

    for i in 0..3u8 {
        let receipt = primary.commit(vec![i]).await.unwrap();
        let push = receipt.push.unwrap();
        assert_eq!(push.acked, 0);
        assert!(!push.is_satisfied());
    }
    assert_eq!(primary.last_committed_tx_id(), 3);
    assert_eq!(replica.last_committed_tx_id(), 0);

    // Rejoin: the replica sees its primary again and catches up by pulling
    primary.membership().mark_available(REPLICA).await.unwrap();
    replica_membership.mark_available(PRIMARY).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || replica.last_committed_tx_id() == 3).await);
    assert_eq!(replica.role(), Role::Replica);

    let receipt = primary.commit(Bytes::from_static(b"after rejoin")).await.unwrap();
    assert!(receipt.push.unwrap().is_satisfied());
    assert_eq!(replica.last_committed_tx_id(), 4);

    replica.shutdown();
    events.await.unwrap();
}

#[tokio::test]
async fn test_push_during_pull_waits_on_one_successor() {
    let transport = LocalTransport::new();
    let ha = HaSettings {
        pull_max_records: 100,
        ..settings()
    };
    let history = records(300);
    let _primary = start_node(PRIMARY, &[REPLICA], ha.clone(), store_with(&history).await, &transport).await;

    transport.set_latency(Duration::from_millis(100));
    let replica = start_node(REPLICA, &[PRIMARY], ha, store_with(&history[..100]).await, &transport).await;
    let first = replica.coalescer().ensure_up_to_date(&endpoint(PRIMARY));

    // First chunk of the running pull has landed
    assert!(wait_until(Duration::from_secs(2), || replica.last_committed_tx_id() > 100).await);
    assert!(replica.last_committed_tx_id() < 250);

    // Delivered straight to the replica, bypassing transport latency
    let pushed = replica
        .handle(Request::PushNotify {
            primary: PRIMARY.into(),
            tx_id: 250,
        })
        .await;
    match pushed {
        Response::Ack { applied } => assert!(applied >= 250),
        other => panic!("unexpected {}", other.type_name()),
    }

    let range = first.wait().await.unwrap();
    assert_eq!(range.last_applied, 300);
    assert_eq!(replica.last_committed_tx_id(), 300);
    assert_eq!(replica.coalescer().pulls_dispatched(PRIMARY), 2);
}

/// Wraps the primary and damages one record on its way out
struct CorruptingHandler {
    inner: Arc<ReplicationNode>,
    tx_id: u64,
}

#[async_trait::async_trait]
impl RequestHandler for CorruptingHandler {
    async fn handle(&self, request: Request) -> Response {
        match self.inner.handle(request).await {
            Response::TxStream {
                mut records,
                primary_tail,
            } => {
                for record in records.iter_mut().filter(|r| r.tx_id == self.tx_id) {
                    record.payload = Bytes::from_static(b"garbage");
                }
                Response::TxStream {
                    records,
                    primary_tail,
                }
            }
            other => other,
        }
    }
}

#[tokio::test]
async fn test_apply_failure_is_not_retried() {
    let transport = LocalTransport::new();
    let primary = start_node(PRIMARY, &[REPLICA], settings(), store_with(&records(10)).await, &transport).await;
    let corrupting: Arc<dyn RequestHandler> = Arc::new(CorruptingHandler {
        inner: primary,
        tx_id: 6,
    });
    transport.register(PRIMARY, Arc::downgrade(&corrupting));

    let replica = start_node(REPLICA, &[PRIMARY], settings(), Arc::new(MemoryTxStore::new()), &transport).await;
    let result = replica.coalescer().ensure_up_to_date(&endpoint(PRIMARY)).wait().await;

    assert!(matches!(result, Err(Error::ReplicationApplyFailed { tx_id: 6, .. })));
    assert_eq!(replica.last_committed_tx_id(), 5);
    assert_eq!(transport.stats(PRIMARY).pulls(), 1);
}

#[tokio::test]
async fn test_repeated_push_causes_no_pull() {
    let transport = LocalTransport::new();
    let primary = start_node(PRIMARY, &[REPLICA], settings(), Arc::new(MemoryTxStore::new()), &transport).await;
    let _replica = start_node(REPLICA, &[PRIMARY], settings(), Arc::new(MemoryTxStore::new()), &transport).await;

    let receipt = primary.commit(Bytes::from_static(b"x")).await.unwrap();
    assert!(receipt.push.unwrap().is_satisfied());
    let pulls = transport.stats(PRIMARY).pulls();

    for _ in 0..3 {
        let response = transport
            .call(
                &endpoint(REPLICA),
                Request::PushNotify {
                    primary: PRIMARY.into(),
                    tx_id: receipt.tx_id,
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Ack { applied: 1 }));
    }
    assert_eq!(transport.stats(PRIMARY).pulls(), pulls);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replica_commits() {
    let transport = LocalTransport::new();
    let primary = start_node(PRIMARY, &[REPLICA], settings(), Arc::new(MemoryTxStore::new()), &transport).await;
    let replica = start_node(REPLICA, &[PRIMARY], settings(), Arc::new(MemoryTxStore::new()), &transport).await;

    let commits: Vec<_> = (0..10u8)
        .map(|i| {
            let replica = Arc::clone(&replica);
            tokio::spawn(async move { replica.commit(vec![i]).await })
        })
        .collect();

    let mut ids = Vec::new();
    for commit in commits {
        let receipt = commit.await.unwrap().unwrap();
        assert!(receipt.push.is_none());
        // Visible locally before the commit returns
        assert!(replica.last_committed_tx_id() >= receipt.tx_id);
        ids.push(receipt.tx_id);
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    assert_eq!(transport.stats(PRIMARY).forwards(), 10);
    assert_eq!(all_records(&replica).await, all_records(&primary).await);
}

#[tokio::test]
async fn test_transaction_context_commits_statements() {
    let transport = LocalTransport::new();
    let primary = start_node(PRIMARY, &[], settings(), Arc::new(MemoryTxStore::new()), &transport).await;

    let mut tx = primary.begin();
    {
        let mut statement = tx.new_statement().unwrap();
        statement.write(Bytes::from_static(b"create (a)"));
        statement.write(Bytes::from_static(b"create (b)"));
    }
    tx.prepare().unwrap();
    let receipt = tx.commit().await.unwrap().unwrap();
    assert_eq!(receipt.tx_id, 1);
    assert!(matches!(tx.commit().await, Err(Error::TransactionClosed)));

    let stored = all_records(&primary).await;
    let payload = TxPayload::decode(&stored[0].payload).unwrap();
    assert_eq!(payload.statements.len(), 2);

    let mut empty = primary.begin();
    assert!(empty.commit().await.unwrap().is_none());
    assert_eq!(primary.last_committed_tx_id(), 1);
}
