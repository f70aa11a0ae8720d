//! End-to-end integration tests for the skycast broadcast queue.
//!
//! These drive the public API the way the node does: orders are created and
//! paid through a gateway, the scheduler daemon puts them on the air, and
//! regions confirm them. Each test stands alone with its own temporary
//! database, payload directory and scheduler lock.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use skycast_protocol::auth::TokenAuthority;
use skycast_protocol::config::{BidPolicy, Framing, QueueConfig, SchedulerConfig};
use skycast_protocol::confirmation::ConfirmationKind;
use skycast_protocol::gateway::mock::MockGateway;
use skycast_protocol::notify::{BroadcastSink, Notification};
use skycast_protocol::order::{Order, OrderStatus};
use skycast_protocol::payload::{FsPayloadStore, PayloadStore};
use skycast_protocol::storage::QueueDb;
use skycast_protocol::{BroadcastQueue, OrderReceipt, QueueError, Scheduler, SchedulerLock};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Node {
    queue: Arc<BroadcastQueue>,
    gateway: MockGateway,
    sink: BroadcastSink,
    payloads: Arc<FsPayloadStore>,
    dir: tempfile::TempDir,
}

fn node_with(config: QueueConfig) -> Node {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = QueueDb::open(dir.path().join("db")).expect("db");
    let payloads = Arc::new(FsPayloadStore::open(dir.path().join("messages")).expect("payloads"));
    let sink = BroadcastSink::new(128);
    let queue = BroadcastQueue::open(
        db,
        payloads.clone(),
        Arc::new(sink.clone()),
        TokenAuthority::new(b"e2e-secret"),
        config,
    )
    .expect("queue");
    Node {
        queue: Arc::new(queue),
        gateway: MockGateway::new(),
        sink,
        payloads,
        dir,
    }
}

fn node() -> Node {
    node_with(QueueConfig::default())
}

impl Node {
    async fn order(&self, message: &[u8], bid: u64) -> OrderReceipt {
        self.queue
            .create_order(&self.gateway, message, bid)
            .await
            .expect("create order")
    }

    fn pay(&self, receipt: &OrderReceipt) {
        let token = self.gateway.token_for(&receipt.invoice.lid).expect("webhook");
        self.queue
            .pay_invoice(&receipt.invoice.lid, &token)
            .expect("pay");
    }

    fn status(&self, receipt: &OrderReceipt) -> OrderStatus {
        self.queue.order(&receipt.uuid).expect("order").status
    }

    fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    fn start_scheduler(&self) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let scheduler = Scheduler::new(
            self.queue.clone(),
            SchedulerConfig::default(),
            self.data_dir(),
        )
        .expect("scheduler");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler.run(rx).await.expect("scheduler run");
        });
        (tx, handle)
    }

    async fn wait_until(&self, receipt: &OrderReceipt, status: OrderStatus) -> Order {
        for _ in 0..10_000 {
            let order = self.queue.order(&receipt.uuid).expect("order");
            if order.status == status {
                return order;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("order {} never reached {status}", receipt.uuid);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn full_lifecycle_through_the_daemon() {
    let node = node();
    let mut events = node.sink.subscribe();
    let message = b"hello from orbit".repeat(10);

    let receipt = node.order(&message, 5_000).await;
    assert_eq!(node.status(&receipt), OrderStatus::Pending);
    node.pay(&receipt);
    assert_eq!(node.status(&receipt), OrderStatus::Paid);

    let (stop, handle) = node.start_scheduler();
    let sent = node.wait_until(&receipt, OrderStatus::Sent).await;
    assert_eq!(sent.tx_seq_num, Some(1));
    assert!(sent.started_transmission_at <= sent.ended_transmission_at);

    let started = events.recv().await.expect("start event");
    assert!(matches!(started.event, Notification::TransmissionStarted { tx_seq_num: 1, .. }));
    let ended = events.recv().await.expect("end event");
    assert!(matches!(ended.event, Notification::TransmissionEnded { tx_seq_num: 1, .. }));

    assert_eq!(node.queue.message_by_seq(1).expect("message"), message);

    node.queue.confirm_tx(1, &[0, 1, 2, 3, 4, 5]).expect("tx");
    for region in [0, 1, 4, 5] {
        node.queue.confirm_rx(1, region).expect("rx");
    }
    assert_eq!(node.status(&receipt), OrderStatus::Received);

    stop.send(true).expect("stop");
    handle.await.expect("join");
}

#[tokio::test]
async fn guard_needs_every_overhead_byte() {
    let node = node_with(QueueConfig {
        framing: Framing {
            max_payload: 1000,
            overhead_per_fragment: 16,
        },
        bids: BidPolicy {
            min_per_byte_bid: 1,
            min_bid: 0,
        },
        ..QueueConfig::default()
    });

    let receipt = node.order(&[0u8; 1000], 1016).await;
    let short = node
        .queue
        .bump_order(&node.gateway, &receipt.uuid, &receipt.auth_token, 1015)
        .await
        .expect("bump");
    node.pay(&short);
    let order = node.queue.order(&receipt.uuid).expect("order");
    assert_eq!(order.bid, 1015);
    assert_eq!(order.status, OrderStatus::Pending);

    node.pay(&receipt);
    let order = node.queue.order(&receipt.uuid).expect("order");
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.bid, 2031);
}

#[tokio::test]
async fn invoices_roll_up_into_bid() {
    let node = node_with(QueueConfig {
        bids: BidPolicy {
            min_per_byte_bid: 1,
            min_bid: 0,
        },
        ..QueueConfig::default()
    });
    let first = node.order(&[1u8; 10], 100).await;
    let second = node
        .queue
        .bump_order(&node.gateway, &first.uuid, &first.auth_token, 200)
        .await
        .expect("bump");

    node.pay(&second);
    let order = node.queue.order(&first.uuid).expect("order");
    assert_eq!((order.bid, order.unpaid_bid), (200, 100));

    node.pay(&first);
    let order = node.queue.order(&first.uuid).expect("order");
    assert_eq!((order.bid, order.unpaid_bid), (300, 0));
}

#[tokio::test(start_paused = true)]
async fn restart_ends_interrupted_transmission() {
    let node = node();
    let receipt = node.order(&[9u8; 2000], 10_000).await;
    node.pay(&receipt);
    {
        let crashed = SchedulerLock::acquire(node.data_dir()).expect("lock");
        node.queue
            .begin_transmission(&crashed, &receipt.uuid)
            .expect("transmit");
    }
    let stuck = node.queue.order(&receipt.uuid).expect("order");
    assert_eq!(stuck.status, OrderStatus::Transmitting);

    let (stop, handle) = node.start_scheduler();
    let recovered = node.wait_until(&receipt, OrderStatus::Sent).await;
    assert!(recovered.ended_transmission_at.is_some());
    assert_eq!(recovered.tx_seq_num, stuck.tx_seq_num);
    assert_eq!(recovered.started_transmission_at, stuck.started_transmission_at);

    stop.send(true).expect("stop");
    handle.await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn three_of_four_receivers_is_not_enough() {
    let node = node();
    let receipt = node.order(&[3u8; 100], 5_000).await;
    node.pay(&receipt);
    let (stop, handle) = node.start_scheduler();
    node.wait_until(&receipt, OrderStatus::Sent).await;

    node.queue.confirm_tx(1, &[0, 1, 2, 3, 4, 5]).expect("tx");
    for region in [0, 1, 4] {
        node.queue.confirm_rx(1, region).expect("rx");
    }
    assert_eq!(node.status(&receipt), OrderStatus::Sent);

    node.queue.confirm_rx(1, 5).expect("rx");
    assert_eq!(node.status(&receipt), OrderStatus::Received);

    let rx = node
        .queue
        .confirmations(ConfirmationKind::Rx, &receipt.uuid)
        .expect("confirmations");
    let presumed: BTreeSet<u8> = rx.iter().filter(|c| c.presumed).map(|c| c.region).collect();
    assert_eq!(presumed, BTreeSet::from([2, 3]));
    assert_eq!(rx.len(), 6);

    stop.send(true).expect("stop");
    handle.await.expect("join");
}

#[tokio::test]
async fn double_cancel_deletes_payload_once() {
    let node = node();
    let receipt = node.order(&[5u8; 64], 2_000).await;
    assert!(node.payloads.read(&receipt.uuid).expect("read").is_some());

    node.queue
        .cancel_order(&receipt.uuid, &receipt.auth_token)
        .expect("cancel");
    assert!(node.payloads.read(&receipt.uuid).expect("read").is_none());

    let again = node.queue.cancel_order(&receipt.uuid, &receipt.auth_token);
    assert!(matches!(again, Err(QueueError::InvalidTransition(_))));
    assert_eq!(node.status(&receipt), OrderStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn sequence_numbers_strictly_increase() {
    let node = node();
    let mut receipts = Vec::new();
    for i in 0..5u64 {
        let receipt = node.order(&[i as u8; 100], 2_000 + i * 100).await;
        node.pay(&receipt);
        receipts.push(receipt);
    }

    let (stop, handle) = node.start_scheduler();
    for receipt in &receipts {
        node.wait_until(receipt, OrderStatus::Sent).await;
    }
    stop.send(true).expect("stop");
    handle.await.expect("join");

    // Highest bid goes first.
    let seqs: Vec<u64> = receipts
        .iter()
        .rev()
        .map(|r| node.queue.order(&r.uuid).expect("order").tx_seq_num.expect("seq"))
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn second_daemon_is_refused() {
    let node = node();
    let _first = Scheduler::new(node.queue.clone(), SchedulerConfig::default(), node.data_dir())
        .expect("first scheduler");
    let second = Scheduler::new(node.queue.clone(), SchedulerConfig::default(), node.data_dir());
    assert!(matches!(second, Err(QueueError::SchedulerLocked { .. })));
}

#[tokio::test]
async fn reclaim_expires_unpaid_work() {
    let node = node();
    let receipt = node.order(&[1u8; 10], 1_000).await;

    let report = node
        .queue
        .reclaim(chrono::Utc::now() + chrono::Duration::hours(2))
        .expect("reclaim");
    assert_eq!(report.expired_invoices, 1);
    assert_eq!(report.expired_orders, 1);
    assert_eq!(node.status(&receipt), OrderStatus::Expired);
    assert!(node.payloads.read(&receipt.uuid).expect("read").is_none());
}
