//! # Broadcast Queue
//!
//! The service every caller goes through: order creation and bumps,
//! payment callbacks, region confirmations, listings, and the narrow
//! interface the scheduler drives orders through.
//!
//! ## Atomicity
//!
//! Every read-modify-write of an order (and of the invoices it owns) runs
//! under that order's mutex, taken from a lock table keyed by uuid. There
//! is no lock across orders, so a payment for one order never waits on a
//! confirmation for another. The mutex is never held across an `.await`:
//! gateway calls happen first, the locked section afterwards.
//!
//! ## Effects
//!
//! State changes come back from [`crate::order::transition`] and
//! [`crate::invoice::transition`] as data. The queue persists the new state
//! first and then runs the after-enter effects (publishing, payload
//! deletion, presumed confirmations). A failing effect is logged and never
//! undoes the transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TokenAuthority;
use crate::bidding;
use crate::config::{QueueConfig, INVOICE_DESCRIPTION, MAX_PAGE_SIZE, PAGE_SIZE};
use crate::confirmation::{presumed_rx_needed, Confirmation, ConfirmationKind};
use crate::error::{QueueError, QueueResult};
use crate::gateway::{self, InvoiceMetadata, InvoiceRequest, PaymentGateway};
use crate::invoice::{Invoice, InvoiceEffect, InvoiceEvent, InvoiceStatus};
use crate::notify::{Notification, NotificationSink, TRANSMISSIONS_CHANNEL};
use crate::order::{self, Order, OrderEffect, OrderEvent, OrderStatus, OrderTransition};
use crate::payload::PayloadStore;
use crate::region::{QuorumPolicy, RegionRegistry};
use crate::scheduler::SchedulerLock;
use crate::storage::QueueDb;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Handed back on creation and bump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub uuid: Uuid,
    /// Token required to bump, cancel or look up the order.
    pub auth_token: String,
    /// The invoice to pay.
    pub invoice: Invoice,
}

/// What one reclamation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub expired_invoices: usize,
    pub expired_orders: usize,
    pub removed_payloads: usize,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Clamp a requested listing size.
pub fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Longest lifetime handed out to an invoice.
const MAX_EXPIRY_DAYS: i64 = 36_500;

/// `now + d`, capped at [`MAX_EXPIRY_DAYS`].
fn deadline(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let cap = chrono::Duration::days(MAX_EXPIRY_DAYS);
    let d = chrono::Duration::from_std(d).map_or(cap, |d| d.min(cap));
    now.checked_add_signed(d).unwrap_or(now)
}

/// `now - d`, or `None` when that predates representable time and so
/// nothing can be older.
fn cutoff(now: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

fn by_bid_per_byte_desc(a: &Order, b: &Order) -> std::cmp::Ordering {
    b.bid_per_byte()
        .total_cmp(&a.bid_per_byte())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.uuid.cmp(&b.uuid))
}

// ---------------------------------------------------------------------------
// BroadcastQueue
// ---------------------------------------------------------------------------

pub struct BroadcastQueue {
    db: QueueDb,
    payloads: Arc<dyn PayloadStore>,
    sink: Arc<dyn NotificationSink>,
    auth: TokenAuthority,
    regions: RegionRegistry,
    quorum: QuorumPolicy,
    config: QueueConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for BroadcastQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastQueue")
            .field("regions", &self.regions.len())
            .field("quorum", &self.quorum)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BroadcastQueue {
    /// Build the queue, seeding the region catalog on first use.
    ///
    /// The quorum is derived from the stored catalog: every region must
    /// confirm tx, every region with a receiver must confirm rx.
    pub fn open(
        db: QueueDb,
        payloads: Arc<dyn PayloadStore>,
        sink: Arc<dyn NotificationSink>,
        auth: TokenAuthority,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        let seeded = db.seed_regions(&crate::region::catalog())?;
        if seeded > 0 {
            info!(seeded, "seeded region catalog");
        }
        let regions = RegionRegistry::new(db.load_regions()?);
        let quorum = QuorumPolicy::from_registry(&regions);

        Ok(Self {
            db,
            payloads,
            sink,
            auth,
            regions,
            quorum,
            config,
            locks: DashMap::new(),
        })
    }

    /// Replace the derived quorum.
    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    pub fn quorum(&self) -> &QuorumPolicy {
        &self.quorum
    }

    pub fn db(&self) -> &QueueDb {
        &self.db
    }

    fn order_lock(&self, uuid: &Uuid) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(*uuid).or_default())
    }

    fn load_order(&self, uuid: &Uuid) -> QueueResult<Order> {
        self.db
            .get_order(uuid)?
            .ok_or(QueueError::OrderNotFound(*uuid))
    }

    fn check_order_token(&self, uuid: &Uuid, token: &str) -> QueueResult<()> {
        if !self.auth.verify_order_token(uuid, token) {
            return Err(QueueError::Unauthorized);
        }
        Ok(())
    }

    // -- Order intake -------------------------------------------------------

    /// Admit a new message with its first bid.
    ///
    /// The payload is stored before the invoice is requested and removed
    /// again if the gateway fails.
    pub async fn create_order(
        &self,
        gateway: &dyn PaymentGateway,
        message: &[u8],
        bid: u64,
    ) -> QueueResult<OrderReceipt> {
        let size = message.len() as u64;
        if size < self.config.min_message_size {
            return Err(QueueError::MessageTooSmall {
                min: self.config.min_message_size,
            });
        }
        if size > self.config.max_message_size {
            return Err(QueueError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        bidding::validate_bid(bid, size, &self.config.framing, &self.config.bids)?;

        let digest = hex::encode(Sha256::digest(message));
        let size_with_overhead = bidding::message_size_with_overhead(size, &self.config.framing);
        let mut order = Order::new(size, digest, size_with_overhead, Utc::now());

        self.payloads.write(&order.uuid, message)?;
        let invoice = match self.issue_invoice(gateway, &order, bid).await {
            Ok(invoice) => invoice,
            Err(e) => {
                if let Err(io) = self.payloads.delete(&order.uuid) {
                    warn!(uuid = %order.uuid, error = %io, "failed to remove payload of rejected order");
                }
                return Err(e);
            }
        };

        order.adjust_bids([&invoice]);
        self.db.put_order_with_invoice(&order, &invoice)?;

        info!(uuid = %order.uuid, size, bid, lid = %invoice.lid, "order created");
        Ok(OrderReceipt {
            uuid: order.uuid,
            auth_token: self.auth.order_token(&order.uuid),
            invoice,
        })
    }

    /// Add `increase` to an order's bid through a new invoice.
    pub async fn bump_order(
        &self,
        gateway: &dyn PaymentGateway,
        uuid: &Uuid,
        token: &str,
        increase: u64,
    ) -> QueueResult<OrderReceipt> {
        bidding::validate_bump(increase)?;
        let order = self.load_order(uuid)?;
        self.check_order_token(uuid, token)?;
        order::transition(order.status, OrderEvent::Bump)?;

        let invoice = self.issue_invoice(gateway, &order, increase).await?;

        let lock = self.order_lock(uuid);
        let _guard = lock.lock();
        let mut order = self.load_order(uuid)?;
        order.apply(OrderEvent::Bump, Utc::now())?;
        self.db.put_invoice(&invoice)?;
        order.adjust_bids(&self.db.invoices_for_order(uuid)?);
        self.db.put_order(&order)?;

        info!(uuid = %uuid, increase, unpaid_bid = order.unpaid_bid, "order bumped");
        Ok(OrderReceipt {
            uuid: *uuid,
            auth_token: token.to_string(),
            invoice,
        })
    }

    async fn issue_invoice(
        &self,
        gateway: &dyn PaymentGateway,
        order: &Order,
        amount: u64,
    ) -> QueueResult<Invoice> {
        let request = InvoiceRequest {
            amount,
            description: INVOICE_DESCRIPTION.to_string(),
            expiry: self.config.invoice_expiry,
            metadata: InvoiceMetadata {
                uuid: order.uuid,
                sha256_message_digest: order.message_digest.clone(),
            },
        };
        let issued = gateway
            .create_invoice(&request)
            .await
            .map_err(|e| QueueError::Gateway(e.to_string()))?;

        let token = self.auth.invoice_token(&issued.lid);
        let url = gateway::callback_url(&self.config.callback_root, &issued.lid, &token);
        gateway
            .register_webhook(&issued.lid, &url)
            .await
            .map_err(|e| QueueError::WebhookRegistration(e.to_string()))?;

        let now = Utc::now();
        Ok(Invoice {
            id: self.db.new_invoice_id()?,
            order_uuid: order.uuid,
            amount,
            status: InvoiceStatus::Pending,
            lid: issued.lid,
            payload: issued.payload,
            created_at: now,
            expires_at: deadline(now, self.config.invoice_expiry),
            paid_at: None,
        })
    }

    /// Cancel a `pending` or `paid` order and delete its payload.
    pub fn cancel_order(&self, uuid: &Uuid, token: &str) -> QueueResult<Order> {
        let lock = self.order_lock(uuid);
        let _guard = lock.lock();

        let mut order = self.load_order(uuid)?;
        self.check_order_token(uuid, token)?;
        let t = order.apply(OrderEvent::Cancel, Utc::now())?;
        self.db.put_order(&order)?;
        self.run_order_effects(&order, &t)?;

        info!(uuid = %uuid, from = %t.from, "order cancelled");
        Ok(order)
    }

    // -- Lookups ------------------------------------------------------------

    pub fn order(&self, uuid: &Uuid) -> QueueResult<Order> {
        self.load_order(uuid)
    }

    /// Lookup that requires the order's token.
    pub fn order_authenticated(&self, uuid: &Uuid, token: &str) -> QueueResult<Order> {
        let order = self.load_order(uuid)?;
        self.check_order_token(uuid, token)?;
        Ok(order)
    }

    pub fn invoices(&self, uuid: &Uuid) -> QueueResult<Vec<Invoice>> {
        self.load_order(uuid)?;
        Ok(self.db.invoices_for_order(uuid)?)
    }

    pub fn confirmations(&self, kind: ConfirmationKind, uuid: &Uuid) -> QueueResult<Vec<Confirmation>> {
        Ok(self.db.confirmations(kind, uuid)?)
    }

    /// An order that is, or has been, on the air.
    pub fn order_by_seq(&self, tx_seq_num: u64) -> QueueResult<Order> {
        match self.db.order_by_seq(tx_seq_num)? {
            Some(order) if order.status.is_on_air() => Ok(order),
            _ => Err(QueueError::SequenceNumberNotFound(tx_seq_num)),
        }
    }

    /// The payload of an on-air order, while it is retained.
    pub fn message_by_seq(&self, tx_seq_num: u64) -> QueueResult<Vec<u8>> {
        let order = self.order_by_seq(tx_seq_num)?;
        self.payloads
            .read(&order.uuid)?
            .ok_or(QueueError::SequenceNumberNotFound(tx_seq_num))
    }

    // -- Listings -----------------------------------------------------------

    /// `paid` and `transmitting` orders, highest bid per byte first.
    pub fn queued_orders(&self, limit: Option<usize>) -> QueueResult<Vec<Order>> {
        let mut orders = self.db.orders_with_status(OrderStatus::Paid)?;
        orders.extend(self.db.orders_with_status(OrderStatus::Transmitting)?);
        orders.sort_by(by_bid_per_byte_desc);
        orders.truncate(page_limit(limit));
        Ok(orders)
    }

    /// `sent` and `received` orders created before `before`, most recently
    /// transmitted first.
    pub fn sent_orders(&self, before: DateTime<Utc>, limit: Option<usize>) -> QueueResult<Vec<Order>> {
        let mut orders = self.db.orders_with_status(OrderStatus::Sent)?;
        orders.extend(self.db.orders_with_status(OrderStatus::Received)?);
        orders.retain(|o| o.created_at < before);
        orders.sort_by(|a, b| b.ended_transmission_at.cmp(&a.ended_transmission_at));
        orders.truncate(page_limit(limit));
        Ok(orders)
    }

    /// `pending` orders created before `before`, newest first.
    pub fn pending_orders(&self, before: DateTime<Utc>, limit: Option<usize>) -> QueueResult<Vec<Order>> {
        let mut orders = self.db.orders_with_status(OrderStatus::Pending)?;
        orders.retain(|o| o.created_at < before);
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(page_limit(limit));
        Ok(orders)
    }

    /// Number of orders per status.
    pub fn status_counts(&self) -> BTreeMap<OrderStatus, usize> {
        OrderStatus::ALL
            .iter()
            .map(|s| (*s, self.db.count_with_status(*s)))
            .collect()
    }

    pub fn last_tx_seq_num(&self) -> QueueResult<Option<u64>> {
        Ok(self.db.last_tx_seq_num()?)
    }

    // -- Payments -----------------------------------------------------------

    /// Handle the gateway's callback for invoice `lid`.
    pub fn pay_invoice(&self, lid: &str, token: &str) -> QueueResult<Invoice> {
        let invoice = self
            .db
            .invoice_by_lid(lid)?
            .ok_or_else(|| QueueError::InvoiceNotFound(lid.to_string()))?;
        if !self.auth.verify_invoice_token(lid, token) {
            return Err(QueueError::Unauthorized);
        }

        let lock = self.order_lock(&invoice.order_uuid);
        let _guard = lock.lock();

        let mut invoice = self
            .db
            .get_invoice(invoice.id)?
            .ok_or_else(|| QueueError::InvoiceNotFound(lid.to_string()))?;
        match invoice.status {
            InvoiceStatus::Paid => return Err(QueueError::InvoiceAlreadyPaid),
            InvoiceStatus::Expired => return Err(QueueError::InvoiceAlreadyExpired),
            InvoiceStatus::Pending => {}
        }
        let order = self
            .db
            .get_order(&invoice.order_uuid)?
            .ok_or_else(|| QueueError::OrphanedInvoice(lid.to_string()))?;

        let t = invoice.apply(InvoiceEvent::Pay, Utc::now())?;
        self.db.put_invoice(&invoice)?;
        info!(lid = %lid, uuid = %order.uuid, amount = invoice.amount, "invoice paid");

        if t.after.contains(&InvoiceEffect::MaybeMarkOrderPaid) {
            self.maybe_mark_paid(order)?;
        }
        Ok(invoice)
    }

    /// Recompute bids and give the order a chance to become `paid`.
    /// Caller holds the order lock.
    fn maybe_mark_paid(&self, mut order: Order) -> QueueResult<Order> {
        order.adjust_bids(&self.db.invoices_for_order(&order.uuid)?);
        if matches!(order.status, OrderStatus::Pending | OrderStatus::Paid) {
            let paid_enough =
                bidding::paid_enough(order.bid, order.size_with_overhead, &self.config.bids);
            let t = order.apply(OrderEvent::Pay { paid_enough }, Utc::now())?;
            if t.changed() {
                info!(uuid = %order.uuid, bid = order.bid, bid_per_byte = order.bid_per_byte(), "order paid");
            }
        }
        self.db.put_order(&order)?;
        Ok(order)
    }

    /// Caller holds the order lock. Returns whether the order expired.
    fn expire_invoice(&self, mut invoice: Invoice, now: DateTime<Utc>) -> QueueResult<bool> {
        let t = invoice.apply(InvoiceEvent::Expire, now)?;
        self.db.put_invoice(&invoice)?;
        debug!(lid = %invoice.lid, uuid = %invoice.order_uuid, "invoice expired");

        if !t.after.contains(&InvoiceEffect::ExpireOrderIfNoPendingInvoices) {
            return Ok(false);
        }
        let Some(order) = self.db.get_order(&invoice.order_uuid)? else {
            return Ok(false);
        };
        self.expire_if_pending_and_no_pending_invoices(order, now)
    }

    fn expire_if_pending_and_no_pending_invoices(
        &self,
        mut order: Order,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let invoices = self.db.invoices_for_order(&order.uuid)?;
        order.adjust_bids(&invoices);
        let expire = order.status == OrderStatus::Pending && !invoices.iter().any(Invoice::is_pending);
        let t = if expire {
            Some(order.apply(OrderEvent::Expire, now)?)
        } else {
            None
        };
        self.db.put_order(&order)?;
        if let Some(t) = t {
            self.run_order_effects(&order, &t)?;
            info!(uuid = %order.uuid, "order expired with its last invoice");
        }
        Ok(expire)
    }

    // -- Confirmations ------------------------------------------------------

    /// Regions reporting they transmitted order `tx_seq_num`. Every region
    /// is validated before any is recorded.
    pub fn confirm_tx(&self, tx_seq_num: u64, regions: &[u8]) -> QueueResult<Order> {
        let regions = self.regions.resolve(regions)?;
        let order = self.order_by_seq(tx_seq_num)?;

        let lock = self.order_lock(&order.uuid);
        let _guard = lock.lock();
        let now = Utc::now();
        for region in regions {
            if self
                .db
                .add_confirmation(ConfirmationKind::Tx, &Confirmation::reported(order.uuid, region, now))?
            {
                debug!(tx_seq_num, region, "tx confirmation");
            }
        }
        self.maybe_receive(&order.uuid)
    }

    /// A region reporting it received order `tx_seq_num`.
    pub fn confirm_rx(&self, tx_seq_num: u64, region: u8) -> QueueResult<Order> {
        let region = self.regions.get(region)?.number;
        let order = self.order_by_seq(tx_seq_num)?;

        let lock = self.order_lock(&order.uuid);
        let _guard = lock.lock();
        if self.db.add_confirmation(
            ConfirmationKind::Rx,
            &Confirmation::reported(order.uuid, region, Utc::now()),
        )? {
            debug!(tx_seq_num, region, "rx confirmation");
        }
        self.maybe_receive(&order.uuid)
    }

    /// Move a `sent` order to `received` once the quorum is met. Caller
    /// holds the order lock.
    fn maybe_receive(&self, uuid: &Uuid) -> QueueResult<Order> {
        let mut order = self.load_order(uuid)?;
        if order.status != OrderStatus::Sent {
            return Ok(order);
        }
        let tx = self.db.confirmed_regions(ConfirmationKind::Tx, uuid)?;
        let rx = self.db.confirmed_regions(ConfirmationKind::Rx, uuid)?;
        if !self.quorum.is_met(&tx, &rx) {
            return Ok(order);
        }

        let t = order.apply(OrderEvent::Receive, Utc::now())?;
        self.db.put_order(&order)?;
        self.run_order_effects(&order, &t)?;
        info!(uuid = %uuid, tx_seq_num = order.tx_seq_num, "order received");
        Ok(order)
    }

    // -- After-enter effects ------------------------------------------------

    fn run_order_effects(&self, order: &Order, t: &OrderTransition) -> QueueResult<()> {
        for effect in &t.after {
            match effect {
                OrderEffect::PublishTransmissionStarted => self
                    .sink
                    .publish(TRANSMISSIONS_CHANNEL, &Notification::started(order)),
                OrderEffect::PublishTransmissionEnded => self
                    .sink
                    .publish(TRANSMISSIONS_CHANNEL, &Notification::ended(order)),
                OrderEffect::DeletePayload => {
                    if let Err(e) = self.payloads.delete(&order.uuid) {
                        warn!(uuid = %order.uuid, error = %e, "failed to delete payload");
                    }
                }
                OrderEffect::SynthesizePresumedRx => {
                    let rx = self.db.confirmed_regions(ConfirmationKind::Rx, &order.uuid)?;
                    let now = Utc::now();
                    for region in presumed_rx_needed(&self.regions.receiverless(), &rx) {
                        self.db.add_confirmation(
                            ConfirmationKind::Rx,
                            &Confirmation::presumed(order.uuid, region, now),
                        )?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -- Scheduler interface ------------------------------------------------

    /// Force every `transmitting` order through `end_transmission`. Run
    /// once at startup: a transmission interrupted by a crash is treated as
    /// finished, never restarted.
    pub fn recover_stuck(&self, _lock: &SchedulerLock) -> QueueResult<Vec<Order>> {
        let mut recovered = Vec::new();
        for stuck in self.db.orders_with_status(OrderStatus::Transmitting)? {
            warn!(uuid = %stuck.uuid, tx_seq_num = stuck.tx_seq_num, "ending interrupted transmission");
            recovered.push(self.finish(&stuck.uuid)?);
        }
        Ok(recovered)
    }

    /// The `paid` order with the highest bid per byte.
    pub fn next_sendable(&self) -> QueueResult<Option<Order>> {
        Ok(self
            .db
            .orders_with_status(OrderStatus::Paid)?
            .into_iter()
            .min_by(by_bid_per_byte_desc))
    }

    /// Put an order on the air, assigning the next sequence number.
    pub fn begin_transmission(&self, _lock: &SchedulerLock, uuid: &Uuid) -> QueueResult<Order> {
        let lock = self.order_lock(uuid);
        let _guard = lock.lock();

        let mut order = self.load_order(uuid)?;
        let tx_seq_num = self.db.next_tx_seq_num()?;
        let t = order.apply(OrderEvent::Transmit { tx_seq_num }, Utc::now())?;
        self.db.put_order(&order)?;
        self.run_order_effects(&order, &t)?;
        Ok(order)
    }

    pub fn end_transmission(&self, _lock: &SchedulerLock, uuid: &Uuid) -> QueueResult<Order> {
        self.finish(uuid)
    }

    fn finish(&self, uuid: &Uuid) -> QueueResult<Order> {
        let lock = self.order_lock(uuid);
        let _guard = lock.lock();

        let mut order = self.load_order(uuid)?;
        let t = order.apply(OrderEvent::EndTransmission, Utc::now())?;
        self.db.put_order(&order)?;
        self.run_order_effects(&order, &t)?;
        // Confirmations may have arrived while the message was on the air.
        self.maybe_receive(uuid)
    }

    /// One reclamation pass. Failures on individual items are logged and
    /// skipped.
    pub fn reclaim(&self, now: DateTime<Utc>) -> QueueResult<ReclaimReport> {
        let mut report = ReclaimReport::default();

        for invoice in self.db.pending_invoices()? {
            if !invoice.is_overdue(now) {
                continue;
            }
            match self.reclaim_invoice(&invoice, now) {
                Ok(Some(order_expired)) => {
                    report.expired_invoices += 1;
                    if order_expired {
                        report.expired_orders += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(lid = %invoice.lid, error = %e, "failed to expire invoice"),
            }
        }

        if let Some(cutoff) = cutoff(now, self.config.pending_order_ttl) {
            for order in self.db.orders_with_status(OrderStatus::Pending)? {
                if order.created_at >= cutoff {
                    continue;
                }
                match self.reclaim_order(&order.uuid, now) {
                    Ok(true) => report.expired_orders += 1,
                    Ok(false) => {}
                    Err(e) => warn!(uuid = %order.uuid, error = %e, "failed to expire order"),
                }
            }
        }

        if let Some(cutoff) = cutoff(now, self.config.message_retention) {
            for status in [OrderStatus::Sent, OrderStatus::Received] {
                for order in self.db.orders_with_status(status)? {
                    if !order.ended_transmission_at.is_some_and(|ended| ended < cutoff) {
                        continue;
                    }
                    match self.payloads.delete(&order.uuid) {
                        Ok(true) => report.removed_payloads += 1,
                        Ok(false) => {}
                        Err(e) => warn!(uuid = %order.uuid, error = %e, "failed to remove payload"),
                    }
                }
            }
        }

        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(report)
    }

    /// `Some(order_expired)` when the invoice was expired here.
    fn reclaim_invoice(&self, invoice: &Invoice, now: DateTime<Utc>) -> QueueResult<Option<bool>> {
        let lock = self.order_lock(&invoice.order_uuid);
        let _guard = lock.lock();
        match self.db.get_invoice(invoice.id)? {
            Some(current) if current.is_overdue(now) => Ok(Some(self.expire_invoice(current, now)?)),
            _ => Ok(None),
        }
    }

    fn reclaim_order(&self, uuid: &Uuid, now: DateTime<Utc>) -> QueueResult<bool> {
        let lock = self.order_lock(uuid);
        let _guard = lock.lock();
        let mut order = self.load_order(uuid)?;
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        let t = order.apply(OrderEvent::Expire, now)?;
        self.db.put_order(&order)?;
        self.run_order_effects(&order, &t)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
