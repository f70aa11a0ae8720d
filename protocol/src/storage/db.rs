//! # QueueDb: Persistent Storage Engine
//!
//! Orders, invoices, confirmations and the region catalog, on sled's
//! embedded key-value store. Every value is bincode.
//!
//! ## Tree Layout
//!
//! | Tree               | Key                       | Value                 |
//! |--------------------|---------------------------|-----------------------|
//! | `orders`           | `uuid` (16B)              | `bincode(Order)`      |
//! | `order_status`     | `status tag` (1B) + uuid  | empty                 |
//! | `tx_seq`           | `tx_seq_num` (8B BE)      | `uuid` (16B)          |
//! | `invoices`         | `id` (8B BE)              | `bincode(Invoice)`    |
//! | `invoice_lids`     | `lid` (UTF-8)             | `id` (8B BE)          |
//! | `order_invoices`   | `uuid` + `id` (8B BE)     | empty                 |
//! | `pending_invoices` | `id` (8B BE)              | empty                 |
//! | `tx_confirmations` | `uuid` + `region` (1B)    | `bincode(Confirmation)` |
//! | `rx_confirmations` | `uuid` + `region` (1B)    | `bincode(Confirmation)` |
//! | `regions`          | `number` (1B)             | `bincode(Region)`     |
//!
//! Sequence numbers and invoice ids are big-endian so that sled's
//! lexicographic order is numeric order: the last key of `tx_seq` is the
//! highest sequence number ever assigned.
//!
//! ## Atomicity
//!
//! An order and its status index entry (and its sequence number mapping)
//! are written in one multi-tree transaction, as are an invoice and its
//! three indexes. A crash never leaves an index pointing at a state the
//! record is not in.

use std::collections::BTreeSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use sled::{Db, Tree};
use uuid::Uuid;

use crate::confirmation::{Confirmation, ConfirmationKind};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::order::{Order, OrderStatus};
use crate::region::Region;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<TransactionError<DbError>> for DbError {
    fn from(err: TransactionError<DbError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => DbError::Sled(e),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> DbResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::CorruptIndex("invalid u64 bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_uuid(bytes: &[u8]) -> DbResult<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| DbError::CorruptIndex(e.to_string()))
}

// -- Key builders -----------------------------------------------------------

fn status_key(status: OrderStatus, uuid: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status.tag());
    key.extend_from_slice(uuid.as_bytes());
    key
}

fn order_invoice_key(uuid: &Uuid, invoice_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(uuid.as_bytes());
    key.extend_from_slice(&invoice_id.to_be_bytes());
    key
}

fn confirmation_key(uuid: &Uuid, region: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.extend_from_slice(uuid.as_bytes());
    key.push(region);
    key
}

// -- Transactional writes ---------------------------------------------------

type TxResult = Result<(), ConflictableTransactionError<DbError>>;

fn write_order(
    orders: &TransactionalTree,
    status: &TransactionalTree,
    seq: &TransactionalTree,
    order: &Order,
    bytes: &[u8],
) -> TxResult {
    let key = order.uuid.as_bytes().to_vec();
    if let Some(old) = orders.insert(key.clone(), bytes)? {
        let prev: Order = decode(&old).map_err(ConflictableTransactionError::Abort)?;
        if prev.status != order.status {
            status.remove(status_key(prev.status, &prev.uuid))?;
        }
    }
    status.insert(status_key(order.status, &order.uuid), Vec::<u8>::new())?;
    if let Some(seq_num) = order.tx_seq_num {
        seq.insert(seq_num.to_be_bytes().to_vec(), key)?;
    }
    Ok(())
}

fn write_invoice(
    invoices: &TransactionalTree,
    lids: &TransactionalTree,
    links: &TransactionalTree,
    pending_idx: &TransactionalTree,
    invoice: &Invoice,
    bytes: &[u8],
) -> TxResult {
    let id_key = invoice.id.to_be_bytes().to_vec();
    invoices.insert(id_key.clone(), bytes)?;
    lids.insert(invoice.lid.as_bytes(), id_key.clone())?;
    links.insert(order_invoice_key(&invoice.order_uuid, invoice.id), Vec::<u8>::new())?;
    if invoice.status == InvoiceStatus::Pending {
        pending_idx.insert(id_key, Vec::<u8>::new())?;
    } else {
        pending_idx.remove(id_key)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// QueueDb
// ---------------------------------------------------------------------------

/// Persistent storage for the broadcast queue.
///
/// Cheap to clone; clones share the same sled handle. sled serializes
/// writes internally, so `QueueDb` needs no extra locking. Keeping the
/// read-modify-write of a single order consistent is the caller's job.
#[derive(Debug, Clone)]
pub struct QueueDb {
    db: Db,
    orders: Tree,
    order_status: Tree,
    tx_seq: Tree,
    invoices: Tree,
    invoice_lids: Tree,
    order_invoices: Tree,
    pending_invoices: Tree,
    tx_confirmations: Tree,
    rx_confirmations: Tree,
    regions: Tree,
}

impl QueueDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database removed on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            orders: db.open_tree("orders")?,
            order_status: db.open_tree("order_status")?,
            tx_seq: db.open_tree("tx_seq")?,
            invoices: db.open_tree("invoices")?,
            invoice_lids: db.open_tree("invoice_lids")?,
            order_invoices: db.open_tree("order_invoices")?,
            pending_invoices: db.open_tree("pending_invoices")?,
            tx_confirmations: db.open_tree("tx_confirmations")?,
            rx_confirmations: db.open_tree("rx_confirmations")?,
            regions: db.open_tree("regions")?,
            db,
        })
    }

    // -- Order operations ---------------------------------------------------

    /// Insert or replace an order, keeping the status index and sequence
    /// mapping in step.
    pub fn put_order(&self, order: &Order) -> DbResult<()> {
        let bytes = encode(order)?;
        (&self.orders, &self.order_status, &self.tx_seq)
            .transaction(|(orders, status, seq)| write_order(orders, status, seq, order, &bytes))?;
        Ok(())
    }

    /// Store a new order together with its first invoice. A webhook never
    /// sees the invoice without its order.
    pub fn put_order_with_invoice(&self, order: &Order, invoice: &Invoice) -> DbResult<()> {
        let order_bytes = encode(order)?;
        let invoice_bytes = encode(invoice)?;
        (
            &self.orders,
            &self.order_status,
            &self.tx_seq,
            &self.invoices,
            &self.invoice_lids,
            &self.order_invoices,
            &self.pending_invoices,
        )
            .transaction(|(orders, status, seq, invoices, lids, links, pending_idx)| {
                write_order(orders, status, seq, order, &order_bytes)?;
                write_invoice(invoices, lids, links, pending_idx, invoice, &invoice_bytes)
            })?;
        Ok(())
    }

    pub fn get_order(&self, uuid: &Uuid) -> DbResult<Option<Order>> {
        match self.orders.get(uuid.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All orders currently in `status`, in uuid order.
    pub fn orders_with_status(&self, status: OrderStatus) -> DbResult<Vec<Order>> {
        let mut out = Vec::new();
        for entry in self.order_status.scan_prefix([status.tag()]) {
            let (key, _) = entry?;
            let uuid = decode_uuid(&key[1..])?;
            match self.get_order(&uuid)? {
                Some(order) => out.push(order),
                None => {
                    return Err(DbError::CorruptIndex(format!(
                        "status index points at missing order {uuid}"
                    )))
                }
            }
        }
        Ok(out)
    }

    pub fn count_with_status(&self, status: OrderStatus) -> usize {
        self.order_status.scan_prefix([status.tag()]).count()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Order that went on the air with `tx_seq_num`.
    pub fn order_by_seq(&self, tx_seq_num: u64) -> DbResult<Option<Order>> {
        match self.tx_seq.get(tx_seq_num.to_be_bytes())? {
            Some(uuid_bytes) => self.get_order(&decode_uuid(&uuid_bytes)?),
            None => Ok(None),
        }
    }

    /// Highest sequence number ever assigned.
    pub fn last_tx_seq_num(&self) -> DbResult<Option<u64>> {
        match self.tx_seq.last()? {
            Some((key, _)) => Ok(Some(decode_u64(&key)?)),
            None => Ok(None),
        }
    }

    /// `max + 1`, starting at 1.
    pub fn next_tx_seq_num(&self) -> DbResult<u64> {
        Ok(self.last_tx_seq_num()?.map_or(1, |last| last + 1))
    }

    // -- Invoice operations -------------------------------------------------

    /// Fresh, never reused invoice id.
    pub fn new_invoice_id(&self) -> DbResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Insert or replace an invoice and its indexes.
    pub fn put_invoice(&self, invoice: &Invoice) -> DbResult<()> {
        let bytes = encode(invoice)?;
        (
            &self.invoices,
            &self.invoice_lids,
            &self.order_invoices,
            &self.pending_invoices,
        )
            .transaction(|(invoices, lids, links, pending_idx)| {
                write_invoice(invoices, lids, links, pending_idx, invoice, &bytes)
            })?;
        Ok(())
    }

    pub fn get_invoice(&self, id: u64) -> DbResult<Option<Invoice>> {
        match self.invoices.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn invoice_by_lid(&self, lid: &str) -> DbResult<Option<Invoice>> {
        match self.invoice_lids.get(lid.as_bytes())? {
            Some(id_bytes) => self.get_invoice(decode_u64(&id_bytes)?),
            None => Ok(None),
        }
    }

    /// Invoices of an order, oldest first.
    pub fn invoices_for_order(&self, uuid: &Uuid) -> DbResult<Vec<Invoice>> {
        let mut out = Vec::new();
        for entry in self.order_invoices.scan_prefix(uuid.as_bytes()) {
            let (key, _) = entry?;
            let id = decode_u64(&key[16..])?;
            if let Some(invoice) = self.get_invoice(id)? {
                out.push(invoice);
            }
        }
        Ok(out)
    }

    pub fn pending_invoices(&self) -> DbResult<Vec<Invoice>> {
        let mut out = Vec::new();
        for entry in self.pending_invoices.iter() {
            let (key, _) = entry?;
            if let Some(invoice) = self.get_invoice(decode_u64(&key)?)? {
                out.push(invoice);
            }
        }
        Ok(out)
    }

    // -- Confirmation operations --------------------------------------------

    fn confirmation_tree(&self, kind: ConfirmationKind) -> &Tree {
        match kind {
            ConfirmationKind::Tx => &self.tx_confirmations,
            ConfirmationKind::Rx => &self.rx_confirmations,
        }
    }

    /// Record a confirmation unless one exists for the same order and
    /// region. Returns whether it was inserted.
    pub fn add_confirmation(
        &self,
        kind: ConfirmationKind,
        confirmation: &Confirmation,
    ) -> DbResult<bool> {
        let key = confirmation_key(&confirmation.order_uuid, confirmation.region);
        let bytes = encode(confirmation)?;
        let swapped = self
            .confirmation_tree(kind)
            .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))?;
        Ok(swapped.is_ok())
    }

    pub fn confirmations(
        &self,
        kind: ConfirmationKind,
        uuid: &Uuid,
    ) -> DbResult<Vec<Confirmation>> {
        let mut out = Vec::new();
        for entry in self.confirmation_tree(kind).scan_prefix(uuid.as_bytes()) {
            let (_, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Region numbers that confirmed `uuid`.
    pub fn confirmed_regions(&self, kind: ConfirmationKind, uuid: &Uuid) -> DbResult<BTreeSet<u8>> {
        let mut out = BTreeSet::new();
        for entry in self.confirmation_tree(kind).scan_prefix(uuid.as_bytes()) {
            let (key, _) = entry?;
            if let Some(&region) = key.get(16) {
                out.insert(region);
            }
        }
        Ok(out)
    }

    // -- Region operations --------------------------------------------------

    /// Insert catalog entries that are not stored yet. Existing entries,
    /// including operator changes to them, are left alone.
    pub fn seed_regions(&self, regions: &[Region]) -> DbResult<usize> {
        let mut inserted = 0;
        for region in regions {
            let bytes = encode(region)?;
            let swapped = self.regions.compare_and_swap(
                [region.number],
                None as Option<&[u8]>,
                Some(bytes),
            )?;
            if swapped.is_ok() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn load_regions(&self) -> DbResult<Vec<Region>> {
        let mut out = Vec::new();
        for entry in self.regions.iter() {
            let (_, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Flip a region's receiver flag. Returns the updated region, or `None`
    /// when the number is unknown.
    pub fn set_has_receiver(&self, number: u8, has_receiver: bool) -> DbResult<Option<Region>> {
        let Some(bytes) = self.regions.get([number])? else {
            return Ok(None);
        };
        let mut region: Region = decode(&bytes)?;
        region.has_receiver = has_receiver;
        self.regions.insert([number], encode(&region)?)?;
        Ok(Some(region))
    }

    // -- Utility operations -------------------------------------------------

    /// Block until every write is durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::catalog;
    use chrono::{Duration, Utc};

    fn make_order() -> Order {
        Order::new(1000, "ab".repeat(32), 1052, Utc::now())
    }

    fn make_invoice(db: &QueueDb, order: &Order, amount: u64) -> Invoice {
        let now = Utc::now();
        let id = db.new_invoice_id().unwrap();
        Invoice {
            id,
            order_uuid: order.uuid,
            amount,
            status: InvoiceStatus::Pending,
            lid: format!("lid-{id}"),
            payload: "lnbc".into(),
            created_at: now,
            expires_at: now + Duration::hours(1),
            paid_at: None,
        }
    }

    #[test]
    fn open_temporary_database() {
        let db = QueueDb::open_temporary().expect("should create temp db");
        assert_eq!(db.order_count(), 0);
        assert_eq!(db.last_tx_seq_num().unwrap(), None);
        assert_eq!(db.next_tx_seq_num().unwrap(), 1);
    }

    #[test]
    fn reopen_persists_orders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let order = make_order();
        {
            let db = QueueDb::open(dir.path()).expect("should open db");
            db.put_order(&order).unwrap();
            db.flush().unwrap();
        }
        let db = QueueDb::open(dir.path()).expect("should reopen db");
        assert_eq!(db.get_order(&order.uuid).unwrap(), Some(order));
    }

    #[test]
    fn status_index_follows_order() {
        let db = QueueDb::open_temporary().unwrap();
        let mut order = make_order();
        db.put_order(&order).unwrap();
        assert_eq!(db.count_with_status(OrderStatus::Pending), 1);

        order.status = OrderStatus::Paid;
        db.put_order(&order).unwrap();
        assert_eq!(db.count_with_status(OrderStatus::Pending), 0);
        assert_eq!(db.count_with_status(OrderStatus::Paid), 1);
        assert_eq!(db.orders_with_status(OrderStatus::Paid).unwrap()[0].uuid, order.uuid);
    }

    #[test]
    fn sequence_numbers_map_to_orders() {
        let db = QueueDb::open_temporary().unwrap();
        let mut order = make_order();
        order.status = OrderStatus::Transmitting;
        order.tx_seq_num = Some(db.next_tx_seq_num().unwrap());
        db.put_order(&order).unwrap();

        assert_eq!(db.last_tx_seq_num().unwrap(), Some(1));
        assert_eq!(db.next_tx_seq_num().unwrap(), 2);
        assert_eq!(db.order_by_seq(1).unwrap().unwrap().uuid, order.uuid);
        assert!(db.order_by_seq(2).unwrap().is_none());
    }

    #[test]
    fn order_and_first_invoice_land_together() {
        let db = QueueDb::open_temporary().unwrap();
        let order = make_order();
        let invoice = make_invoice(&db, &order, 1052);
        db.put_order_with_invoice(&order, &invoice).unwrap();

        assert_eq!(db.get_order(&order.uuid).unwrap(), Some(order.clone()));
        assert_eq!(db.count_with_status(OrderStatus::Pending), 1);
        let stored = db.invoice_by_lid(&invoice.lid).unwrap().unwrap();
        assert_eq!(stored.order_uuid, order.uuid);
        assert_eq!(db.invoices_for_order(&order.uuid).unwrap(), vec![invoice]);
        assert_eq!(db.pending_invoices().unwrap().len(), 1);
    }

    #[test]
    fn invoice_indexes() {
        let db = QueueDb::open_temporary().unwrap();
        let order = make_order();
        let first = make_invoice(&db, &order, 100);
        let mut second = make_invoice(&db, &order, 200);
        db.put_invoice(&first).unwrap();
        db.put_invoice(&second).unwrap();

        assert_eq!(db.invoice_by_lid(&second.lid).unwrap(), Some(second.clone()));
        assert_eq!(db.pending_invoices().unwrap().len(), 2);
        let amounts: Vec<u64> = db
            .invoices_for_order(&order.uuid)
            .unwrap()
            .iter()
            .map(|i| i.amount)
            .collect();
        assert_eq!(amounts, vec![100, 200]);

        second.status = InvoiceStatus::Paid;
        db.put_invoice(&second).unwrap();
        let pending = db.pending_invoices().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }

    #[test]
    fn confirmations_are_idempotent() {
        let db = QueueDb::open_temporary().unwrap();
        let uuid = Uuid::new_v4();
        let c = Confirmation::reported(uuid, 3, Utc::now());
        assert!(db.add_confirmation(ConfirmationKind::Tx, &c).unwrap());
        assert!(!db.add_confirmation(ConfirmationKind::Tx, &c).unwrap());
        assert!(db.add_confirmation(ConfirmationKind::Rx, &c).unwrap());
        assert_eq!(db.confirmations(ConfirmationKind::Tx, &uuid).unwrap().len(), 1);
        assert_eq!(
            db.confirmed_regions(ConfirmationKind::Tx, &uuid).unwrap(),
            BTreeSet::from([3])
        );
    }

    #[test]
    fn regions_seed_once_and_keep_operator_changes() {
        let db = QueueDb::open_temporary().unwrap();
        assert_eq!(db.seed_regions(&catalog()).unwrap(), 6);
        let updated = db.set_has_receiver(2, true).unwrap().unwrap();
        assert!(updated.has_receiver);

        assert_eq!(db.seed_regions(&catalog()).unwrap(), 0);
        let regions = db.load_regions().unwrap();
        assert_eq!(regions.len(), 6);
        assert!(regions[2].has_receiver);
        assert!(db.set_has_receiver(42, true).unwrap().is_none());
    }
}
