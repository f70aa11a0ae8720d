//! # Invoices
//!
//! An invoice is one payment request against an order. Creating an order
//! issues the first one; every bump issues another. Invoices never change
//! amount, and once they leave `pending` they never move again.
//!
//! ```text
//! pending ──pay──▶ paid
//!    │
//!    └──expire──▶ expired
//! ```
//!
//! [`transition`] is a pure table lookup. [`Invoice::apply`] runs the
//! effects that only touch the invoice itself and hands the rest back to
//! the caller, which owns the order and the storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidTransition;

// ---------------------------------------------------------------------------
// Status & Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEvent {
    Pay,
    Expire,
}

impl InvoiceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pay => "pay",
            Self::Expire => "expire",
        }
    }
}

/// Side effects of an invoice transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEffect {
    /// Before entering `paid`.
    RecordPaidAt,
    /// After entering `paid`: recompute the order's bids and try `pay`.
    MaybeMarkOrderPaid,
    /// After entering `expired`: expire the order if it is still pending
    /// and has no other pending invoice.
    ExpireOrderIfNoPendingInvoices,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceTransition {
    pub from: InvoiceStatus,
    pub to: InvoiceStatus,
    pub before: Vec<InvoiceEffect>,
    pub after: Vec<InvoiceEffect>,
}

/// The invoice transition table.
pub fn transition(
    status: InvoiceStatus,
    event: InvoiceEvent,
) -> Result<InvoiceTransition, InvalidTransition> {
    use InvoiceEffect::*;

    let (to, before, after) = match (status, event) {
        (InvoiceStatus::Pending, InvoiceEvent::Pay) => {
            (InvoiceStatus::Paid, vec![RecordPaidAt], vec![MaybeMarkOrderPaid])
        }
        (InvoiceStatus::Pending, InvoiceEvent::Expire) => (
            InvoiceStatus::Expired,
            vec![],
            vec![ExpireOrderIfNoPendingInvoices],
        ),
        _ => {
            return Err(InvalidTransition {
                entity: "invoice",
                from: status.as_str(),
                event: event.as_str(),
            })
        }
    };

    Ok(InvoiceTransition {
        from: status,
        to,
        before,
        after,
    })
}

// ---------------------------------------------------------------------------
// Invoice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: u64,
    pub order_uuid: Uuid,
    /// Millisatoshis.
    pub amount: u64,
    pub status: InvoiceStatus,
    /// Reference id assigned by the payment gateway.
    pub lid: String,
    /// Encoded payment request returned by the gateway.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn is_pending(&self) -> bool {
        self.status == InvoiceStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at < now
    }

    /// Move the invoice and return the after-effects still to run.
    ///
    /// On error the invoice is untouched.
    pub fn apply(
        &mut self,
        event: InvoiceEvent,
        now: DateTime<Utc>,
    ) -> Result<InvoiceTransition, InvalidTransition> {
        let t = transition(self.status, event)?;
        for effect in &t.before {
            if let InvoiceEffect::RecordPaidAt = effect {
                self.paid_at = Some(now);
            }
        }
        self.status = t.to;
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(amount: u64) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: 1,
            order_uuid: Uuid::new_v4(),
            amount,
            status: InvoiceStatus::Pending,
            lid: "lid".into(),
            payload: "lnbc".into(),
            created_at: now,
            expires_at: now + Duration::hours(1),
            paid_at: None,
        }
    }

    #[test]
    fn test_pay_records_paid_at() {
        let mut invoice = pending(100);
        let now = Utc::now();
        let t = invoice.apply(InvoiceEvent::Pay, now).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_at, Some(now));
        assert_eq!(t.after, vec![InvoiceEffect::MaybeMarkOrderPaid]);
    }

    #[test]
    fn test_paid_is_terminal() {
        let mut invoice = pending(100);
        let first = Utc::now();
        invoice.apply(InvoiceEvent::Pay, first).unwrap();

        let err = invoice.apply(InvoiceEvent::Pay, Utc::now()).unwrap_err();
        assert_eq!(err.from, "paid");
        assert_eq!(invoice.paid_at, Some(first));
        assert!(invoice.apply(InvoiceEvent::Expire, Utc::now()).is_err());
    }

    #[test]
    fn test_expire() {
        let mut invoice = pending(100);
        let t = invoice.apply(InvoiceEvent::Expire, Utc::now()).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Expired);
        assert_eq!(t.after, vec![InvoiceEffect::ExpireOrderIfNoPendingInvoices]);
        assert!(invoice.apply(InvoiceEvent::Pay, Utc::now()).is_err());
        assert!(invoice.paid_at.is_none());
    }

    #[test]
    fn test_overdue() {
        let invoice = pending(100);
        assert!(!invoice.is_overdue(Utc::now()));
        assert!(invoice.is_overdue(Utc::now() + Duration::hours(2)));
    }
}
