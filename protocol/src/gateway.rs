//! # Payment Gateway
//!
//! The queue never talks Lightning itself. It asks a gateway for an
//! invoice, then registers a webhook so the gateway calls back when the
//! invoice is paid:
//!
//! ```text
//! {callback_root}/callback/{lid}/{invoice_token}
//! ```
//!
//! The token in the URL is what authenticates the callback (see
//! [`crate::auth`]).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every invoice so a paid invoice can be traced back
/// to its message without asking us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMetadata {
    pub uuid: Uuid,
    pub sha256_message_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    /// Millisatoshis.
    pub amount: u64,
    pub description: String,
    pub expiry: Duration,
    pub metadata: InvoiceMetadata,
}

/// What the gateway hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInvoice {
    pub lid: String,
    /// Encoded payment request, passed through to the customer untouched.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GatewayError(pub String);

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(&self, request: &InvoiceRequest)
        -> Result<GatewayInvoice, GatewayError>;

    async fn register_webhook(&self, lid: &str, callback_url: &str) -> Result<(), GatewayError>;
}

pub fn callback_url(root: &str, lid: &str, token: &str) -> String {
    format!("{}/callback/{lid}/{token}", root.trim_end_matches('/'))
}

pub mod mock {
    //! In-process gateway for tests and local runs.

    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockGateway {
        next_id: AtomicU64,
        fail_invoices: AtomicBool,
        fail_webhooks: AtomicBool,
        requests: Mutex<Vec<InvoiceRequest>>,
        webhooks: Mutex<Vec<(String, String)>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_invoices(&self, fail: bool) {
            self.fail_invoices.store(fail, Ordering::SeqCst);
        }

        pub fn fail_webhooks(&self, fail: bool) {
            self.fail_webhooks.store(fail, Ordering::SeqCst);
        }

        pub fn requests(&self) -> Vec<InvoiceRequest> {
            self.requests.lock().clone()
        }

        /// `(lid, callback_url)` pairs, in registration order.
        pub fn webhooks(&self) -> Vec<(String, String)> {
            self.webhooks.lock().clone()
        }

        /// Token from the last callback URL registered for `lid`.
        pub fn token_for(&self, lid: &str) -> Option<String> {
            self.webhooks
                .lock()
                .iter()
                .rev()
                .find(|(l, _)| l == lid)
                .and_then(|(_, url)| url.rsplit('/').next().map(str::to_string))
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_invoice(
            &self,
            request: &InvoiceRequest,
        ) -> Result<GatewayInvoice, GatewayError> {
            if self.fail_invoices.load(Ordering::SeqCst) {
                return Err(GatewayError("gateway unavailable".into()));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.requests.lock().push(request.clone());
            Ok(GatewayInvoice {
                lid: format!("mock-{n}"),
                payload: format!("lnmock{}n{n}", request.amount),
            })
        }

        async fn register_webhook(&self, lid: &str, callback_url: &str) -> Result<(), GatewayError> {
            if self.fail_webhooks.load(Ordering::SeqCst) {
                return Err(GatewayError("webhook rejected".into()));
            }
            self.webhooks
                .lock()
                .push((lid.to_string(), callback_url.to_string()));
            Ok(())
        }
    }
}
