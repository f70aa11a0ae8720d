//! HMAC tokens for invoice callbacks and order ownership.
//!
//! Two keys are derived from the server secret, one per audience, so a token
//! leaked from a payment webhook can never be replayed against an order:
//!
//! ```text
//! invoice_key = HMAC-SHA256(key = "charged-token", data = secret)
//! user_key    = HMAC-SHA256(key = "user-token",    data = secret)
//! invoice_token(lid)  = hex(HMAC-SHA256(invoice_key, lid))
//! order_token(uuid)   = hex(HMAC-SHA256(user_key, uuid))
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const INVOICE_KEY_LABEL: &[u8] = b"charged-token";
const USER_KEY_LABEL: &[u8] = b"user-token";

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Issues and checks authentication tokens.
#[derive(Clone)]
pub struct TokenAuthority {
    invoice_key: [u8; 32],
    user_key: [u8; 32],
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}

impl TokenAuthority {
    pub fn new(server_secret: &[u8]) -> Self {
        Self {
            invoice_key: hmac_sha256(INVOICE_KEY_LABEL, server_secret),
            user_key: hmac_sha256(USER_KEY_LABEL, server_secret),
        }
    }

    /// Token embedded in the webhook URL of the invoice `lid`.
    pub fn invoice_token(&self, lid: &str) -> String {
        hex::encode(hmac_sha256(&self.invoice_key, lid.as_bytes()))
    }

    /// Token handed to the creator of order `uuid`.
    pub fn order_token(&self, uuid: &Uuid) -> String {
        hex::encode(hmac_sha256(&self.user_key, uuid.to_string().as_bytes()))
    }

    pub fn verify_invoice_token(&self, lid: &str, token: &str) -> bool {
        constant_time_eq(&self.invoice_token(lid), token)
    }

    pub fn verify_order_token(&self, uuid: &Uuid, token: &str) -> bool {
        constant_time_eq(&self.order_token(uuid), token)
    }
}

fn constant_time_eq(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}
