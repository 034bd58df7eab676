//! Payment provider port.
//!
//! Every external payment service is reached through [`PaymentProvider`]. The
//! order flow never inspects provider error strings: failures come back as the
//! closed [`ProviderError`] enum and are matched exhaustively.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use thiserror::Error;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::entity::sea_orm_active_enums::PaymentMethod;

pub mod paypal;
pub mod stripe;

pub use paypal::PaypalClient;
pub use stripe::StripeClient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider resource not found: {0}")]
    NotFound(String),

    #[error("already processed by provider")]
    AlreadyProcessed { reference: Option<String> },

    #[error("provider authentication failed")]
    Authentication,

    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("provider unreachable: {0}")]
    Transport(String),

    #[error("invalid webhook signature: {0}")]
    Signature(String),

    #[error("payment method {0:?} is not supported")]
    Unsupported(PaymentMethod),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// Input for a hosted checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub order_id: Uuid,
    pub payment_id: Uuid,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSession {
    /// Card: checkout session id. Wallet: provider order id.
    pub session_id: String,
    pub intent_id: Option<String>,
    pub checkout_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeState {
    Refundable,
    AlreadyRefunded { refund_id: Option<String> },
    NotRefundable(String),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub id: String,
    pub state: ChargeState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub charge_id: String,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRefund {
    pub refund_id: String,
}

/// How an inbound event identifies the payment it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentLookup {
    CardSession(String),
    CardIntent {
        intent_id: String,
        payment_id: Option<Uuid>,
    },
    WalletOrder(String),
}

/// Provider webhook, normalized after its signature was verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SessionCompleted {
        session_id: String,
        intent_id: Option<String>,
        paid: bool,
    },
    WalletApproved {
        order_id: String,
    },
    PaymentProcessing {
        lookup: PaymentLookup,
    },
    PaymentSucceeded {
        lookup: PaymentLookup,
        capture_id: Option<String>,
    },
    PaymentFailed {
        lookup: PaymentLookup,
        reason: Option<String>,
    },
    Ignored {
        kind: String,
    },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout the customer is redirected to.
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, ProviderError>;

    /// Collect funds for an approved session. Returns the capture id when the
    /// provider needs an explicit capture.
    async fn capture(&self, session_id: &str) -> Result<Option<String>, ProviderError>;

    /// Look up the charge behind a payment intent or capture.
    async fn retrieve_charge(&self, reference: &str) -> Result<Charge, ProviderError>;

    /// Refund a charge. The idempotency key is forwarded to the provider.
    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, ProviderError>;

    /// Authenticate an inbound webhook and parse it.
    async fn verify_webhook(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<ProviderEvent, ProviderError>;
}

/// Payment method resolved to the channel that processes it.
#[derive(Clone)]
pub enum Channel {
    Card(Arc<dyn PaymentProvider>),
    Wallet(Arc<dyn PaymentProvider>),
    CashOnDelivery,
}

impl Channel {
    pub fn provider(&self) -> Option<&Arc<dyn PaymentProvider>> {
        match self {
            Channel::Card(provider) | Channel::Wallet(provider) => Some(provider),
            Channel::CashOnDelivery => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct Providers {
    card: Option<Arc<dyn PaymentProvider>>,
    wallet: Option<Arc<dyn PaymentProvider>>,
}

impl Providers {
    pub fn new(
        card: Option<Arc<dyn PaymentProvider>>,
        wallet: Option<Arc<dyn PaymentProvider>>,
    ) -> Self {
        Self { card, wallet }
    }

    pub fn card(&self) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
        self.card
            .clone()
            .ok_or(ProviderError::Unsupported(PaymentMethod::CreditCard))
    }

    pub fn wallet(&self) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
        self.wallet
            .clone()
            .ok_or(ProviderError::Unsupported(PaymentMethod::Paypal))
    }

    pub fn channel(&self, method: PaymentMethod) -> Result<Channel, ProviderError> {
        match method {
            PaymentMethod::CreditCard | PaymentMethod::DebitCard => match &self.card {
                Some(provider) => Ok(Channel::Card(provider.clone())),
                None => Err(ProviderError::Unsupported(method)),
            },
            PaymentMethod::Paypal => match &self.wallet {
                Some(provider) => Ok(Channel::Wallet(provider.clone())),
                None => Err(ProviderError::Unsupported(method)),
            },
            PaymentMethod::CashOnDelivery => Ok(Channel::CashOnDelivery),
        }
    }
}

/// Amount in minor units rendered as a decimal string, e.g. `1999` -> `"19.99"`.
pub fn format_minor_units(amount: i64) -> String {
    format_scaled(amount, 2)
}

/// Number of decimal places in the minor unit of an ISO 4217 currency.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency.to_ascii_lowercase().as_str() {
        "bif" | "clp" | "djf" | "gnf" | "isk" | "jpy" | "kmf" | "krw" | "mga" | "pyg" | "rwf"
        | "ugx" | "vnd" | "vuv" | "xaf" | "xof" | "xpf" => 0,
        "bhd" | "iqd" | "jod" | "kwd" | "lyd" | "omr" | "tnd" => 3,
        _ => 2,
    }
}

/// Minor units of `currency` as the decimal string wallet APIs expect,
/// e.g. `(1999, "usd")` -> `"19.99"`, `(500, "jpy")` -> `"500"`.
pub fn format_amount(amount: i64, currency: &str) -> String {
    format_scaled(amount, currency_exponent(currency))
}

fn format_scaled(amount: i64, exponent: u32) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    if exponent == 0 {
        return format!("{sign}{abs}");
    }
    let scale = 10_u64.pow(exponent);
    format!(
        "{sign}{}.{:0width$}",
        abs / scale,
        abs % scale,
        width = exponent as usize
    )
}
