#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::http::HeaderMap;
use storefront_api::{
    config::{AppConfig, MailConfig, StripeConfig},
    db,
    notify::{Notification, Notifier},
    providers::{
        Charge, ChargeState, PaymentProvider, ProviderError, ProviderEvent, ProviderRefund,
        ProviderSession, Providers, RefundRequest, SessionRequest,
    },
    state::AppState,
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn test_config(database_url: &str) -> AppConfig {
    AppConfig {
        database_url: database_url.to_string(),
        host: "127.0.0.1".into(),
        port: 0,
        jwt_secret: "test-secret".into(),
        frontend_url: "http://localhost:5173".into(),
        stripe: Some(StripeConfig {
            secret_key: "sk_test_unused".into(),
            webhook_secret: WEBHOOK_SECRET.into(),
            // Nothing listens here; tests must not reach the network.
            api_base: "http://127.0.0.1:9".into(),
        }),
        paypal: None,
        mail: MailConfig {
            api_url: None,
            api_key: None,
            from: "no-reply@localhost".into(),
        },
        provider_timeout: Duration::from_secs(1),
        shipping_charge: 0,
        webhook_tolerance_secs: 300,
    }
}

/// Card provider that records what it was asked. Sessions succeed unless
/// `decline_sessions` is set.
#[derive(Default)]
pub struct FakeCardProvider {
    pub decline_sessions: AtomicBool,
    pub sessions: AtomicUsize,
    pub refunds: Mutex<Vec<RefundRequest>>,
}

impl FakeCardProvider {
    pub fn refund_requests(&self) -> Vec<RefundRequest> {
        self.refunds.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PaymentProvider for FakeCardProvider {
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, ProviderError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        if self.decline_sessions.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected("card declined".into()));
        }
        let key = request.payment_id.simple();
        Ok(ProviderSession {
            session_id: format!("cs_{key}"),
            intent_id: Some(format!("pi_{key}")),
            checkout_url: format!("https://checkout.test/{key}"),
        })
    }

    async fn capture(&self, _session_id: &str) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    async fn retrieve_charge(&self, reference: &str) -> Result<Charge, ProviderError> {
        Ok(Charge {
            id: format!("ch_{reference}"),
            state: ChargeState::Refundable,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ProviderRefund, ProviderError> {
        let mut refunds = self.refunds.lock().expect("refund log");
        refunds.push(request.clone());
        Ok(ProviderRefund {
            refund_id: format!("re_{}", refunds.len()),
        })
    }

    async fn verify_webhook(
        &self,
        _headers: &HeaderMap,
        _payload: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        Err(ProviderError::Signature("fake provider".into()))
    }
}

/// Keeps the kind of every notification it was handed.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<&'static str>>,
}

impl RecordingNotifier {
    pub fn count(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .map(|sent| sent.iter().filter(|k| **k == kind).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .push(notification.kind());
        Ok(())
    }
}

/// Let spawned notification tasks run to completion.
pub async fn drain_background_tasks() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub struct Harness {
    pub state: AppState,
    pub card: Arc<FakeCardProvider>,
    pub notifier: Arc<RecordingNotifier>,
}

/// State over a live database with fake providers.
pub async fn harness(database_url: &str) -> anyhow::Result<Harness> {
    let pool = db::create_pool(database_url).await?;
    db::run_migrations(&pool).await?;

    let card = Arc::new(FakeCardProvider::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let state = AppState {
        orm: db::orm_from_pool(&pool),
        pool,
        config: Arc::new(test_config(database_url)),
        providers: Providers::new(Some(card.clone() as Arc<dyn PaymentProvider>), None),
        notifier: notifier.clone(),
    };

    Ok(Harness {
        state,
        card,
        notifier,
    })
}

pub fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}
