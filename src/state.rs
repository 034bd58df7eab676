use std::{sync::Arc, time::Duration};

use crate::{
    config::AppConfig,
    db::{self, DbPool, OrmConn},
    notify::{self, Notifier},
    providers::{PaymentProvider, PaypalClient, Providers, StripeClient},
};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orm: OrmConn,
    pub config: Arc<AppConfig>,
    pub providers: Providers,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    /// Wire providers and the notifier from configuration. Unconfigured
    /// providers leave their payment channel disabled.
    pub fn from_config(pool: DbPool, config: AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.provider_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let card = config.stripe.clone().map(|stripe| {
            Arc::new(StripeClient::new(
                stripe,
                config.webhook_tolerance_secs,
                http.clone(),
            )) as Arc<dyn PaymentProvider>
        });
        let wallet = config.paypal.clone().map(|paypal| {
            Arc::new(PaypalClient::new(paypal, http.clone())) as Arc<dyn PaymentProvider>
        });
        if card.is_none() {
            tracing::warn!("STRIPE_SECRET_KEY not set, card payments disabled");
        }
        if wallet.is_none() {
            tracing::warn!("PayPal credentials not set, wallet payments disabled");
        }

        let notifier = notify::from_config(http, &config.mail);

        Ok(Self {
            orm: db::orm_from_pool(&pool),
            pool,
            config: Arc::new(config),
            providers: Providers::new(card, wallet),
            notifier,
        })
    }
}
