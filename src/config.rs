use std::{env, time::Duration};

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
}

/// Process-wide settings, read once at startup and shared through `AppState`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub frontend_url: String,
    pub stripe: Option<StripeConfig>,
    pub paypal: Option<PaypalConfig>,
    pub mail: MailConfig,
    pub provider_timeout: Duration,
    pub shipping_charge: i64,
    pub webhook_tolerance_secs: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET is not set"))?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_or("APP_PORT", 3000);
        let frontend_url = env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .trim_end_matches('/')
            .to_string();

        let stripe = match env::var("STRIPE_SECRET_KEY").ok().filter(|k| !k.is_empty()) {
            Some(secret_key) => Some(StripeConfig {
                secret_key,
                webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
                    anyhow::anyhow!("STRIPE_WEBHOOK_SECRET is required with STRIPE_SECRET_KEY")
                })?,
                api_base: env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            }),
            None => None,
        };

        let paypal = match (
            env::var("PAYPAL_CLIENT_ID").ok().filter(|v| !v.is_empty()),
            env::var("PAYPAL_CLIENT_SECRET").ok().filter(|v| !v.is_empty()),
        ) {
            (Some(client_id), Some(client_secret)) => Some(PaypalConfig {
                client_id,
                client_secret,
                webhook_id: env::var("PAYPAL_WEBHOOK_ID").map_err(|_| {
                    anyhow::anyhow!("PAYPAL_WEBHOOK_ID is required with PayPal credentials")
                })?,
                api_base: env::var("PAYPAL_API_BASE")
                    .unwrap_or_else(|_| "https://api-m.sandbox.paypal.com".to_string()),
            }),
            _ => None,
        };

        let mail = MailConfig {
            api_url: env::var("MAIL_API_URL").ok().filter(|v| !v.is_empty()),
            api_key: env::var("MAIL_API_KEY").ok().filter(|v| !v.is_empty()),
            from: env::var("MAIL_FROM").unwrap_or_else(|_| "no-reply@localhost".to_string()),
        };

        Ok(Self {
            database_url,
            host,
            port,
            jwt_secret,
            frontend_url,
            stripe,
            paypal,
            mail,
            provider_timeout: Duration::from_secs(parse_or("PROVIDER_TIMEOUT_SECS", 15)),
            shipping_charge: parse_or::<i64>("SHIPPING_CHARGE", 0).max(0),
            webhook_tolerance_secs: parse_or("WEBHOOK_TOLERANCE_SECS", 300),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
