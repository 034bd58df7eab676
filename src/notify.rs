//! Outbound e-mail notifications.
//!
//! Delivery happens off the request path: handlers call [`dispatch`] after
//! their transaction commits and never wait on the mail service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::{config::MailConfig, providers::{format_amount, format_minor_units}};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedLine {
    pub label: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Sent to the store admin when a customer places an order.
    OrderPlaced {
        to: Recipient,
        customer: Recipient,
        order_id: Uuid,
        lines: Vec<OrderedLine>,
        final_amount: i64,
        shipping_date: Option<DateTime<Utc>>,
    },
    /// Sent to the customer once the provider confirms the payment.
    PaymentConfirmed {
        to: Recipient,
        order_id: Uuid,
        amount: i64,
        currency: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OrderPlaced { .. } => "order_placed",
            Notification::PaymentConfirmed { .. } => "payment_confirmed",
        }
    }

    pub fn recipient(&self) -> &Recipient {
        match self {
            Notification::OrderPlaced { to, .. } | Notification::PaymentConfirmed { to, .. } => to,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Notification::OrderPlaced { order_id, .. } => {
                format!("New Order Received - Order #{order_id}")
            }
            Notification::PaymentConfirmed { order_id, .. } => {
                format!("Payment Confirmation - Order #{order_id}")
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::OrderPlaced {
                to,
                customer,
                order_id,
                lines,
                final_amount,
                shipping_date,
            } => {
                let mut body = format!(
                    "Hello {},\n\nPlaced by: {} ({})\nOrder ID: {order_id}\n\nOrdered items:\n",
                    to.name, customer.name, customer.email
                );
                for line in lines {
                    body.push_str(&format!("- {}: {} unit(s)\n", line.label, line.quantity));
                }
                body.push_str(&format!(
                    "\nTotal payment: {}\n",
                    format_minor_units(*final_amount)
                ));
                if let Some(date) = shipping_date {
                    body.push_str(&format!("Shipping date: {}\n", date.format("%Y-%m-%d")));
                }
                body
            }
            Notification::PaymentConfirmed {
                to,
                order_id,
                amount,
                currency,
            } => format!(
                "Hello {},\n\nPayment successful for order #{order_id}.\nAmount: {} {}\n",
                to.name,
                format_amount(*amount, currency),
                currency.to_uppercase()
            ),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Posts messages to an HTTP mail API as JSON.
pub struct HttpMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(http: reqwest::Client, api_url: String, config: &MailConfig) -> Self {
        Self {
            http,
            api_url,
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        }
    }
}

#[async_trait]
impl Notifier for HttpMailer {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        let payload = json!({
            "from": self.from,
            "to": notification.recipient().email,
            "subject": notification.subject(),
            "text": notification.body(),
        });

        let mut request = self.http.post(&self.api_url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("mail api responded with {}", response.status());
        }
        Ok(())
    }
}

/// Writes notifications to the log. Used when no mail API is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> anyhow::Result<()> {
        tracing::info!(
            kind = notification.kind(),
            to = %notification.recipient().email,
            subject = %notification.subject(),
            "notification"
        );
        Ok(())
    }
}

/// Build the notifier selected by configuration.
pub fn from_config(http: reqwest::Client, config: &MailConfig) -> Arc<dyn Notifier> {
    match &config.api_url {
        Some(url) => Arc::new(HttpMailer::new(http, url.clone(), config)),
        None => Arc::new(LogNotifier),
    }
}

/// Fire-and-forget delivery. Failures are logged and never reach the caller.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let kind = notification.kind();
        if let Err(err) = notifier.send(notification).await {
            tracing::warn!(error = %err, kind, "notification delivery failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Recipient {
        Recipient {
            email: "admin@example.com".into(),
            name: "Admin".into(),
        }
    }

    #[test]
    fn order_placed_lists_items_and_total() {
        let order_id = Uuid::new_v4();
        let message = Notification::OrderPlaced {
            to: admin(),
            customer: Recipient {
                email: "jane@example.com".into(),
                name: "Jane".into(),
            },
            order_id,
            lines: vec![OrderedLine {
                label: "Tee - red/M".into(),
                quantity: 2,
            }],
            final_amount: 20000,
            shipping_date: None,
        };

        assert_eq!(
            message.subject(),
            format!("New Order Received - Order #{order_id}")
        );
        let body = message.body();
        assert!(body.contains("Jane (jane@example.com)"));
        assert!(body.contains("- Tee - red/M: 2 unit(s)"));
        assert!(body.contains("Total payment: 200.00"));
        assert!(!body.contains("Shipping date"));
    }

    #[test]
    fn payment_confirmed_formats_amount() {
        let message = Notification::PaymentConfirmed {
            to: admin(),
            order_id: Uuid::nil(),
            amount: 1999,
            currency: "usd".into(),
        };
        assert_eq!(message.kind(), "payment_confirmed");
        assert!(message.body().contains("Amount: 19.99 USD"));
    }

    #[tokio::test]
    async fn dispatch_swallows_delivery_errors() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let mut notifier = MockNotifier::new();
        notifier.expect_send().times(1).returning(move |_| {
            if let Some(tx) = tx.lock().ok().and_then(|mut guard| guard.take()) {
                let _ = tx.send(());
            }
            Err(anyhow::anyhow!("smtp down"))
        });

        dispatch(
            Arc::new(notifier),
            Notification::PaymentConfirmed {
                to: admin(),
                order_id: Uuid::nil(),
                amount: 100,
                currency: "usd".into(),
            },
        );

        rx.await.expect("notifier was called");
    }
}
