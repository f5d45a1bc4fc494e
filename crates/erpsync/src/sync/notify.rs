//! Downstream notifications
//!
//! When a sync first sees a record that still owes money, the portal wants
//! to tell someone (dunning email, CRM task). This is strictly
//! fire-and-forget: a notification failure must never fail the sync run.

use anyhow::Result;
use serde::Serialize;

use crate::models::{RecordId, StreamKind};

/// A "first seen, still owing" event
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub stream: StreamKind,
    pub record_id: RecordId,
    pub tran_id: String,
    pub customer_id: String,
    pub amount_remaining: f64,
}

/// Sink for sync-emitted events
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Default notifier: just logs the event
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        log::info!(
            "[NOTIFY] first-seen open balance: {} {} ({}) owes {:.2}",
            event.stream,
            event.tran_id,
            event.record_id,
            event.amount_remaining,
        );
        Ok(())
    }
}

/// POSTs events as JSON to a webhook endpoint
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        ureq::post(&self.url).send_json(event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_notifier_never_fails() {
        let event = NotificationEvent {
            stream: StreamKind::Invoice,
            record_id: RecordId::new("100"),
            tran_id: "INV-100".to_string(),
            customer_id: "7".to_string(),
            amount_remaining: 250.0,
        };
        assert!(LogNotifier.notify(&event).is_ok());
    }

    #[test]
    fn test_event_serializes() {
        let event = NotificationEvent {
            stream: StreamKind::SalesOrder,
            record_id: RecordId::new("5"),
            tran_id: "SO-5".to_string(),
            customer_id: "7".to_string(),
            amount_remaining: 10.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stream"], "sales_order");
        assert_eq!(json["record_id"], "5");
    }
}
