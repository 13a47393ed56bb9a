//! Outbound settlement events
//!
//! The state machine publishes every transition to an event channel instead
//! of calling notifiers inline; webhook delivery (or any other fan-out)
//! consumes the receiving end. Publishing is best-effort: a dropped receiver
//! downgrades to a warning and never rolls back settlement.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Dispute, Payment};

/// Everything the marketplace is told about a payment's life
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    PaymentCreated { payment: Payment },
    PaymentEscrowed { payment: Payment },
    PaymentReleased { payment: Payment },
    PaymentRefunded { payment: Payment },
    DisputeOpened { dispute: Dispute },
    DisputeResolved { dispute: Dispute },
    DisputeWindowExpired { payment_id: Uuid, deadline: DateTime<Utc> },
}

/// Sending half of the settlement event channel
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SettlementEvent>,
}

impl EventSink {
    /// Create a sink and the receiver a notifier should drain
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SettlementEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event; failures never propagate into settlement
    pub fn publish(&self, event: SettlementEvent) {
        if self.tx.send(event).is_err() {
            warn!("Settlement event dropped: no active subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::models::EscrowMode;

    #[tokio::test]
    async fn events_reach_the_subscriber_in_order() {
        let (sink, mut rx) = EventSink::channel();
        let payment = Payment::new(
            "svc".into(),
            "b".into(),
            "s".into(),
            100,
            2,
            Currency::Bsv,
            EscrowMode::Custodial,
            30,
        );

        sink.publish(SettlementEvent::PaymentCreated {
            payment: payment.clone(),
        });
        sink.publish(SettlementEvent::PaymentEscrowed { payment });

        assert!(matches!(
            rx.recv().await,
            Some(SettlementEvent::PaymentCreated { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SettlementEvent::PaymentEscrowed { .. })
        ));
    }

    #[tokio::test]
    async fn publish_survives_a_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        let payment = Payment::new(
            "svc".into(),
            "b".into(),
            "s".into(),
            100,
            2,
            Currency::Mnee,
            EscrowMode::Custodial,
            30,
        );
        // Must not panic or error
        sink.publish(SettlementEvent::PaymentCreated { payment });
    }
}
