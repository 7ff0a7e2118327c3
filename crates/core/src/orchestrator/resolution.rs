use tracing::{debug, warn};

use crate::broker::AckController;
use crate::metrics;

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// All records delivered, artifact deleted.
    Processed,
    /// The processor failed. Artifact kept.
    ProcessingFailed,
    /// The gateway refused a batch. Artifact kept.
    DeliveryFailed,
    /// No processor consumes the content type.
    Unsupported,
    /// Body or headers could not be decoded.
    Undecodable,
    /// The processor could not be started; the broker should redeliver.
    Requeued,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::ProcessingFailed => "processing_failed",
            Self::DeliveryFailed => "delivery_failed",
            Self::Unsupported => "unsupported",
            Self::Undecodable => "undecodable",
            Self::Requeued => "requeued",
        }
    }

    /// Only `Requeued` is negatively acknowledged.
    pub fn is_ack(&self) -> bool {
        !matches!(self, Self::Requeued)
    }
}

/// Settles a message exactly once. Later resolutions are ignored.
#[derive(Debug)]
pub struct MessageResolution {
    controller: Option<AckController>,
    outcome: Option<MessageOutcome>,
}

impl MessageResolution {
    pub fn new(controller: AckController) -> Self {
        Self {
            controller: Some(controller),
            outcome: None,
        }
    }

    /// Acks (or nacks with requeue) the message. Returns false if it was
    /// already settled.
    pub async fn resolve(&mut self, outcome: MessageOutcome) -> bool {
        let Some(controller) = self.controller.take() else {
            debug!(
                outcome = outcome.as_str(),
                settled = self.outcome.map(|o| o.as_str()),
                "Message already settled"
            );
            return false;
        };

        self.outcome = Some(outcome);
        metrics::MESSAGES_HANDLED
            .with_label_values(&[outcome.as_str()])
            .inc();

        if outcome.is_ack() {
            controller.ack().await;
        } else {
            controller.nack(true).await;
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.controller.is_none()
    }

    pub fn outcome(&self) -> Option<MessageOutcome> {
        self.outcome
    }
}

impl Drop for MessageResolution {
    fn drop(&mut self) {
        if let Some(controller) = &self.controller {
            warn!(
                delivery_tag = controller.delivery_tag(),
                "Message dropped without being settled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acknowledger, BrokerError};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Acknowledger for Calls {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push("ack".into());
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
            self.0.lock().unwrap().push(format!("nack:{}", requeue));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resolves_once() {
        let calls = Calls::default();
        let mut resolution = MessageResolution::new(AckController::new(7, calls.clone()));

        assert!(!resolution.is_resolved());
        assert!(resolution.resolve(MessageOutcome::DeliveryFailed).await);
        assert!(!resolution.resolve(MessageOutcome::Processed).await);
        assert!(!resolution.resolve(MessageOutcome::Requeued).await);

        assert!(resolution.is_resolved());
        assert_eq!(resolution.outcome(), Some(MessageOutcome::DeliveryFailed));
        assert_eq!(*calls.0.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_requeued_nacks_with_requeue() {
        let calls = Calls::default();
        let mut resolution = MessageResolution::new(AckController::new(1, calls.clone()));

        resolution.resolve(MessageOutcome::Requeued).await;
        assert_eq!(*calls.0.lock().unwrap(), vec!["nack:true"]);
    }

    #[test]
    fn test_only_requeued_is_negative() {
        for outcome in [
            MessageOutcome::Processed,
            MessageOutcome::ProcessingFailed,
            MessageOutcome::DeliveryFailed,
            MessageOutcome::Unsupported,
            MessageOutcome::Undecodable,
        ] {
            assert!(outcome.is_ack(), "{} should ack", outcome.as_str());
        }
        assert!(!MessageOutcome::Requeued.is_ack());
    }
}
