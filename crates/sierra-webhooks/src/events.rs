//! Delivery lifecycle notifications over a tokio broadcast channel.

use serde::{Deserialize, Serialize};
use sierra_core::{AttemptId, DestinationId, OrganizationId};
use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

/// Emitted when a delivery completes or scheduling is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryNotification {
    WebhookSuccess {
        attempt_id: AttemptId,
        destination_id: DestinationId,
        organization_id: OrganizationId,
        attempt_number: u32,
        duration_ms: u64,
    },
    WebhookFailed {
        attempt_id: AttemptId,
        destination_id: DestinationId,
        organization_id: OrganizationId,
        total_attempts: u32,
        final_error: String,
    },
    RateLimited {
        organization_id: OrganizationId,
        destination_id: DestinationId,
    },
}

impl DeliveryNotification {
    /// Wire name of the notification.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::WebhookSuccess { .. } => "webhook_success",
            Self::WebhookFailed { .. } => "webhook_failed",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    #[must_use]
    pub fn organization_id(&self) -> OrganizationId {
        match self {
            Self::WebhookSuccess {
                organization_id, ..
            }
            | Self::WebhookFailed {
                organization_id, ..
            }
            | Self::RateLimited {
                organization_id, ..
            } => *organization_id,
        }
    }
}

/// Fan-out of delivery notifications. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeliveryNotifier {
    sender: broadcast::Sender<DeliveryNotification>,
}

impl DeliveryNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn notify(&self, notification: DeliveryNotification) {
        if self.sender.send(notification).is_err() {
            tracing::trace!(
                target: "webhook_delivery",
                "No notification subscribers"
            );
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryNotification> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for DeliveryNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}
