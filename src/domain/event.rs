use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Provider-initiated event, parsed from a callback payload by the
/// provider's adapter.
///
/// Tagged on the wire by event name (`payment-confirmed`, ...).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderEvent {
    PaymentConfirmed {
        transaction_id: String,
        purchased_at: DateTime<Utc>,
    },
    PaymentCanceled {
        transaction_id: String,
        canceled_at: DateTime<Utc>,
    },
    /// Out-of-band linkage: the provider acknowledges the recurring
    /// contract named by `original_transaction_id`.
    Subscribed {
        original_transaction_id: String,
        subscribed_at: DateTime<Utc>,
    },
    SubscriptionRenewal {
        original_transaction_id: String,
        transaction_id: String,
        purchased_at: DateTime<Utc>,
        #[serde(with = "super::duration_secs")]
        duration: Duration,
    },
    SubscriptionCanceled {
        original_transaction_id: String,
        canceled_at: DateTime<Utc>,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Result of polling a transaction at the provider.
#[derive(Debug, PartialEq, Clone)]
pub enum TransactionProbe {
    Success { purchased_at: DateTime<Utc> },
    Canceled { canceled_at: DateTime<Utc> },
}

/// Result of polling a subscription contract at the provider.
#[derive(Debug, PartialEq, Clone)]
pub enum SubscriptionProbe {
    Subscribed { subscribed_at: DateTime<Utc> },
    Canceled { canceled_at: DateTime<Utc> },
}

/// Outcome of one renewal charge attempt.
#[derive(Debug, PartialEq, Clone)]
pub enum RechargeOutcome {
    Renewal {
        transaction_id: String,
        purchased_at: DateTime<Utc>,
        duration: Duration,
    },
    /// Recoverable; the subscription stays active and the attempt counter
    /// carries to the next pass.
    Failed {
        failed_at: DateTime<Utc>,
        reason: String,
    },
    /// Terminal at the provider.
    Canceled {
        canceled_at: DateTime<Utc>,
        reason: Option<String>,
    },
}
