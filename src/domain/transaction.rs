use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::product::ProductKind;
use crate::error::{EngineError, Result};

pub const TRANSACTION_SCHEMA_VERSION: u32 = 1;

/// Derived lifecycle state of a payment attempt.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Canceled,
}

/// Whether applying a transition changed anything.
///
/// `Redundant` means the record was already in the target state; callers
/// decide whether that is benign (a redundant poll) or a rejected replay
/// (a duplicated callback).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Transition {
    Applied,
    Redundant,
}

/// A single payment attempt at a provider.
///
/// Identity is `(provider, transaction_id)`. `completed_at` and
/// `canceled_at` are mutually exclusive; once either is set the record is
/// terminal and immutable.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub provider: String,
    pub transaction_id: String,
    pub user_id: String,
    pub product_id: String,
    pub kind: ProductKind,
    pub created_at: DateTime<Utc>,
    /// When the entitlement the payment buys begins.
    pub starts_at: DateTime<Utc>,
    /// Deadline for out-of-band confirmation; after this the reconciler
    /// polls the provider and cancels unconfirmed attempts.
    pub payment_expires_at: DateTime<Utc>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Entitlement period bought by this transaction. Subscriptions only.
    #[serde(default, with = "super::duration_secs_opt")]
    pub duration: Option<Duration>,
    /// Names the subscription this transaction belongs to, if any.
    pub original_transaction_id: Option<String>,
    /// Opaque provider response captured at prepare time.
    pub raw: Value,
    pub version: u64,
    pub schema_version: u32,
}

impl Transaction {
    pub fn status(&self) -> TransactionStatus {
        if self.completed_at.is_some() {
            TransactionStatus::Completed
        } else if self.canceled_at.is_some() {
            TransactionStatus::Canceled
        } else {
            TransactionStatus::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status() != TransactionStatus::Pending
    }

    /// Marks the payment confirmed.
    ///
    /// `completed_at` is clamped to `purchased_at` so the record never
    /// claims completion before purchase. Confirming an already-completed
    /// transaction is `Redundant`; confirming a canceled one is a
    /// conflicting terminal transition.
    pub fn confirm(
        &mut self,
        purchased_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Result<Transition> {
        match self.status() {
            TransactionStatus::Pending => {
                self.purchased_at = Some(purchased_at);
                self.completed_at = Some(completed_at.max(purchased_at));
                Ok(Transition::Applied)
            }
            TransactionStatus::Completed => Ok(Transition::Redundant),
            TransactionStatus::Canceled => Err(EngineError::ConflictingTerminalTransition {
                id: self.transaction_id.clone(),
                detail: "cannot complete a canceled transaction".to_string(),
            }),
        }
    }

    /// Marks the payment attempt canceled.
    pub fn cancel(&mut self, canceled_at: DateTime<Utc>) -> Result<Transition> {
        match self.status() {
            TransactionStatus::Pending => {
                self.canceled_at = Some(canceled_at);
                Ok(Transition::Applied)
            }
            TransactionStatus::Canceled => Ok(Transition::Redundant),
            TransactionStatus::Completed => Err(EngineError::ConflictingTerminalTransition {
                id: self.transaction_id.clone(),
                detail: "cannot cancel a completed transaction".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Transaction {
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Transaction {
            provider: "mockpay".to_string(),
            transaction_id: "tx-1".to_string(),
            user_id: "user-1".to_string(),
            product_id: "plan-monthly".to_string(),
            kind: ProductKind::Subscription,
            created_at: created,
            starts_at: created,
            payment_expires_at: created + Duration::minutes(15),
            purchased_at: None,
            completed_at: None,
            canceled_at: None,
            duration: Some(Duration::days(30)),
            original_transaction_id: Some("orig-1".to_string()),
            raw: Value::Null,
            version: 0,
            schema_version: TRANSACTION_SCHEMA_VERSION,
        }
    }

    #[test]
    fn test_status_derivation() {
        let mut tx = pending();
        assert_eq!(tx.status(), TransactionStatus::Pending);

        let at = tx.created_at + Duration::minutes(1);
        tx.confirm(at, at).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Completed);
    }

    #[test]
    fn test_confirm_clamps_completed_at() {
        let mut tx = pending();
        let purchased = tx.created_at + Duration::minutes(5);
        // Completion reported earlier than the purchase instant.
        tx.confirm(purchased, tx.created_at).unwrap();
        assert_eq!(tx.completed_at, Some(purchased));
        assert!(tx.purchased_at.unwrap() <= tx.completed_at.unwrap());
    }

    #[test]
    fn test_replayed_confirm_is_redundant() {
        let mut tx = pending();
        let at = tx.created_at + Duration::minutes(1);
        assert_eq!(tx.confirm(at, at).unwrap(), Transition::Applied);
        assert_eq!(tx.confirm(at, at).unwrap(), Transition::Redundant);
    }

    #[test]
    fn test_terminal_states_are_exclusive() {
        let mut tx = pending();
        let at = tx.created_at + Duration::minutes(1);
        tx.confirm(at, at).unwrap();

        assert!(matches!(
            tx.cancel(at),
            Err(EngineError::ConflictingTerminalTransition { .. })
        ));
        assert_eq!(tx.canceled_at, None);

        let mut tx = pending();
        tx.cancel(at).unwrap();
        assert!(matches!(
            tx.confirm(at, at),
            Err(EngineError::ConflictingTerminalTransition { .. })
        ));
        assert_eq!(tx.completed_at, None);
    }
}
