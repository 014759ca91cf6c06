use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::transaction::{Transaction, TransactionStatus, Transition};
use crate::error::{EngineError, Result};

pub const SUBSCRIPTION_SCHEMA_VERSION: u32 = 1;

/// Derived lifecycle state of a recurring entitlement.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionStatus {
    /// No confirmed transaction yet.
    Pending,
    /// Confirmed, but coverage has not started.
    NotStart,
    Active,
    /// Coverage lapsed without a cancellation.
    Expired,
    Canceled,
}

/// A recurring entitlement, identified by `(provider,
/// original_transaction_id)`.
///
/// `transactions` holds transaction ids in order; the first is the
/// initiating one, the rest are renewals. `expires_at` is materialized as
/// `starts_at` plus the summed durations of completed transactions and is
/// recomputed on every write that touches the transaction list.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Subscription {
    pub provider: String,
    pub original_transaction_id: String,
    pub user_id: String,
    /// Current plan. Changes only by superseding the whole subscription.
    pub product_id: String,
    pub product_group: String,
    pub transactions: Vec<String>,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Set by the provider's `subscribed` linkage event (or the equivalent
    /// poll). Not required for the subscription to become active.
    pub renewal_enabled: bool,
    /// Last recharge failure, cleared by a successful renewal.
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Attempt counter handed to the adapter on each recharge.
    pub renewal_attempts: u32,
    pub version: u64,
    pub schema_version: u32,
}

impl Subscription {
    /// Whether any transaction has been confirmed yet.
    ///
    /// Confirmed coverage always extends `expires_at` past `starts_at`, so
    /// the window itself carries this bit.
    pub fn is_confirmed(&self) -> bool {
        self.expires_at > self.starts_at
    }

    pub fn status(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        if self.canceled_at.is_some() {
            SubscriptionStatus::Canceled
        } else if !self.is_confirmed() {
            SubscriptionStatus::Pending
        } else if now < self.starts_at {
            SubscriptionStatus::NotStart
        } else if now < self.expires_at {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Expired
        }
    }

    pub fn initiating_transaction_id(&self) -> Option<&str> {
        self.transactions.first().map(String::as_str)
    }

    /// Recomputes `expires_at` from the records backing `transactions`.
    ///
    /// Only completed transactions with a duration count toward coverage.
    pub fn recompute_window(&mut self, transactions: &[Transaction]) {
        let covered = transactions
            .iter()
            .filter(|tx| tx.status() == TransactionStatus::Completed)
            .filter_map(|tx| tx.duration)
            .fold(chrono::Duration::zero(), |acc, d| acc + d);
        self.expires_at = self.starts_at + covered;
    }

    /// Appends a transaction id, ignoring replays of one already linked.
    pub fn link_transaction(&mut self, transaction_id: &str) -> Transition {
        if self.transactions.iter().any(|id| id == transaction_id) {
            Transition::Redundant
        } else {
            self.transactions.push(transaction_id.to_string());
            Transition::Applied
        }
    }

    /// Applies the provider's `subscribed` linkage: renewals are now on.
    pub fn bind_renewal(&mut self) -> Result<Transition> {
        if self.canceled_at.is_some() {
            return Err(EngineError::ConflictingTerminalTransition {
                id: self.original_transaction_id.clone(),
                detail: "cannot enable renewal on a canceled subscription".to_string(),
            });
        }
        if self.renewal_enabled {
            Ok(Transition::Redundant)
        } else {
            self.renewal_enabled = true;
            Ok(Transition::Applied)
        }
    }

    /// Cancels the subscription, keeping already-paid coverage intact.
    pub fn cancel(&mut self, canceled_at: DateTime<Utc>) -> Transition {
        if self.canceled_at.is_some() {
            return Transition::Redundant;
        }
        self.canceled_at = Some(canceled_at);
        self.renewal_enabled = false;
        Transition::Applied
    }

    pub fn record_recharge_failure(&mut self, failed_at: DateTime<Utc>) {
        self.last_failed_at = Some(failed_at);
        self.renewal_attempts += 1;
    }

    pub fn record_recharge_success(&mut self) {
        self.last_failed_at = None;
        self.renewal_attempts = 0;
    }
}
