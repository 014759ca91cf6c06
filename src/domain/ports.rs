use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::action::Action;
use super::event::{ProviderEvent, RechargeOutcome, SubscriptionProbe, TransactionProbe};
use super::product::Product;
use super::subscription::Subscription;
use super::transaction::Transaction;
use crate::error::Result;

/// Inputs to `ProviderAdapter::prepare_purchase_data`.
#[derive(Debug, Clone)]
pub struct PreparePurchase {
    pub product: Product,
    pub user_id: String,
    pub payment_expires_at: DateTime<Utc>,
}

/// Inputs to `ProviderAdapter::prepare_subscription_data`.
#[derive(Debug, Clone)]
pub struct PrepareSubscription {
    pub product: Product,
    pub user_id: String,
    pub starts_at: DateTime<Utc>,
    pub payment_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PreparedPurchaseData {
    /// Opaque payload the caller forwards to the provider client.
    pub response: Value,
    pub transaction_id: String,
}

#[derive(Debug, Clone)]
pub struct PreparedSubscriptionData {
    pub response: Value,
    pub transaction_id: String,
    /// Names the recurring contract at the provider.
    pub original_transaction_id: String,
    /// Period actually granted; falls back to the product duration.
    pub duration: Option<Duration>,
}

/// What the engine hands an adapter when acting on an existing
/// subscription: enough to address the contract at the provider.
#[derive(Debug, Clone)]
pub struct OriginalTransactionContext {
    pub original_transaction_id: String,
    pub user_id: String,
    pub product_id: String,
    /// Raw provider response of the initiating transaction; most providers
    /// want their own receipt handed back.
    pub raw: Value,
}

/// Engine-facing wrapper around one payment back-end.
///
/// Adapters are not trusted to be well-behaved; every result is validated
/// against the engine's own state before it is applied.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Name under which the adapter is registered. Part of every aggregate
    /// identity this adapter produces.
    fn name(&self) -> &str;

    /// Resolves a product descriptor, or fails with `unknown-product`.
    async fn require_product(&self, product_id: &str) -> Result<Product>;

    async fn prepare_purchase_data(
        &self,
        request: &PreparePurchase,
    ) -> Result<PreparedPurchaseData>;

    async fn prepare_subscription_data(
        &self,
        request: &PrepareSubscription,
    ) -> Result<PreparedSubscriptionData>;

    /// Parses a provider callback into a discriminated event, or fails
    /// with `unrecognized-event`.
    fn parse_callback(&self, payload: &Value) -> Result<ProviderEvent>;

    async fn query_transaction_status(&self, transaction_id: &str) -> Result<TransactionProbe>;

    async fn query_subscription_status(
        &self,
        original_transaction_id: &str,
    ) -> Result<SubscriptionProbe>;

    /// One renewal charge attempt. `attempt` carries the failure count so
    /// providers can apply their own backoff or grace semantics.
    async fn recharge_subscription(
        &self,
        context: &OriginalTransactionContext,
        attempt: u32,
    ) -> Result<RechargeOutcome>;

    /// Capability flag; adapters without it make plan change fail loudly
    /// instead of leaving the superseded contract charging.
    fn supports_cancel_subscription(&self) -> bool {
        false
    }

    async fn cancel_subscription(&self, context: &OriginalTransactionContext) -> Result<bool>;
}

pub type ProviderAdapterArc = Arc<dyn ProviderAdapter>;

/// Durable storage of transactions, subscriptions and actions.
///
/// Mutations are atomic per aggregate. Updates are compare-and-swap on the
/// record's `version`: implementations fail with `conflict` when the stored
/// version differs, and bump it by one on success.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_transaction(
        &self,
        provider: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>>;

    /// Fails with `duplicate-aggregate` when the identity exists.
    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()>;

    /// CAS update; returns the stored record with its bumped version.
    async fn update_transaction(&self, transaction: &Transaction) -> Result<Transaction>;

    /// Non-terminal transactions, optionally only those whose payment
    /// window has closed.
    async fn list_pending_transactions(
        &self,
        provider: &str,
        expiring_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>>;

    async fn list_transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>>;

    async fn find_subscription(
        &self,
        provider: &str,
        original_transaction_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn update_subscription(&self, subscription: &Subscription) -> Result<Subscription>;

    /// Confirmed, renewal-enabled, non-canceled subscriptions whose
    /// remaining coverage is at most `renewal_before`.
    async fn list_subscriptions_due_for_renewal(
        &self,
        provider: &str,
        now: DateTime<Utc>,
        renewal_before: Duration,
    ) -> Result<Vec<Subscription>>;

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>>;

    /// Every subscription of the user in a product group, any status;
    /// callers filter by status themselves.
    async fn list_subscriptions_in_group(
        &self,
        user_id: &str,
        group: &str,
    ) -> Result<Vec<Subscription>>;

    /// Confirmed subscriptions that never received their `subscribed`
    /// linkage and are not canceled.
    async fn list_subscriptions_missing_linkage(&self, provider: &str)
    -> Result<Vec<Subscription>>;

    async fn insert_action(&self, action: &Action) -> Result<()>;

    async fn update_action(&self, action: &Action) -> Result<Action>;

    async fn list_pending_actions(&self, provider: &str) -> Result<Vec<Action>>;
}

pub type RepositoryArc = Arc<dyn Repository>;
