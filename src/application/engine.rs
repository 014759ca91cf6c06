use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::ClockArc;
use crate::config::EngineConfig;
use crate::domain::action::{Action, ActionKind};
use crate::domain::event::ProviderEvent;
use crate::domain::ports::{
    OriginalTransactionContext, PreparePurchase, PrepareSubscription, RepositoryArc,
};
use crate::domain::product::ProductKind;
use crate::domain::subscription::{SUBSCRIPTION_SCHEMA_VERSION, Subscription, SubscriptionStatus};
use crate::domain::transaction::{
    TRANSACTION_SCHEMA_VERSION, Transaction, TransactionStatus, Transition,
};
use crate::domain::user::UserView;
use crate::error::{AggregateKind, EngineError, Result};

use super::reconcile::Leases;
use super::registry::ProviderRegistry;

/// Who is asking for a transition.
///
/// The same transition applied twice is rejected loudly when it arrives via
/// callback (double delivery) or an operator (mistake), but tolerated when
/// the engine itself re-observes it while polling.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum TransitionOrigin {
    Callback,
    Poll,
    Operator,
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub product_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub product_id: String,
    pub user_id: String,
}

/// Result of preparing a one-shot purchase: the opaque provider payload to
/// forward to the client, plus a snapshot of the pending transaction.
#[derive(Debug, Clone)]
pub struct PreparedPurchase {
    pub response: Value,
    pub transaction: Transaction,
}

/// Result of preparing a subscription. For an idempotent same-plan prepare
/// the response is `Null` and the snapshots are the existing records.
#[derive(Debug, Clone)]
pub struct PreparedSubscription {
    pub response: Value,
    pub subscription: Subscription,
    pub transaction: Transaction,
}

/// The payments orchestration engine.
///
/// Coordinates the transaction and subscription state machines over a
/// shared repository. Snapshots returned from operations are stale-tolerant
/// views; `transaction()` / `subscription()` re-read from the store.
pub struct PaymentEngine {
    pub(crate) registry: ProviderRegistry,
    pub(crate) repository: RepositoryArc,
    pub(crate) clock: ClockArc,
    pub(crate) config: EngineConfig,
    pub(crate) leases: Leases,
}

impl PaymentEngine {
    pub fn new(
        registry: ProviderRegistry,
        repository: RepositoryArc,
        clock: ClockArc,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            repository,
            clock,
            config,
            leases: Leases::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Prepares a one-shot purchase: asks the adapter for payment data and
    /// persists the pending transaction.
    pub async fn prepare_purchase(
        &self,
        provider: &str,
        request: &PurchaseRequest,
        cancel: &CancellationToken,
    ) -> Result<PreparedPurchase> {
        self.ensure_live(cancel)?;
        let adapter = self.registry.adapter(provider)?;
        let product = self.registry.product(provider, &request.product_id).await?;
        product.require_purchase()?;

        let now = self.clock.now();
        let payment_expires_at = now + self.config.purchase_expires_after;
        let data = adapter
            .prepare_purchase_data(&PreparePurchase {
                product: product.clone(),
                user_id: request.user_id.clone(),
                payment_expires_at,
            })
            .await?;

        let transaction = Transaction {
            provider: provider.to_string(),
            transaction_id: data.transaction_id,
            user_id: request.user_id.clone(),
            product_id: product.id.clone(),
            kind: ProductKind::Purchase,
            created_at: now,
            starts_at: now,
            payment_expires_at,
            purchased_at: None,
            completed_at: None,
            canceled_at: None,
            duration: None,
            original_transaction_id: None,
            raw: data.response.clone(),
            version: 0,
            schema_version: TRANSACTION_SCHEMA_VERSION,
        };
        self.repository.insert_transaction(&transaction).await?;
        info!(
            provider,
            transaction_id = %transaction.transaction_id,
            product_id = %transaction.product_id,
            "purchase prepared"
        );

        Ok(PreparedPurchase {
            response: data.response,
            transaction,
        })
    }

    /// Prepares a subscription.
    ///
    /// A same-plan prepare while an active or not-started subscription
    /// exists in the product group is idempotent. A different plan in the
    /// same group is a plan change: the new subscription starts where the
    /// prior one ends, and the prior one is superseded.
    pub async fn prepare_subscription(
        &self,
        provider: &str,
        request: &SubscriptionRequest,
        cancel: &CancellationToken,
    ) -> Result<PreparedSubscription> {
        self.ensure_live(cancel)?;
        let adapter = self.registry.adapter(provider)?;
        let product = self.registry.product(provider, &request.product_id).await?;
        let (product_duration, group) = product.subscription_terms()?;
        let group = group.to_string();
        let now = self.clock.now();

        let mut prior: Option<Subscription> = None;
        for sub in self
            .repository
            .list_subscriptions_in_group(&request.user_id, &group)
            .await?
        {
            if !matches!(
                sub.status(now),
                SubscriptionStatus::Active | SubscriptionStatus::NotStart
            ) {
                continue;
            }
            if sub.provider == provider && sub.product_id == product.id {
                return self.existing_subscription_handle(sub).await;
            }
            prior = Some(sub);
        }

        // Plan change needs the prior contract stopped at its provider;
        // refuse up front when the adapter cannot do that.
        if let Some(prior) = &prior {
            let prior_adapter = self.registry.adapter(&prior.provider)?;
            if !prior_adapter.supports_cancel_subscription() {
                return Err(EngineError::UnsupportedOperation {
                    provider: prior.provider.clone(),
                    operation: "cancel_subscription",
                });
            }
        }

        // Contiguous coverage: the new plan starts where the old one ends.
        let starts_at = match &prior {
            Some(prior) => prior.expires_at,
            None => now,
        };
        let payment_expires_at = now + self.config.purchase_expires_after;
        let data = adapter
            .prepare_subscription_data(&PrepareSubscription {
                product: product.clone(),
                user_id: request.user_id.clone(),
                starts_at,
                payment_expires_at,
            })
            .await?;
        let duration = data.duration.unwrap_or(product_duration);

        let transaction = Transaction {
            provider: provider.to_string(),
            transaction_id: data.transaction_id,
            user_id: request.user_id.clone(),
            product_id: product.id.clone(),
            kind: ProductKind::Subscription,
            created_at: now,
            starts_at,
            payment_expires_at,
            purchased_at: None,
            completed_at: None,
            canceled_at: None,
            duration: Some(duration),
            original_transaction_id: Some(data.original_transaction_id.clone()),
            raw: data.response.clone(),
            version: 0,
            schema_version: TRANSACTION_SCHEMA_VERSION,
        };
        let subscription = Subscription {
            provider: provider.to_string(),
            original_transaction_id: data.original_transaction_id,
            user_id: request.user_id.clone(),
            product_id: product.id.clone(),
            product_group: group,
            transactions: vec![transaction.transaction_id.clone()],
            starts_at,
            expires_at: starts_at,
            canceled_at: None,
            renewal_enabled: false,
            last_failed_at: None,
            renewal_attempts: 0,
            version: 0,
            schema_version: SUBSCRIPTION_SCHEMA_VERSION,
        };

        // New aggregate first; a crash here leaves an orphaned pending
        // record that the expiry reconciler cleans up.
        self.repository.insert_transaction(&transaction).await?;
        self.repository.insert_subscription(&subscription).await?;

        if let Some(prior) = prior {
            self.enqueue_action(
                &prior.provider,
                ActionKind::CancelAtProvider {
                    original_transaction_id: prior.original_transaction_id.clone(),
                },
            )
            .await?;
            self.cancel_subscription_record(
                &prior.provider,
                &prior.original_transaction_id,
                now,
                TransitionOrigin::Poll,
            )
            .await?;
            info!(
                provider = %prior.provider,
                original_transaction_id = %prior.original_transaction_id,
                successor = %subscription.original_transaction_id,
                "subscription superseded by plan change"
            );
        }
        info!(
            provider,
            original_transaction_id = %subscription.original_transaction_id,
            product_id = %subscription.product_id,
            "subscription prepared"
        );

        Ok(PreparedSubscription {
            response: data.response,
            subscription,
            transaction,
        })
    }

    async fn existing_subscription_handle(
        &self,
        subscription: Subscription,
    ) -> Result<PreparedSubscription> {
        let initiating =
            subscription
                .initiating_transaction_id()
                .ok_or_else(|| EngineError::NotFound {
                    kind: AggregateKind::Transaction,
                    id: format!("initiating of {}", subscription.original_transaction_id),
                })?;
        let transaction = self.require_transaction(&subscription.provider, initiating).await?;
        Ok(PreparedSubscription {
            response: Value::Null,
            subscription,
            transaction,
        })
    }

    /// Parses a provider callback and applies its transition.
    ///
    /// Returns the parsed event on success. Replays of terminal transitions
    /// fail with `CallbackRejected` and leave state unchanged.
    pub async fn handle_callback(
        &self,
        provider: &str,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<ProviderEvent> {
        self.ensure_live(cancel)?;
        let adapter = self.registry.adapter(provider)?;
        let event = adapter.parse_callback(payload)?;

        let applied = match &event {
            ProviderEvent::PaymentConfirmed {
                transaction_id,
                purchased_at,
            } => self
                .complete_transaction(
                    provider,
                    transaction_id,
                    *purchased_at,
                    TransitionOrigin::Callback,
                )
                .await
                .map(|_| ()),
            ProviderEvent::PaymentCanceled {
                transaction_id,
                canceled_at,
            } => self
                .cancel_transaction(
                    provider,
                    transaction_id,
                    *canceled_at,
                    TransitionOrigin::Callback,
                )
                .await
                .map(|_| ()),
            ProviderEvent::Subscribed {
                original_transaction_id,
                ..
            } => self
                .bind_subscription_renewal(
                    provider,
                    original_transaction_id,
                    TransitionOrigin::Callback,
                )
                .await
                .map(|_| ()),
            ProviderEvent::SubscriptionRenewal {
                original_transaction_id,
                transaction_id,
                purchased_at,
                duration,
            } => self
                .apply_renewal(
                    provider,
                    original_transaction_id,
                    transaction_id,
                    *purchased_at,
                    *duration,
                    payload.clone(),
                    TransitionOrigin::Callback,
                )
                .await
                .map(|_| ()),
            ProviderEvent::SubscriptionCanceled {
                original_transaction_id,
                canceled_at,
                ..
            } => self
                .cancel_subscription_record(
                    provider,
                    original_transaction_id,
                    *canceled_at,
                    TransitionOrigin::Callback,
                )
                .await
                .map(|_| ()),
        };

        match applied {
            Ok(()) => Ok(event),
            Err(error) => {
                warn!(provider, %error, "callback not applied");
                Err(error)
            }
        }
    }

    /// Operator-initiated cancellation. Already-paid coverage is kept; only
    /// renewals stop.
    pub async fn cancel_subscription(
        &self,
        provider: &str,
        original_transaction_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        self.ensure_live(cancel)?;
        let adapter = self.registry.adapter(provider)?;
        let stored = self
            .cancel_subscription_record(
                provider,
                original_transaction_id,
                self.clock.now(),
                TransitionOrigin::Operator,
            )
            .await?;
        if adapter.supports_cancel_subscription() {
            self.enqueue_action(
                provider,
                ActionKind::CancelAtProvider {
                    original_transaction_id: original_transaction_id.to_string(),
                },
            )
            .await?;
        }
        Ok(stored)
    }

    /// Aggregated entitlement view: completed one-shot purchases plus every
    /// non-canceled subscription. Read-only.
    pub async fn user(&self, user_id: &str) -> Result<UserView> {
        let now = self.clock.now();
        let purchase_transactions = self
            .repository
            .list_transactions_for_user(user_id)
            .await?
            .into_iter()
            .filter(|tx| {
                tx.kind == ProductKind::Purchase && tx.status() == TransactionStatus::Completed
            })
            .collect();
        let subscriptions = self
            .repository
            .list_subscriptions_for_user(user_id)
            .await?
            .into_iter()
            .filter(|sub| sub.status(now) != SubscriptionStatus::Canceled)
            .collect();
        Ok(UserView {
            user_id: user_id.to_string(),
            purchase_transactions,
            subscriptions,
        })
    }

    /// Re-reads a transaction from the store.
    pub async fn transaction(&self, provider: &str, transaction_id: &str) -> Result<Transaction> {
        self.require_transaction(provider, transaction_id).await
    }

    /// Re-reads a subscription from the store.
    pub async fn subscription(
        &self,
        provider: &str,
        original_transaction_id: &str,
    ) -> Result<Subscription> {
        self.require_subscription(provider, original_transaction_id)
            .await
    }

    pub(crate) fn ensure_live(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(EngineError::Canceled)
        } else {
            Ok(())
        }
    }

    pub(crate) async fn require_transaction(
        &self,
        provider: &str,
        transaction_id: &str,
    ) -> Result<Transaction> {
        self.repository
            .find_transaction(provider, transaction_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: AggregateKind::Transaction,
                id: transaction_id.to_string(),
            })
    }

    pub(crate) async fn require_subscription(
        &self,
        provider: &str,
        original_transaction_id: &str,
    ) -> Result<Subscription> {
        self.repository
            .find_subscription(provider, original_transaction_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: AggregateKind::Subscription,
                id: original_transaction_id.to_string(),
            })
    }

    /// Runs an additive write, retrying a bounded number of times when a
    /// concurrent writer wins the compare-and-swap.
    pub(crate) async fn with_conflict_retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            match operation().await {
                Err(EngineError::Conflict { .. })
                    if attempts < self.config.conflict_retry_limit =>
                {
                    attempts += 1;
                }
                result => return result,
            }
        }
    }

    pub(crate) async fn enqueue_action(&self, provider: &str, kind: ActionKind) -> Result<()> {
        let action = Action::new(provider, kind, self.clock.now());
        self.repository.insert_action(&action).await
    }

    /// Drives `pending → completed`, then folds the confirmation into the
    /// owning subscription.
    pub(crate) async fn complete_transaction(
        &self,
        provider: &str,
        transaction_id: &str,
        purchased_at: DateTime<Utc>,
        origin: TransitionOrigin,
    ) -> Result<Transaction> {
        let (stored, transition) = self
            .with_conflict_retry(|| {
                self.complete_transaction_once(provider, transaction_id, purchased_at, origin)
            })
            .await?;
        if transition == Transition::Applied {
            self.apply_confirmed_to_subscription(&stored).await?;
        }
        Ok(stored)
    }

    async fn complete_transaction_once(
        &self,
        provider: &str,
        transaction_id: &str,
        purchased_at: DateTime<Utc>,
        origin: TransitionOrigin,
    ) -> Result<(Transaction, Transition)> {
        let mut tx = self.require_transaction(provider, transaction_id).await?;
        match tx.confirm(purchased_at, self.clock.now())? {
            Transition::Applied => {
                let stored = self.repository.update_transaction(&tx).await?;
                info!(provider, transaction_id, "payment confirmed");
                Ok((stored, Transition::Applied))
            }
            Transition::Redundant => match origin {
                TransitionOrigin::Poll => Ok((tx, Transition::Redundant)),
                _ => Err(EngineError::CallbackRejected {
                    reason: format!("transaction {transaction_id} already completed"),
                }),
            },
        }
    }

    /// Drives `pending → canceled`, cascading to an unconfirmed owning
    /// subscription when configured to.
    pub(crate) async fn cancel_transaction(
        &self,
        provider: &str,
        transaction_id: &str,
        canceled_at: DateTime<Utc>,
        origin: TransitionOrigin,
    ) -> Result<Transaction> {
        let (stored, transition) = self
            .with_conflict_retry(|| {
                self.cancel_transaction_once(provider, transaction_id, canceled_at, origin)
            })
            .await?;
        if transition == Transition::Applied {
            self.cascade_canceled_payment(&stored, canceled_at).await?;
        }
        Ok(stored)
    }

    async fn cancel_transaction_once(
        &self,
        provider: &str,
        transaction_id: &str,
        canceled_at: DateTime<Utc>,
        origin: TransitionOrigin,
    ) -> Result<(Transaction, Transition)> {
        let mut tx = self.require_transaction(provider, transaction_id).await?;
        match tx.cancel(canceled_at)? {
            Transition::Applied => {
                let stored = self.repository.update_transaction(&tx).await?;
                info!(provider, transaction_id, "payment canceled");
                Ok((stored, Transition::Applied))
            }
            Transition::Redundant => match origin {
                TransitionOrigin::Poll => Ok((tx, Transition::Redundant)),
                _ => Err(EngineError::CallbackRejected {
                    reason: format!("transaction {transaction_id} already canceled"),
                }),
            },
        }
    }

    async fn apply_confirmed_to_subscription(&self, tx: &Transaction) -> Result<()> {
        let Some(original_id) = tx.original_transaction_id.as_deref() else {
            return Ok(());
        };
        let activated = self
            .with_conflict_retry(|| self.refresh_subscription_window(tx, original_id))
            .await?;
        if activated {
            self.enqueue_action(
                &tx.provider,
                ActionKind::SubscriptionActivated {
                    original_transaction_id: original_id.to_string(),
                    user_id: tx.user_id.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn refresh_subscription_window(
        &self,
        tx: &Transaction,
        original_id: &str,
    ) -> Result<bool> {
        let Some(mut sub) = self
            .repository
            .find_subscription(&tx.provider, original_id)
            .await?
        else {
            // Crash window between the two prepare inserts; the expiry
            // reconciler owns the orphan.
            warn!(
                provider = %tx.provider,
                original_transaction_id = %original_id,
                "confirmed transaction without a subscription record"
            );
            return Ok(false);
        };
        let was_confirmed = sub.is_confirmed();
        sub.link_transaction(&tx.transaction_id);
        let records = self.load_subscription_transactions(&sub).await?;
        sub.recompute_window(&records);
        self.repository.update_subscription(&sub).await?;
        Ok(!was_confirmed && sub.is_confirmed())
    }

    async fn cascade_canceled_payment(
        &self,
        tx: &Transaction,
        canceled_at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.config.cancel_subscription_on_expired_payment {
            return Ok(());
        }
        let Some(original_id) = tx.original_transaction_id.as_deref() else {
            return Ok(());
        };
        let provider = tx.provider.as_str();
        let transaction_id = tx.transaction_id.as_str();
        self.with_conflict_retry(|| {
            self.cancel_unconfirmed_subscription(provider, original_id, transaction_id, canceled_at)
        })
        .await
    }

    async fn cancel_unconfirmed_subscription(
        &self,
        provider: &str,
        original_id: &str,
        transaction_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut sub) = self
            .repository
            .find_subscription(provider, original_id)
            .await?
        else {
            return Ok(());
        };
        // Only the initiating payment failing voids the subscription; a
        // failed renewal attempt leaves paid coverage alone.
        if sub.initiating_transaction_id() != Some(transaction_id) || sub.is_confirmed() {
            return Ok(());
        }
        if sub.cancel(canceled_at) == Transition::Applied {
            self.repository.update_subscription(&sub).await?;
            info!(
                provider,
                original_transaction_id = %original_id,
                "subscription canceled after its initial payment expired"
            );
        }
        Ok(())
    }

    /// Applies the `subscribed` linkage: renewals on.
    pub(crate) async fn bind_subscription_renewal(
        &self,
        provider: &str,
        original_id: &str,
        origin: TransitionOrigin,
    ) -> Result<Subscription> {
        self.with_conflict_retry(|| self.bind_renewal_once(provider, original_id, origin))
            .await
    }

    async fn bind_renewal_once(
        &self,
        provider: &str,
        original_id: &str,
        origin: TransitionOrigin,
    ) -> Result<Subscription> {
        let mut sub = self.require_subscription(provider, original_id).await?;
        match sub.bind_renewal()? {
            Transition::Applied => {
                let stored = self.repository.update_subscription(&sub).await?;
                info!(provider, original_transaction_id = %original_id, "renewal linkage bound");
                Ok(stored)
            }
            Transition::Redundant => match origin {
                TransitionOrigin::Poll => Ok(sub),
                _ => Err(EngineError::CallbackRejected {
                    reason: format!("subscription {original_id} already linked"),
                }),
            },
        }
    }

    /// Appends a paid renewal period: new completed transaction, extended
    /// coverage, reset failure counter.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn apply_renewal(
        &self,
        provider: &str,
        original_id: &str,
        transaction_id: &str,
        purchased_at: DateTime<Utc>,
        duration: chrono::Duration,
        raw: Value,
        origin: TransitionOrigin,
    ) -> Result<Subscription> {
        let sub = self.require_subscription(provider, original_id).await?;
        if sub.canceled_at.is_some() {
            return Err(EngineError::ConflictingTerminalTransition {
                id: original_id.to_string(),
                detail: "renewal for a canceled subscription".to_string(),
            });
        }

        let now = self.clock.now();
        let tx = Transaction {
            provider: provider.to_string(),
            transaction_id: transaction_id.to_string(),
            user_id: sub.user_id.clone(),
            product_id: sub.product_id.clone(),
            kind: ProductKind::Subscription,
            created_at: now,
            // Coverage continues where the previous period left off.
            starts_at: sub.expires_at,
            payment_expires_at: now + self.config.purchase_expires_after,
            purchased_at: Some(purchased_at),
            completed_at: Some(now.max(purchased_at)),
            canceled_at: None,
            duration: Some(duration),
            original_transaction_id: Some(original_id.to_string()),
            raw,
            version: 0,
            schema_version: TRANSACTION_SCHEMA_VERSION,
        };
        if let Err(error) = self.repository.insert_transaction(&tx).await {
            // A replayed renewal surfaces as a duplicate transaction id.
            return match (origin, error) {
                (TransitionOrigin::Poll, EngineError::DuplicateAggregate { .. }) => {
                    self.require_subscription(provider, original_id).await
                }
                (_, EngineError::DuplicateAggregate { .. }) => {
                    Err(EngineError::CallbackRejected {
                        reason: format!("renewal {transaction_id} already applied"),
                    })
                }
                (_, other) => Err(other),
            };
        }

        let stored = self
            .with_conflict_retry(|| self.extend_after_renewal(provider, original_id, transaction_id))
            .await?;
        info!(
            provider,
            original_transaction_id = %original_id,
            transaction_id,
            expires_at = %stored.expires_at,
            "subscription renewed"
        );
        Ok(stored)
    }

    async fn extend_after_renewal(
        &self,
        provider: &str,
        original_id: &str,
        transaction_id: &str,
    ) -> Result<Subscription> {
        let mut sub = self.require_subscription(provider, original_id).await?;
        sub.link_transaction(transaction_id);
        sub.record_recharge_success();
        let records = self.load_subscription_transactions(&sub).await?;
        sub.recompute_window(&records);
        self.repository.update_subscription(&sub).await
    }

    /// Cancels a subscription record; paid coverage is kept.
    pub(crate) async fn cancel_subscription_record(
        &self,
        provider: &str,
        original_id: &str,
        canceled_at: DateTime<Utc>,
        origin: TransitionOrigin,
    ) -> Result<Subscription> {
        self.with_conflict_retry(|| {
            self.cancel_subscription_once(provider, original_id, canceled_at, origin)
        })
        .await
    }

    async fn cancel_subscription_once(
        &self,
        provider: &str,
        original_id: &str,
        canceled_at: DateTime<Utc>,
        origin: TransitionOrigin,
    ) -> Result<Subscription> {
        let mut sub = self.require_subscription(provider, original_id).await?;
        match sub.cancel(canceled_at) {
            Transition::Applied => {
                let stored = self.repository.update_subscription(&sub).await?;
                info!(provider, original_transaction_id = %original_id, "subscription canceled");
                Ok(stored)
            }
            Transition::Redundant => match origin {
                TransitionOrigin::Poll => Ok(sub),
                TransitionOrigin::Callback => Err(EngineError::CallbackRejected {
                    reason: format!("subscription {original_id} already canceled"),
                }),
                TransitionOrigin::Operator => Err(EngineError::ConflictingTerminalTransition {
                    id: original_id.to_string(),
                    detail: "subscription already canceled".to_string(),
                }),
            },
        }
    }

    pub(crate) async fn record_recharge_failure(
        &self,
        provider: &str,
        original_id: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Subscription> {
        self.with_conflict_retry(|| self.record_recharge_failure_once(provider, original_id, failed_at))
            .await
    }

    async fn record_recharge_failure_once(
        &self,
        provider: &str,
        original_id: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Subscription> {
        let mut sub = self.require_subscription(provider, original_id).await?;
        sub.record_recharge_failure(failed_at);
        self.repository.update_subscription(&sub).await
    }

    pub(crate) async fn original_context(
        &self,
        sub: &Subscription,
    ) -> Result<OriginalTransactionContext> {
        let raw = match sub.initiating_transaction_id() {
            Some(id) => self
                .repository
                .find_transaction(&sub.provider, id)
                .await?
                .map(|tx| tx.raw)
                .unwrap_or(Value::Null),
            None => Value::Null,
        };
        Ok(OriginalTransactionContext {
            original_transaction_id: sub.original_transaction_id.clone(),
            user_id: sub.user_id.clone(),
            product_id: sub.product_id.clone(),
            raw,
        })
    }

    pub(crate) async fn load_subscription_transactions(
        &self,
        sub: &Subscription,
    ) -> Result<Vec<Transaction>> {
        let mut records = Vec::with_capacity(sub.transactions.len());
        for id in &sub.transactions {
            if let Some(tx) = self.repository.find_transaction(&sub.provider, id).await? {
                records.push(tx);
            }
        }
        Ok(records)
    }
}
