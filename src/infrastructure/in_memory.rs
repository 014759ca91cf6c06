use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::action::Action;
use crate::domain::ports::Repository;
use crate::domain::subscription::Subscription;
use crate::domain::transaction::Transaction;
use crate::error::{AggregateKind, EngineError, Result};

type Key = (String, String);

/// A thread-safe in-memory repository.
///
/// Every collection lives behind `Arc<RwLock<HashMap>>` so clones share
/// state. Updates are compare-and-swap on the record version, matching the
/// durable implementation. Ideal for tests.
#[derive(Default, Clone)]
pub struct InMemoryRepository {
    transactions: Arc<RwLock<HashMap<Key, Transaction>>>,
    subscriptions: Arc<RwLock<HashMap<Key, Subscription>>>,
    actions: Arc<RwLock<HashMap<Uuid, Action>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(provider: &str, id: &str) -> Key {
    (provider.to_string(), id.to_string())
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_transaction(
        &self,
        provider: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&key(provider, transaction_id)).cloned())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let id = key(&transaction.provider, &transaction.transaction_id);
        if transactions.contains_key(&id) {
            return Err(EngineError::DuplicateAggregate {
                kind: AggregateKind::Transaction,
                id: transaction.transaction_id.clone(),
            });
        }
        transactions.insert(id, transaction.clone());
        Ok(())
    }

    async fn update_transaction(&self, transaction: &Transaction) -> Result<Transaction> {
        let mut transactions = self.transactions.write().await;
        let id = key(&transaction.provider, &transaction.transaction_id);
        let stored = transactions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound {
                kind: AggregateKind::Transaction,
                id: transaction.transaction_id.clone(),
            })?;
        if stored.version != transaction.version {
            return Err(EngineError::Conflict {
                kind: AggregateKind::Transaction,
                id: transaction.transaction_id.clone(),
            });
        }
        let mut updated = transaction.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_pending_transactions(
        &self,
        provider: &str,
        expiring_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let mut pending: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.provider == provider && !tx.is_terminal())
            .filter(|tx| match expiring_before {
                Some(cutoff) => tx.payment_expires_at <= cutoff,
                None => true,
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            (a.created_at, &a.transaction_id).cmp(&(b.created_at, &b.transaction_id))
        });
        Ok(pending)
    }

    async fn list_transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_subscription(
        &self,
        provider: &str,
        original_transaction_id: &str,
    ) -> Result<Option<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .get(&key(provider, original_transaction_id))
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let id = key(
            &subscription.provider,
            &subscription.original_transaction_id,
        );
        if subscriptions.contains_key(&id) {
            return Err(EngineError::DuplicateAggregate {
                kind: AggregateKind::Subscription,
                id: subscription.original_transaction_id.clone(),
            });
        }
        subscriptions.insert(id, subscription.clone());
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.write().await;
        let id = key(
            &subscription.provider,
            &subscription.original_transaction_id,
        );
        let stored = subscriptions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound {
                kind: AggregateKind::Subscription,
                id: subscription.original_transaction_id.clone(),
            })?;
        if stored.version != subscription.version {
            return Err(EngineError::Conflict {
                kind: AggregateKind::Subscription,
                id: subscription.original_transaction_id.clone(),
            });
        }
        let mut updated = subscription.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_subscriptions_due_for_renewal(
        &self,
        provider: &str,
        now: DateTime<Utc>,
        renewal_before: Duration,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|sub| {
                sub.provider == provider
                    && sub.canceled_at.is_none()
                    && sub.renewal_enabled
                    && sub.is_confirmed()
                    && sub.expires_at > now
                    && sub.expires_at - now <= renewal_before
            })
            .cloned()
            .collect())
    }

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|sub| sub.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_subscriptions_in_group(
        &self,
        user_id: &str,
        group: &str,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|sub| sub.user_id == user_id && sub.product_group == group)
            .cloned()
            .collect())
    }

    async fn list_subscriptions_missing_linkage(
        &self,
        provider: &str,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|sub| {
                sub.provider == provider
                    && sub.canceled_at.is_none()
                    && !sub.renewal_enabled
                    && sub.is_confirmed()
            })
            .cloned()
            .collect())
    }

    async fn insert_action(&self, action: &Action) -> Result<()> {
        let mut actions = self.actions.write().await;
        if actions.contains_key(&action.id) {
            return Err(EngineError::DuplicateAggregate {
                kind: AggregateKind::Action,
                id: action.id.to_string(),
            });
        }
        actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn update_action(&self, action: &Action) -> Result<Action> {
        let mut actions = self.actions.write().await;
        let stored = actions
            .get_mut(&action.id)
            .ok_or_else(|| EngineError::NotFound {
                kind: AggregateKind::Action,
                id: action.id.to_string(),
            })?;
        if stored.version != action.version {
            return Err(EngineError::Conflict {
                kind: AggregateKind::Action,
                id: action.id.to_string(),
            });
        }
        let mut updated = action.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_pending_actions(&self, provider: &str) -> Result<Vec<Action>> {
        let actions = self.actions.read().await;
        let mut pending: Vec<Action> = actions
            .values()
            .filter(|action| action.provider == provider && action.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|action| action.created_at);
        Ok(pending)
    }
}
