use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::domain::action::Action;
use crate::domain::ports::Repository;
use crate::domain::subscription::Subscription;
use crate::domain::transaction::Transaction;
use crate::error::{AggregateKind, EngineError, Result};

/// Column family for transactions.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column family for subscriptions.
pub const CF_SUBSCRIPTIONS: &str = "subscriptions";
/// Column family for pending post-transition actions.
pub const CF_ACTIONS: &str = "actions";

/// A persistent repository backed by RocksDB.
///
/// Records are stored as JSON under `provider/id` keys, one column family
/// per collection. RocksDB has no native compare-and-swap, so updates are
/// serialized through a process-wide write lock; reads stay lock-free.
///
/// `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDbRepository {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbRepository {
    /// Opens or creates a RocksDB instance at the specified path, ensuring
    /// the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SUBSCRIPTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_ACTIONS, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            EngineError::internal(std::io::Error::other(format!(
                "column family {name} not found"
            )))
        })
    }

    fn get_record<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(EngineError::internal)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, cf_name: &str, key: &[u8], record: &T) -> Result<()> {
        let cf = self.cf_handle(cf_name)?;
        let bytes = serde_json::to_vec(record).map_err(EngineError::internal)?;
        self.db.put_cf(&cf, key, bytes)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let record = serde_json::from_slice(&value).map_err(EngineError::internal)?;
            records.push(record);
        }
        Ok(records)
    }

    fn hold_write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn record_key(provider: &str, id: &str) -> Vec<u8> {
    format!("{provider}/{id}").into_bytes()
}

#[async_trait]
impl Repository for RocksDbRepository {
    async fn find_transaction(
        &self,
        provider: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        self.get_record(CF_TRANSACTIONS, &record_key(provider, transaction_id))
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        let _guard = self.hold_write_lock();
        let key = record_key(&transaction.provider, &transaction.transaction_id);
        if self
            .get_record::<Transaction>(CF_TRANSACTIONS, &key)?
            .is_some()
        {
            return Err(EngineError::DuplicateAggregate {
                kind: AggregateKind::Transaction,
                id: transaction.transaction_id.clone(),
            });
        }
        self.put_record(CF_TRANSACTIONS, &key, transaction)
    }

    async fn update_transaction(&self, transaction: &Transaction) -> Result<Transaction> {
        let _guard = self.hold_write_lock();
        let key = record_key(&transaction.provider, &transaction.transaction_id);
        let stored: Transaction = self.get_record(CF_TRANSACTIONS, &key)?.ok_or_else(|| {
            EngineError::NotFound {
                kind: AggregateKind::Transaction,
                id: transaction.transaction_id.clone(),
            }
        })?;
        if stored.version != transaction.version {
            return Err(EngineError::Conflict {
                kind: AggregateKind::Transaction,
                id: transaction.transaction_id.clone(),
            });
        }
        let mut updated = transaction.clone();
        updated.version += 1;
        self.put_record(CF_TRANSACTIONS, &key, &updated)?;
        Ok(updated)
    }

    async fn list_pending_transactions(
        &self,
        provider: &str,
        expiring_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>> {
        let records: Vec<Transaction> = self.scan(CF_TRANSACTIONS)?;
        let mut pending: Vec<Transaction> = records
            .into_iter()
            .filter(|tx| tx.provider == provider && !tx.is_terminal())
            .filter(|tx| match expiring_before {
                Some(cutoff) => tx.payment_expires_at <= cutoff,
                None => true,
            })
            .collect();
        pending.sort_by(|a, b| {
            (a.created_at, &a.transaction_id).cmp(&(b.created_at, &b.transaction_id))
        });
        Ok(pending)
    }

    async fn list_transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let records: Vec<Transaction> = self.scan(CF_TRANSACTIONS)?;
        Ok(records.into_iter().filter(|tx| tx.user_id == user_id).collect())
    }

    async fn find_subscription(
        &self,
        provider: &str,
        original_transaction_id: &str,
    ) -> Result<Option<Subscription>> {
        self.get_record(CF_SUBSCRIPTIONS, &record_key(provider, original_transaction_id))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let _guard = self.hold_write_lock();
        let key = record_key(
            &subscription.provider,
            &subscription.original_transaction_id,
        );
        if self
            .get_record::<Subscription>(CF_SUBSCRIPTIONS, &key)?
            .is_some()
        {
            return Err(EngineError::DuplicateAggregate {
                kind: AggregateKind::Subscription,
                id: subscription.original_transaction_id.clone(),
            });
        }
        self.put_record(CF_SUBSCRIPTIONS, &key, subscription)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<Subscription> {
        let _guard = self.hold_write_lock();
        let key = record_key(
            &subscription.provider,
            &subscription.original_transaction_id,
        );
        let stored: Subscription = self.get_record(CF_SUBSCRIPTIONS, &key)?.ok_or_else(|| {
            EngineError::NotFound {
                kind: AggregateKind::Subscription,
                id: subscription.original_transaction_id.clone(),
            }
        })?;
        if stored.version != subscription.version {
            return Err(EngineError::Conflict {
                kind: AggregateKind::Subscription,
                id: subscription.original_transaction_id.clone(),
            });
        }
        let mut updated = subscription.clone();
        updated.version += 1;
        self.put_record(CF_SUBSCRIPTIONS, &key, &updated)?;
        Ok(updated)
    }

    async fn list_subscriptions_due_for_renewal(
        &self,
        provider: &str,
        now: DateTime<Utc>,
        renewal_before: Duration,
    ) -> Result<Vec<Subscription>> {
        let records: Vec<Subscription> = self.scan(CF_SUBSCRIPTIONS)?;
        Ok(records
            .into_iter()
            .filter(|sub| {
                sub.provider == provider
                    && sub.canceled_at.is_none()
                    && sub.renewal_enabled
                    && sub.is_confirmed()
                    && sub.expires_at > now
                    && sub.expires_at - now <= renewal_before
            })
            .collect())
    }

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let records: Vec<Subscription> = self.scan(CF_SUBSCRIPTIONS)?;
        Ok(records
            .into_iter()
            .filter(|sub| sub.user_id == user_id)
            .collect())
    }

    async fn list_subscriptions_in_group(
        &self,
        user_id: &str,
        group: &str,
    ) -> Result<Vec<Subscription>> {
        let records: Vec<Subscription> = self.scan(CF_SUBSCRIPTIONS)?;
        Ok(records
            .into_iter()
            .filter(|sub| sub.user_id == user_id && sub.product_group == group)
            .collect())
    }

    async fn list_subscriptions_missing_linkage(
        &self,
        provider: &str,
    ) -> Result<Vec<Subscription>> {
        let records: Vec<Subscription> = self.scan(CF_SUBSCRIPTIONS)?;
        Ok(records
            .into_iter()
            .filter(|sub| {
                sub.provider == provider
                    && sub.canceled_at.is_none()
                    && !sub.renewal_enabled
                    && sub.is_confirmed()
            })
            .collect())
    }

    async fn insert_action(&self, action: &Action) -> Result<()> {
        let _guard = self.hold_write_lock();
        let key = record_key(&action.provider, &action.id.to_string());
        if self.get_record::<Action>(CF_ACTIONS, &key)?.is_some() {
            return Err(EngineError::DuplicateAggregate {
                kind: AggregateKind::Action,
                id: action.id.to_string(),
            });
        }
        self.put_record(CF_ACTIONS, &key, action)
    }

    async fn update_action(&self, action: &Action) -> Result<Action> {
        let _guard = self.hold_write_lock();
        let key = record_key(&action.provider, &action.id.to_string());
        let stored: Action =
            self.get_record(CF_ACTIONS, &key)?
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
        self.put_record(CF_ACTIONS, &key, &updated)?;
        Ok(updated)
    }

    async fn list_pending_actions(&self, provider: &str) -> Result<Vec<Action>> {
        let records: Vec<Action> = self.scan(CF_ACTIONS)?;
        let mut pending: Vec<Action> = records
            .into_iter()
            .filter(|action| action.provider == provider && action.is_pending())
            .collect();
        pending.sort_by_key(|action| action.created_at);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::ProductKind;
    use crate::domain::transaction::TRANSACTION_SCHEMA_VERSION;
    use serde_json::Value;
    use tempfile::tempdir;

    fn pending_tx(id: &str) -> Transaction {
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Transaction {
            provider: "mockpay".to_string(),
            transaction_id: id.to_string(),
            user_id: "user-1".to_string(),
            product_id: "coins-100".to_string(),
            kind: ProductKind::Purchase,
            created_at: created,
            starts_at: created,
            payment_expires_at: created + Duration::minutes(15),
            purchased_at: None,
            completed_at: None,
            canceled_at: None,
            duration: None,
            original_transaction_id: None,
            raw: Value::Null,
            version: 0,
            schema_version: TRANSACTION_SCHEMA_VERSION,
        }
    }

    #[tokio::test]
    async fn test_open_creates_column_families() {
        let dir = tempdir().unwrap();
        let repo = RocksDbRepository::open(dir.path()).expect("open RocksDB");

        assert!(repo.db.cf_handle(CF_TRANSACTIONS).is_some());
        assert!(repo.db.cf_handle(CF_SUBSCRIPTIONS).is_some());
        assert!(repo.db.cf_handle(CF_ACTIONS).is_some());
    }

    #[tokio::test]
    async fn test_transaction_roundtrip_and_cas() {
        let dir = tempdir().unwrap();
        let repo = RocksDbRepository::open(dir.path()).unwrap();

        let tx = pending_tx("tx-1");
        repo.insert_transaction(&tx).await.unwrap();
        assert!(matches!(
            repo.insert_transaction(&tx).await,
            Err(EngineError::DuplicateAggregate { .. })
        ));

        let mut stored = repo
            .find_transaction("mockpay", "tx-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, tx);

        stored.completed_at = Some(stored.created_at);
        let updated = repo.update_transaction(&stored).await.unwrap();
        assert_eq!(updated.version, 1);

        // A writer holding the old version loses.
        assert!(matches!(
            repo.update_transaction(&tx).await,
            Err(EngineError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let repo = RocksDbRepository::open(dir.path()).unwrap();
            repo.insert_transaction(&pending_tx("tx-1")).await.unwrap();
        }

        let repo = RocksDbRepository::open(dir.path()).unwrap();
        let stored = repo
            .find_transaction("mockpay", "tx-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.transaction_id, "tx-1");
    }
}
