use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::event::{RechargeOutcome, SubscriptionProbe, TransactionProbe};
use crate::error::{EngineError, Result};

use super::engine::{PaymentEngine, TransitionOrigin};

/// Receives per-item failures from batch operations so one bad record does
/// not abort the pass.
pub trait ErrorSink: Send + Sync {
    fn report(&self, item: &str, error: &EngineError);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, item: &str, error: &EngineError) {
        warn!(item, %error, "reconciliation item failed");
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    /// Another pass held the single-flight lease; nothing was done.
    pub skipped: bool,
}

impl BatchReport {
    fn skipped() -> Self {
        Self {
            processed: 0,
            failed: 0,
            skipped: true,
        }
    }
}

/// Process-wide single-flight leases, keyed by `(provider, loop)`.
///
/// A lease expires after its TTL, so a pass that died without releasing
/// does not block the loop forever.
pub(crate) struct Leases {
    held: Mutex<HashMap<(String, &'static str), DateTime<Utc>>>,
}

impl Leases {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn try_acquire(
        &self,
        provider: &str,
        loop_name: &'static str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match held.get(&(provider.to_string(), loop_name)) {
            Some(until) if *until > now => false,
            _ => {
                held.insert((provider.to_string(), loop_name), now + ttl);
                true
            }
        }
    }

    pub(crate) fn release(&self, provider: &str, loop_name: &'static str) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&(provider.to_string(), loop_name));
    }
}

impl PaymentEngine {
    /// Polls every pending transaction whose payment window has closed and
    /// applies the provider's verdict. Per-item errors go to `sink`.
    pub async fn check_transactions(
        &self,
        provider: &str,
        sink: &dyn ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.ensure_live(cancel)?;
        if !self.leases.try_acquire(
            provider,
            "check-transactions",
            self.clock.now(),
            self.config.lease_ttl,
        ) {
            debug!(provider, "check-transactions already in flight");
            return Ok(BatchReport::skipped());
        }
        let result = self.check_transactions_held(provider, sink, cancel).await;
        self.leases.release(provider, "check-transactions");
        result
    }

    async fn check_transactions_held(
        &self,
        provider: &str,
        sink: &dyn ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let adapter = self.registry.adapter(provider)?;
        let now = self.clock.now();
        let expired = self
            .repository
            .list_pending_transactions(provider, Some(now))
            .await?;

        let mut report = BatchReport::default();
        for tx in expired {
            self.ensure_live(cancel)?;
            let applied = match adapter.query_transaction_status(&tx.transaction_id).await {
                Ok(TransactionProbe::Success { purchased_at }) => self
                    .complete_transaction(
                        provider,
                        &tx.transaction_id,
                        purchased_at,
                        TransitionOrigin::Poll,
                    )
                    .await
                    .map(|_| ()),
                // The provider did not affirm success; the attempt is dead.
                Ok(TransactionProbe::Canceled { canceled_at }) => self
                    .cancel_transaction(
                        provider,
                        &tx.transaction_id,
                        canceled_at,
                        TransitionOrigin::Poll,
                    )
                    .await
                    .map(|_| ()),
                Err(error) => Err(error),
            };
            match applied {
                Ok(()) => report.processed += 1,
                Err(error) => {
                    sink.report(&tx.transaction_id, &error);
                    report.failed += 1;
                }
            }
        }
        debug!(
            provider,
            processed = report.processed,
            failed = report.failed,
            "check-transactions pass done"
        );
        Ok(report)
    }

    /// Attempts one recharge for every subscription inside its renewal
    /// window. Retries carry the attempt counter until coverage lapses or
    /// the provider answers terminally.
    pub async fn check_subscription_renewal(
        &self,
        provider: &str,
        sink: &dyn ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.ensure_live(cancel)?;
        if !self.leases.try_acquire(
            provider,
            "check-subscription-renewal",
            self.clock.now(),
            self.config.lease_ttl,
        ) {
            debug!(provider, "check-subscription-renewal already in flight");
            return Ok(BatchReport::skipped());
        }
        let result = self.check_renewal_held(provider, sink, cancel).await;
        self.leases.release(provider, "check-subscription-renewal");
        result
    }

    async fn check_renewal_held(
        &self,
        provider: &str,
        sink: &dyn ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let now = self.clock.now();
        let due = self
            .repository
            .list_subscriptions_due_for_renewal(provider, now, self.config.renewal_before)
            .await?;

        let mut report = BatchReport::default();
        for sub in due {
            self.ensure_live(cancel)?;
            match self.renew_one(provider, &sub.original_transaction_id).await {
                Ok(()) => report.processed += 1,
                Err(error) => {
                    sink.report(&sub.original_transaction_id, &error);
                    report.failed += 1;
                }
            }
        }
        debug!(
            provider,
            processed = report.processed,
            failed = report.failed,
            "check-subscription-renewal pass done"
        );
        Ok(report)
    }

    async fn renew_one(&self, provider: &str, original_id: &str) -> Result<()> {
        let adapter = self.registry.adapter(provider)?;
        let sub = self.require_subscription(provider, original_id).await?;
        let context = self.original_context(&sub).await?;

        match adapter
            .recharge_subscription(&context, sub.renewal_attempts)
            .await?
        {
            RechargeOutcome::Renewal {
                transaction_id,
                purchased_at,
                duration,
            } => {
                self.apply_renewal(
                    provider,
                    original_id,
                    &transaction_id,
                    purchased_at,
                    duration,
                    Value::Null,
                    TransitionOrigin::Poll,
                )
                .await?;
            }
            RechargeOutcome::Failed { failed_at, reason } => {
                warn!(
                    provider,
                    original_transaction_id = %original_id,
                    reason,
                    "recharge failed; subscription stays active"
                );
                self.record_recharge_failure(provider, original_id, failed_at)
                    .await?;
            }
            RechargeOutcome::Canceled {
                canceled_at,
                reason,
            } => {
                warn!(
                    provider,
                    original_transaction_id = %original_id,
                    reason = reason.as_deref().unwrap_or("none given"),
                    "provider canceled the subscription during recharge"
                );
                self.cancel_subscription_record(
                    provider,
                    original_id,
                    canceled_at,
                    TransitionOrigin::Poll,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Finds subscriptions whose initiating payment is confirmed but whose
    /// `subscribed` linkage never arrived, and asks the provider directly.
    pub async fn check_uncompleted_subscription(
        &self,
        provider: &str,
        sink: &dyn ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.ensure_live(cancel)?;
        if !self.leases.try_acquire(
            provider,
            "check-uncompleted-subscription",
            self.clock.now(),
            self.config.lease_ttl,
        ) {
            debug!(provider, "check-uncompleted-subscription already in flight");
            return Ok(BatchReport::skipped());
        }
        let result = self.check_uncompleted_held(provider, sink, cancel).await;
        self.leases.release(provider, "check-uncompleted-subscription");
        result
    }

    async fn check_uncompleted_held(
        &self,
        provider: &str,
        sink: &dyn ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let adapter = self.registry.adapter(provider)?;
        let unlinked = self
            .repository
            .list_subscriptions_missing_linkage(provider)
            .await?;

        let mut report = BatchReport::default();
        for sub in unlinked {
            self.ensure_live(cancel)?;
            let applied = match adapter
                .query_subscription_status(&sub.original_transaction_id)
                .await
            {
                Ok(SubscriptionProbe::Subscribed { .. }) => self
                    .bind_subscription_renewal(
                        provider,
                        &sub.original_transaction_id,
                        TransitionOrigin::Poll,
                    )
                    .await
                    .map(|_| ()),
                Ok(SubscriptionProbe::Canceled { canceled_at }) => self
                    .cancel_subscription_record(
                        provider,
                        &sub.original_transaction_id,
                        canceled_at,
                        TransitionOrigin::Poll,
                    )
                    .await
                    .map(|_| ()),
                Err(error) => Err(error),
            };
            match applied {
                Ok(()) => report.processed += 1,
                Err(error) => {
                    sink.report(&sub.original_transaction_id, &error);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_single_flight() {
        let leases = Leases::new();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let ttl = Duration::minutes(5);

        assert!(leases.try_acquire("mockpay", "check-transactions", now, ttl));
        assert!(!leases.try_acquire("mockpay", "check-transactions", now, ttl));
        // Other loops and providers are independent.
        assert!(leases.try_acquire("mockpay", "check-subscription-renewal", now, ttl));
        assert!(leases.try_acquire("acme-pay", "check-transactions", now, ttl));

        leases.release("mockpay", "check-transactions");
        assert!(leases.try_acquire("mockpay", "check-transactions", now, ttl));
    }

    #[test]
    fn test_lease_expires_after_ttl() {
        let leases = Leases::new();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let ttl = Duration::minutes(5);

        assert!(leases.try_acquire("mockpay", "check-transactions", now, ttl));
        // A crashed pass never releases; the lease times out instead.
        assert!(!leases.try_acquire(
            "mockpay",
            "check-transactions",
            now + Duration::minutes(4),
            ttl
        ));
        assert!(leases.try_acquire(
            "mockpay",
            "check-transactions",
            now + Duration::minutes(6),
            ttl
        ));
    }
}
