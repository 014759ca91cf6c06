use chrono::Duration;

/// Engine-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Payment window for freshly prepared transactions.
    pub purchase_expires_after: Duration,
    /// How early before `expires_at` a subscription enters its renewal window.
    pub renewal_before: Duration,
    /// How many times an additive write is retried on an optimistic-lock
    /// conflict before the conflict surfaces to the caller.
    pub conflict_retry_limit: u32,
    /// Lease timeout for the single-flight reconciliation loops.
    pub lease_ttl: Duration,
    /// When the initiating transaction of a subscription expires unpaid,
    /// cascade the subscription to canceled instead of leaving it pending.
    pub cancel_subscription_on_expired_payment: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            purchase_expires_after: Duration::minutes(15),
            renewal_before: Duration::days(1),
            conflict_retry_limit: 3,
            lease_ttl: Duration::minutes(5),
            cancel_subscription_on_expired_payment: true,
        }
    }
}

impl EngineConfig {
    pub fn with_purchase_expires_after(mut self, window: Duration) -> Self {
        self.purchase_expires_after = window;
        self
    }

    pub fn with_renewal_before(mut self, window: Duration) -> Self {
        self.renewal_before = window;
        self
    }

    pub fn with_expired_payment_cascade(mut self, cascade: bool) -> Self {
        self.cancel_subscription_on_expired_payment = cascade;
        self
    }
}
