use chrono::{DateTime, Utc};

use crate::domain::subscription::Subscription;
use crate::domain::transaction::Transaction;

/// Read-only aggregate of a user's entitlements.
///
/// Built by the engine from the repository; holds completed one-shot
/// purchases and every non-canceled subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct UserView {
    pub user_id: String,
    pub purchase_transactions: Vec<Transaction>,
    pub subscriptions: Vec<Subscription>,
}

impl UserView {
    /// Latest instant the user is entitled to products of `group`, across
    /// all of their subscriptions in that group.
    pub fn expire_time(&self, group: &str) -> Option<DateTime<Utc>> {
        self.subscriptions
            .iter()
            .filter(|sub| sub.product_group == group)
            .map(|sub| sub.expires_at)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subscription::SUBSCRIPTION_SCHEMA_VERSION;
    use chrono::Duration;

    fn sub(group: &str, expires_in: Duration) -> Subscription {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Subscription {
            provider: "mockpay".to_string(),
            original_transaction_id: format!("orig-{group}-{}", expires_in.num_days()),
            user_id: "user-1".to_string(),
            product_id: "plan".to_string(),
            product_group: group.to_string(),
            transactions: vec![],
            starts_at: now,
            expires_at: now + expires_in,
            canceled_at: None,
            renewal_enabled: true,
            last_failed_at: None,
            renewal_attempts: 0,
            version: 0,
            schema_version: SUBSCRIPTION_SCHEMA_VERSION,
        }
    }

    #[test]
    fn test_expire_time_takes_group_maximum() {
        let view = UserView {
            user_id: "user-1".to_string(),
            purchase_transactions: vec![],
            subscriptions: vec![
                sub("membership", Duration::days(30)),
                sub("membership", Duration::days(395)),
                sub("storage", Duration::days(7)),
            ],
        };

        let membership = view.expire_time("membership").unwrap();
        assert_eq!(
            membership,
            view.subscriptions[1].expires_at,
            "the later subscription wins"
        );
        assert!(view.expire_time("unknown-group").is_none());
    }
}
