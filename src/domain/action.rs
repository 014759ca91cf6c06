use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ACTION_SCHEMA_VERSION: u32 = 1;

/// Post-transition side effect.
///
/// Persisted before the transition that triggers it becomes visible, so a
/// crash re-drives it. Handlers are at-least-once and must be idempotent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ActionKind {
    /// Tell the provider to stop charging the superseded subscription.
    CancelAtProvider { original_transaction_id: String },
    /// Notify that a subscription got its first confirmed payment.
    SubscriptionActivated {
        original_transaction_id: String,
        user_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Action {
    pub id: Uuid,
    pub provider: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub version: u64,
    pub schema_version: u32,
}

impl Action {
    pub fn new(provider: &str, kind: ActionKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            kind,
            created_at,
            completed_at: None,
            attempts: 0,
            version: 0,
            schema_version: ACTION_SCHEMA_VERSION,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.completed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrip() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let action = Action::new(
            "mockpay",
            ActionKind::CancelAtProvider {
                original_transaction_id: "orig-1".to_string(),
            },
            at,
        );
        assert!(action.is_pending());

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "cancel-at-provider");
        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }
}
