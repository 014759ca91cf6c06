use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// What buying a product entitles the user to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    /// Recurring entitlement; `duration` covers one billing period.
    Subscription,
    /// One-shot purchase.
    Purchase,
}

/// Product descriptor resolved from a provider adapter.
///
/// Descriptors are immutable once cached; the engine never mutates them.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Product {
    pub id: String,
    /// Mutually-exclusive family (e.g. "membership"). Subscriptions in the
    /// same group supersede each other on plan change.
    pub group: Option<String>,
    pub kind: ProductKind,
    /// Entitlement period per paid transaction. Required for subscriptions.
    #[serde(default, with = "super::duration_secs_opt")]
    pub duration: Option<Duration>,
    /// Price as quoted by the provider. Carried, never computed on.
    pub price: Decimal,
}

impl Product {
    /// The period and group of a subscription product.
    ///
    /// Fails when the product is not a subscription or its descriptor is
    /// missing the fields subscriptions require.
    pub fn subscription_terms(&self) -> Result<(Duration, &str)> {
        if self.kind != ProductKind::Subscription {
            return Err(EngineError::InvalidProduct {
                product_id: self.id.clone(),
                reason: "not a subscription product".to_string(),
            });
        }
        let duration = self.duration.ok_or_else(|| EngineError::InvalidProduct {
            product_id: self.id.clone(),
            reason: "subscription product without a duration".to_string(),
        })?;
        let group = self
            .group
            .as_deref()
            .ok_or_else(|| EngineError::InvalidProduct {
                product_id: self.id.clone(),
                reason: "subscription product without a group".to_string(),
            })?;
        Ok((duration, group))
    }

    pub fn require_purchase(&self) -> Result<()> {
        if self.kind != ProductKind::Purchase {
            return Err(EngineError::InvalidProduct {
                product_id: self.id.clone(),
                reason: "not a one-shot purchase product".to_string(),
            });
        }
        Ok(())
    }
}
