#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use tollgate::application::engine::{
    PaymentEngine, PurchaseRequest, SubscriptionRequest,
};
use tollgate::application::reconcile::ErrorSink;
use tollgate::application::registry::ProviderRegistry;
use tollgate::clock::ManualClock;
use tollgate::config::EngineConfig;
use tollgate::domain::product::{Product, ProductKind};
use tollgate::error::EngineError;
use tollgate::infrastructure::in_memory::InMemoryRepository;
use tollgate::infrastructure::mock::MockProviderAdapter;

pub const PROVIDER: &str = "mockpay";
pub const USER: &str = "user-1";

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn monthly() -> Product {
    Product {
        id: "plan-monthly".to_string(),
        group: Some("membership".to_string()),
        kind: ProductKind::Subscription,
        duration: Some(Duration::days(30)),
        price: dec!(9.99),
    }
}

pub fn yearly() -> Product {
    Product {
        id: "plan-yearly".to_string(),
        group: Some("membership".to_string()),
        kind: ProductKind::Subscription,
        duration: Some(Duration::days(365)),
        price: dec!(99.99),
    }
}

pub fn daily() -> Product {
    Product {
        id: "plan-daily".to_string(),
        group: Some("membership".to_string()),
        kind: ProductKind::Subscription,
        duration: Some(Duration::days(1)),
        price: dec!(0.99),
    }
}

pub fn coin_pack() -> Product {
    Product {
        id: "coins-100".to_string(),
        group: None,
        kind: ProductKind::Purchase,
        duration: None,
        price: dec!(4.99),
    }
}

/// Adapter pre-loaded with the membership plans and cancel support.
pub fn membership_adapter() -> MockProviderAdapter {
    MockProviderAdapter::new(PROVIDER)
        .with_product(monthly())
        .with_product(yearly())
        .with_product(daily())
        .with_cancel_support()
}

pub struct Harness {
    pub engine: PaymentEngine,
    pub adapter: Arc<MockProviderAdapter>,
    pub clock: ManualClock,
    pub cancel: CancellationToken,
}

pub fn harness(adapter: MockProviderAdapter, config: EngineConfig) -> Harness {
    let adapter = Arc::new(adapter);
    let clock = ManualClock::starting_at(start_time());
    let mut registry = ProviderRegistry::new();
    registry.register(adapter.clone());
    let engine = PaymentEngine::new(
        registry,
        Arc::new(InMemoryRepository::new()),
        Arc::new(clock.clone()),
        config,
    );
    Harness {
        engine,
        adapter,
        clock,
        cancel: CancellationToken::new(),
    }
}

pub fn subscription_request(product_id: &str) -> SubscriptionRequest {
    SubscriptionRequest {
        product_id: product_id.to_string(),
        user_id: USER.to_string(),
    }
}

pub fn purchase_request(product_id: &str) -> PurchaseRequest {
    PurchaseRequest {
        product_id: product_id.to_string(),
        user_id: USER.to_string(),
    }
}

pub fn payment_confirmed(transaction_id: &str, purchased_at: DateTime<Utc>) -> Value {
    json!({
        "type": "payment-confirmed",
        "transaction_id": transaction_id,
        "purchased_at": purchased_at,
    })
}

pub fn payment_canceled(transaction_id: &str, canceled_at: DateTime<Utc>) -> Value {
    json!({
        "type": "payment-canceled",
        "transaction_id": transaction_id,
        "canceled_at": canceled_at,
    })
}

pub fn subscribed(original_transaction_id: &str, subscribed_at: DateTime<Utc>) -> Value {
    json!({
        "type": "subscribed",
        "original_transaction_id": original_transaction_id,
        "subscribed_at": subscribed_at,
    })
}

pub fn subscription_renewal(
    original_transaction_id: &str,
    transaction_id: &str,
    purchased_at: DateTime<Utc>,
    duration: Duration,
) -> Value {
    json!({
        "type": "subscription-renewal",
        "original_transaction_id": original_transaction_id,
        "transaction_id": transaction_id,
        "purchased_at": purchased_at,
        "duration": duration.num_seconds(),
    })
}

pub fn subscription_canceled(original_transaction_id: &str, canceled_at: DateTime<Utc>) -> Value {
    json!({
        "type": "subscription-canceled",
        "original_transaction_id": original_transaction_id,
        "canceled_at": canceled_at,
    })
}

/// Sink that remembers every reported item for assertions.
#[derive(Default)]
pub struct CollectingSink {
    items: Mutex<Vec<(String, String)>>,
}

impl CollectingSink {
    pub fn reported(&self) -> Vec<(String, String)> {
        self.items.lock().unwrap().clone()
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, item: &str, error: &EngineError) {
        self.items
            .lock()
            .unwrap()
            .push((item.to_string(), error.to_string()));
    }
}
