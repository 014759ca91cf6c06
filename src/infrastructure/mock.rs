use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::domain::event::{ProviderEvent, RechargeOutcome, SubscriptionProbe, TransactionProbe};
use crate::domain::ports::{
    OriginalTransactionContext, PreparePurchase, PrepareSubscription, PreparedPurchaseData,
    PreparedSubscriptionData, ProviderAdapter,
};
use crate::domain::product::Product;
use crate::error::{EngineError, Result};

/// A scripted provider adapter for tests.
///
/// Products are registered up front; poll and recharge answers are queued
/// and consumed in order. Running a poll with an empty queue fails with a
/// provider error, which keeps broken test scripts visible.
pub struct MockProviderAdapter {
    name: String,
    products: HashMap<String, Product>,
    supports_cancel: bool,
    transaction_probes: Mutex<VecDeque<Result<TransactionProbe>>>,
    subscription_probes: Mutex<VecDeque<Result<SubscriptionProbe>>>,
    recharge_outcomes: Mutex<VecDeque<Result<RechargeOutcome>>>,
    canceled_contracts: Mutex<Vec<String>>,
    product_lookups: AtomicUsize,
    next_id: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockProviderAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            products: HashMap::new(),
            supports_cancel: false,
            transaction_probes: Mutex::new(VecDeque::new()),
            subscription_probes: Mutex::new(VecDeque::new()),
            recharge_outcomes: Mutex::new(VecDeque::new()),
            canceled_contracts: Mutex::new(Vec::new()),
            product_lookups: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.products.insert(product.id.clone(), product);
        self
    }

    pub fn with_cancel_support(mut self) -> Self {
        self.supports_cancel = true;
        self
    }

    pub fn queue_transaction_probe(&self, probe: TransactionProbe) {
        locked(&self.transaction_probes).push_back(Ok(probe));
    }

    pub fn queue_transaction_probe_error(&self, detail: &str) {
        locked(&self.transaction_probes).push_back(Err(self.failure("query_transaction_status", detail)));
    }

    pub fn queue_subscription_probe(&self, probe: SubscriptionProbe) {
        locked(&self.subscription_probes).push_back(Ok(probe));
    }

    pub fn queue_recharge_outcome(&self, outcome: RechargeOutcome) {
        locked(&self.recharge_outcomes).push_back(Ok(outcome));
    }

    pub fn queue_recharge_error(&self, detail: &str) {
        locked(&self.recharge_outcomes).push_back(Err(self.failure("recharge_subscription", detail)));
    }

    /// Contracts this adapter was asked to cancel, in call order.
    pub fn canceled_contracts(&self) -> Vec<String> {
        locked(&self.canceled_contracts).clone()
    }

    pub fn product_lookups(&self) -> usize {
        self.product_lookups.load(Ordering::SeqCst)
    }

    fn failure(&self, operation: &str, detail: &str) -> EngineError {
        EngineError::ProviderFailure {
            provider: self.name.clone(),
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn require_product(&self, product_id: &str) -> Result<Product> {
        self.product_lookups.fetch_add(1, Ordering::SeqCst);
        self.products
            .get(product_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProduct {
                provider: self.name.clone(),
                product_id: product_id.to_string(),
            })
    }

    async fn prepare_purchase_data(
        &self,
        request: &PreparePurchase,
    ) -> Result<PreparedPurchaseData> {
        let n = self.next_id();
        let transaction_id = format!("{}-tx-{n}", self.name);
        Ok(PreparedPurchaseData {
            response: json!({
                "provider": self.name,
                "transaction_id": transaction_id,
                "product_id": request.product.id,
                "user_id": request.user_id,
            }),
            transaction_id,
        })
    }

    async fn prepare_subscription_data(
        &self,
        request: &PrepareSubscription,
    ) -> Result<PreparedSubscriptionData> {
        let n = self.next_id();
        let transaction_id = format!("{}-tx-{n}", self.name);
        let original_transaction_id = format!("{}-orig-{n}", self.name);
        Ok(PreparedSubscriptionData {
            response: json!({
                "provider": self.name,
                "transaction_id": transaction_id,
                "original_transaction_id": original_transaction_id,
                "product_id": request.product.id,
                "user_id": request.user_id,
                "starts_at": request.starts_at,
            }),
            transaction_id,
            original_transaction_id,
            duration: request.product.duration,
        })
    }

    fn parse_callback(&self, payload: &Value) -> Result<ProviderEvent> {
        serde_json::from_value(payload.clone()).map_err(|_| EngineError::UnrecognizedEvent {
            event: payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<untagged>")
                .to_string(),
        })
    }

    async fn query_transaction_status(&self, _transaction_id: &str) -> Result<TransactionProbe> {
        locked(&self.transaction_probes)
            .pop_front()
            .unwrap_or_else(|| Err(self.failure("query_transaction_status", "no scripted probe")))
    }

    async fn query_subscription_status(
        &self,
        _original_transaction_id: &str,
    ) -> Result<SubscriptionProbe> {
        locked(&self.subscription_probes)
            .pop_front()
            .unwrap_or_else(|| Err(self.failure("query_subscription_status", "no scripted probe")))
    }

    async fn recharge_subscription(
        &self,
        _context: &OriginalTransactionContext,
        _attempt: u32,
    ) -> Result<RechargeOutcome> {
        locked(&self.recharge_outcomes)
            .pop_front()
            .unwrap_or_else(|| Err(self.failure("recharge_subscription", "no scripted outcome")))
    }

    fn supports_cancel_subscription(&self) -> bool {
        self.supports_cancel
    }

    async fn cancel_subscription(&self, context: &OriginalTransactionContext) -> Result<bool> {
        if !self.supports_cancel {
            return Err(EngineError::UnsupportedOperation {
                provider: self.name.clone(),
                operation: "cancel_subscription",
            });
        }
        locked(&self.canceled_contracts).push(context.original_transaction_id.clone());
        Ok(true)
    }
}
