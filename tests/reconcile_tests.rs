mod common;

use chrono::Duration;
use tollgate::application::reconcile::LogSink;
use tollgate::clock::Clock;
use tollgate::config::EngineConfig;
use tollgate::domain::event::{SubscriptionProbe, TransactionProbe};
use tollgate::domain::subscription::SubscriptionStatus;
use tollgate::domain::transaction::TransactionStatus;
use tollgate::error::EngineError;

use common::*;

#[tokio::test]
async fn test_expired_initial_payment_cascades_to_subscription() {
    let config = EngineConfig::default().with_purchase_expires_after(Duration::seconds(2));
    let h = harness(membership_adapter(), config);

    let prepared = h
        .engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &h.cancel)
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(3));
    h.adapter
        .queue_transaction_probe(TransactionProbe::Canceled {
            canceled_at: h.clock.now(),
        });
    h.engine
        .check_transactions(PROVIDER, &LogSink, &h.cancel)
        .await
        .unwrap();

    let tx = h
        .engine
        .transaction(PROVIDER, &prepared.transaction.transaction_id)
        .await
        .unwrap();
    assert_eq!(tx.status(), TransactionStatus::Canceled);

    let sub = h
        .engine
        .subscription(PROVIDER, &prepared.subscription.original_transaction_id)
        .await
        .unwrap();
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn test_expired_initial_payment_without_cascade_leaves_pending() {
    let config = EngineConfig::default()
        .with_purchase_expires_after(Duration::seconds(2))
        .with_expired_payment_cascade(false);
    let h = harness(membership_adapter(), config);

    let prepared = h
        .engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &h.cancel)
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(3));
    h.adapter
        .queue_transaction_probe(TransactionProbe::Canceled {
            canceled_at: h.clock.now(),
        });
    h.engine
        .check_transactions(PROVIDER, &LogSink, &h.cancel)
        .await
        .unwrap();

    let sub = h
        .engine
        .subscription(PROVIDER, &prepared.subscription.original_transaction_id)
        .await
        .unwrap();
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Pending);
}

#[tokio::test]
async fn test_batch_continues_past_provider_errors() {
    let adapter = tollgate::infrastructure::mock::MockProviderAdapter::new(PROVIDER)
        .with_product(coin_pack());
    let h = harness(adapter, EngineConfig::default());

    let first = h
        .engine
        .prepare_purchase(PROVIDER, &purchase_request("coins-100"), &h.cancel)
        .await
        .unwrap();
    let second = h
        .engine
        .prepare_purchase(PROVIDER, &purchase_request("coins-100"), &h.cancel)
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(20));
    // Pending transactions are polled in creation order: the first probe
    // blows up, the second succeeds.
    h.adapter.queue_transaction_probe_error("gateway timeout");
    h.adapter.queue_transaction_probe(TransactionProbe::Success {
        purchased_at: h.clock.now(),
    });

    let sink = CollectingSink::default();
    let report = h
        .engine
        .check_transactions(PROVIDER, &sink, &h.cancel)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    let reported = sink.reported();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, first.transaction.transaction_id);

    // The failed one is untouched and will be polled again next pass.
    let tx1 = h
        .engine
        .transaction(PROVIDER, &first.transaction.transaction_id)
        .await
        .unwrap();
    assert_eq!(tx1.status(), TransactionStatus::Pending);
    let tx2 = h
        .engine
        .transaction(PROVIDER, &second.transaction.transaction_id)
        .await
        .unwrap();
    assert_eq!(tx2.status(), TransactionStatus::Completed);
}

#[tokio::test]
async fn test_uncompleted_subscription_linkage_via_poll() {
    let h = harness(membership_adapter(), EngineConfig::default());

    let prepared = h
        .engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &h.cancel)
        .await
        .unwrap();
    let orig = prepared.subscription.original_transaction_id.clone();
    h.engine
        .handle_callback(
            PROVIDER,
            &payment_confirmed(&prepared.transaction.transaction_id, h.clock.now()),
            &h.cancel,
        )
        .await
        .unwrap();

    // The subscribed callback never arrived; the reconciler asks directly.
    h.adapter
        .queue_subscription_probe(SubscriptionProbe::Subscribed {
            subscribed_at: h.clock.now(),
        });
    let report = h
        .engine
        .check_uncompleted_subscription(PROVIDER, &LogSink, &h.cancel)
        .await
        .unwrap();
    assert_eq!(report.processed, 1);

    let sub = h.engine.subscription(PROVIDER, &orig).await.unwrap();
    assert!(sub.renewal_enabled);

    // Once linked it drops out of the unlinked set.
    let report = h
        .engine
        .check_uncompleted_subscription(PROVIDER, &LogSink, &h.cancel)
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn test_uncompleted_subscription_canceled_at_provider() {
    let h = harness(membership_adapter(), EngineConfig::default());

    let prepared = h
        .engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &h.cancel)
        .await
        .unwrap();
    let orig = prepared.subscription.original_transaction_id.clone();
    h.engine
        .handle_callback(
            PROVIDER,
            &payment_confirmed(&prepared.transaction.transaction_id, h.clock.now()),
            &h.cancel,
        )
        .await
        .unwrap();

    h.adapter
        .queue_subscription_probe(SubscriptionProbe::Canceled {
            canceled_at: h.clock.now(),
        });
    h.engine
        .check_uncompleted_subscription(PROVIDER, &LogSink, &h.cancel)
        .await
        .unwrap();

    let sub = h.engine.subscription(PROVIDER, &orig).await.unwrap();
    assert_eq!(sub.status(h.clock.now()), SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn test_subscription_outside_renewal_window_is_left_alone() {
    let h = harness(membership_adapter(), EngineConfig::default());

    let prepared = h
        .engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &h.cancel)
        .await
        .unwrap();
    let orig = prepared.subscription.original_transaction_id.clone();
    h.engine
        .handle_callback(
            PROVIDER,
            &payment_confirmed(&prepared.transaction.transaction_id, h.clock.now()),
            &h.cancel,
        )
        .await
        .unwrap();
    h.engine
        .handle_callback(PROVIDER, &subscribed(&orig, h.clock.now()), &h.cancel)
        .await
        .unwrap();

    // 30 days of coverage remain against a 1 day renewal window; the
    // (empty) recharge script must not be consulted.
    let report = h
        .engine
        .check_subscription_renewal(PROVIDER, &LogSink, &h.cancel)
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_action_drain_is_idempotent() {
    let h = harness(membership_adapter(), EngineConfig::default());

    let prepared = h
        .engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &h.cancel)
        .await
        .unwrap();
    let orig = prepared.subscription.original_transaction_id.clone();
    h.engine
        .handle_callback(
            PROVIDER,
            &payment_confirmed(&prepared.transaction.transaction_id, h.clock.now()),
            &h.cancel,
        )
        .await
        .unwrap();
    h.engine
        .cancel_subscription(PROVIDER, &orig, &h.cancel)
        .await
        .unwrap();

    // One activation notification plus one provider-side cancel.
    let report = h
        .engine
        .run_pending_actions(PROVIDER, &h.cancel)
        .await
        .unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(h.adapter.canceled_contracts(), vec![orig.clone()]);

    // Completed actions stay done.
    let report = h
        .engine
        .run_pending_actions(PROVIDER, &h.cancel)
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(h.adapter.canceled_contracts(), vec![orig]);
}

#[tokio::test]
async fn test_cancellation_token_stops_reconciliation() {
    let h = harness(membership_adapter(), EngineConfig::default());
    h.cancel.cancel();

    let result = h
        .engine
        .check_transactions(PROVIDER, &LogSink, &h.cancel)
        .await;
    assert!(matches!(result, Err(EngineError::Canceled)));

    let result = h
        .engine
        .check_subscription_renewal(PROVIDER, &LogSink, &h.cancel)
        .await;
    assert!(matches!(result, Err(EngineError::Canceled)));
}

#[tokio::test]
async fn test_action_worker_drains_in_background() {
    use std::sync::Arc;
    use tollgate::application::actions::ActionWorker;
    use tollgate::application::engine::PaymentEngine;
    use tollgate::application::registry::ProviderRegistry;
    use tollgate::clock::ManualClock;
    use tollgate::infrastructure::in_memory::InMemoryRepository;
    use tokio_util::sync::CancellationToken;

    let adapter = Arc::new(membership_adapter());
    let clock = ManualClock::starting_at(start_time());
    let mut registry = ProviderRegistry::new();
    registry.register(adapter.clone());
    let engine = Arc::new(PaymentEngine::new(
        registry,
        Arc::new(InMemoryRepository::new()),
        Arc::new(clock.clone()),
        EngineConfig::default(),
    ));
    let cancel = CancellationToken::new();

    let prepared = engine
        .prepare_subscription(PROVIDER, &subscription_request("plan-monthly"), &cancel)
        .await
        .unwrap();
    let orig = prepared.subscription.original_transaction_id.clone();
    engine
        .handle_callback(
            PROVIDER,
            &payment_confirmed(&prepared.transaction.transaction_id, clock.now()),
            &cancel,
        )
        .await
        .unwrap();
    engine
        .cancel_subscription(PROVIDER, &orig, &cancel)
        .await
        .unwrap();

    let worker = ActionWorker::spawn(engine.clone());
    worker.drain(PROVIDER).await.unwrap();
    // Shutdown runs after the queued drain; awaiting it proves the drain
    // finished.
    worker.shutdown().await.unwrap();

    assert_eq!(adapter.canceled_contracts(), vec![orig]);
    let report = engine.run_pending_actions(PROVIDER, &cancel).await.unwrap();
    assert_eq!(report.processed, 0);
}
