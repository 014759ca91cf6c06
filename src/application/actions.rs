use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::action::{Action, ActionKind};
use crate::error::{EngineError, Result};

use super::engine::PaymentEngine;
use super::reconcile::BatchReport;

impl PaymentEngine {
    /// Drains the persisted action queue for one provider.
    ///
    /// Actions are at-least-once: a crash after the handler ran but before
    /// the record was marked leaves it pending, and the next drain re-runs
    /// it. Handlers tolerate that.
    pub async fn run_pending_actions(
        &self,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        self.ensure_live(cancel)?;
        let pending = self.repository.list_pending_actions(provider).await?;

        let mut report = BatchReport::default();
        for mut action in pending {
            self.ensure_live(cancel)?;
            action.attempts += 1;
            match self.run_action(&action).await {
                Ok(()) => {
                    action.completed_at = Some(self.clock.now());
                    match self.repository.update_action(&action).await {
                        Ok(_) => report.processed += 1,
                        // A concurrent drain already finished it.
                        Err(EngineError::Conflict { .. }) => report.processed += 1,
                        Err(other) => return Err(other),
                    }
                }
                Err(error) => {
                    warn!(action_id = %action.id, %error, "action failed; left pending");
                    if let Err(update_error) = self.repository.update_action(&action).await
                        && !matches!(update_error, EngineError::Conflict { .. })
                    {
                        return Err(update_error);
                    }
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn run_action(&self, action: &Action) -> Result<()> {
        match &action.kind {
            ActionKind::CancelAtProvider {
                original_transaction_id,
            } => {
                let adapter = self.registry.adapter(&action.provider)?;
                let sub = self
                    .require_subscription(&action.provider, original_transaction_id)
                    .await?;
                let context = self.original_context(&sub).await?;
                adapter.cancel_subscription(&context).await?;
                Ok(())
            }
            ActionKind::SubscriptionActivated {
                original_transaction_id,
                user_id,
            } => {
                info!(
                    provider = %action.provider,
                    original_transaction_id,
                    user_id,
                    "subscription activated"
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
enum WorkerCommand {
    Drain(String),
    Shutdown,
}

/// Background drain loop for the action queue.
///
/// Transition paths enqueue persisted actions and nudge this worker, so
/// provider-facing side effects never block the triggering call. Crash
/// recovery does not depend on the worker: any later drain picks pending
/// actions up again.
pub struct ActionWorker {
    sender: mpsc::Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

impl ActionWorker {
    pub fn spawn(engine: Arc<PaymentEngine>) -> Self {
        let (sender, mut receiver) = mpsc::channel(256);
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            while let Some(command) = receiver.recv().await {
                match command {
                    WorkerCommand::Drain(provider) => {
                        if let Err(error) = engine.run_pending_actions(&provider, &cancel).await {
                            warn!(provider, %error, "action drain failed");
                        }
                    }
                    WorkerCommand::Shutdown => break,
                }
            }
        });
        Self { sender, handle }
    }

    /// Asks the worker to drain one provider's queue. Returns as soon as
    /// the command is enqueued.
    pub async fn drain(&self, provider: &str) -> Result<()> {
        self.sender
            .send(WorkerCommand::Drain(provider.to_string()))
            .await
            .map_err(|_| {
                EngineError::internal(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "action worker channel closed",
                ))
            })
    }

    /// Stops the worker after it finishes queued commands.
    pub async fn shutdown(self) -> Result<()> {
        self.sender
            .send(WorkerCommand::Shutdown)
            .await
            .map_err(|_| {
                EngineError::internal(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "action worker channel closed",
                ))
            })?;
        self.handle.await.map_err(EngineError::internal)
    }
}
