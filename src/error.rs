use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// The kind of aggregate an error refers to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AggregateKind {
    Transaction,
    Subscription,
    Action,
}

impl std::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateKind::Transaction => write!(f, "transaction"),
            AggregateKind::Subscription => write!(f, "subscription"),
            AggregateKind::Action => write!(f, "action"),
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    #[error("unknown provider: {provider}")]
    #[diagnostic(
        code(tollgate::unknown_provider),
        help("Register the provider adapter before use")
    )]
    UnknownProvider { provider: String },

    #[error("unknown product {product_id} at provider {provider}")]
    #[diagnostic(code(tollgate::unknown_product))]
    UnknownProduct {
        provider: String,
        product_id: String,
    },

    #[error("product {product_id} cannot be used here: {reason}")]
    #[diagnostic(code(tollgate::invalid_product))]
    InvalidProduct { product_id: String, reason: String },

    #[error("duplicate {kind}: {id}")]
    #[diagnostic(code(tollgate::duplicate_aggregate))]
    DuplicateAggregate { kind: AggregateKind, id: String },

    #[error("{kind} not found: {id}")]
    #[diagnostic(code(tollgate::not_found))]
    NotFound { kind: AggregateKind, id: String },

    #[error("optimistic lock conflict on {kind} {id}")]
    #[diagnostic(
        code(tollgate::conflict),
        help("Re-read the aggregate and retry the update")
    )]
    Conflict { kind: AggregateKind, id: String },

    #[error("conflicting terminal transition on {id}: {detail}")]
    #[diagnostic(code(tollgate::conflicting_terminal_transition))]
    ConflictingTerminalTransition { id: String, detail: String },

    #[error("callback rejected: {reason}")]
    #[diagnostic(code(tollgate::callback_rejected))]
    CallbackRejected { reason: String },

    #[error("unrecognized event: {event}")]
    #[diagnostic(
        code(tollgate::unrecognized_event),
        help("Return a non-retry response to the provider")
    )]
    UnrecognizedEvent { event: String },

    #[error("provider {provider} failed during {operation}: {detail}")]
    #[diagnostic(code(tollgate::provider_failure))]
    ProviderFailure {
        provider: String,
        operation: String,
        detail: String,
    },

    #[error("provider {provider} does not support {operation}")]
    #[diagnostic(code(tollgate::unsupported_operation))]
    UnsupportedOperation {
        provider: String,
        operation: &'static str,
    },

    #[error("operation canceled")]
    #[diagnostic(code(tollgate::canceled))]
    Canceled,

    #[cfg(feature = "rocksdb-backend")]
    #[error("storage error")]
    #[diagnostic(code(tollgate::storage_error))]
    StorageError(#[from] rocksdb::Error),

    #[error("internal error")]
    #[diagnostic(code(tollgate::internal_error))]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn internal(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::InternalError(Box::new(error))
    }
}
