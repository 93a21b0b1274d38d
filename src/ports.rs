use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{CorrelationIds, NewTransaction, Transaction, TransactionStatus};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("transaction not found: {0}")]
    NotFound(String),

    #[error("invalid transition on {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Persistence and state-transition enforcement for [`Transaction`]
/// entries. All three entry points (initiation, callbacks, sweeps) race
/// only through this trait; implementations must make [`transition`]
/// atomic per row (compare-and-set on status) so that at most one
/// terminal transition wins.
///
/// [`transition`]: TransactionLedger::transition
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Inserts a Pending entry. Rejects non-positive amounts.
    async fn create(&self, new: NewTransaction) -> LedgerResult<Transaction>;

    /// Records gateway-issued identifiers after a successful initiate
    /// call. Must run before any callback can be matched; rejects a
    /// matching key already in use by another entry.
    async fn attach_correlation(&self, id: Uuid, ids: CorrelationIds)
        -> LedgerResult<Transaction>;

    async fn find_by_id(&self, id: Uuid) -> LedgerResult<Transaction>;

    /// Indexed lookup by checkout request id or conversation id; the
    /// path callbacks and sweeps use to match notifications.
    async fn find_by_correlation(&self, correlation_id: &str) -> LedgerResult<Transaction>;

    /// Moves an entry to a terminal state. A receipt reference may only
    /// accompany a Success transition; when the entry is linked to a
    /// sale or purchase order, the receipt stamp on that record happens
    /// in the same storage transaction. Attempts against an already
    /// terminal entry return [`LedgerError::InvalidTransition`] so
    /// callers can log duplicate or late callbacks.
    async fn transition(
        &self,
        id: Uuid,
        to: TransactionStatus,
        detail: &str,
        receipt: Option<&str>,
    ) -> LedgerResult<Transaction>;

    /// Pending entries created before the cutoff, oldest first. Feeds
    /// the reconciliation engine.
    async fn list_stale_pending(&self, older_than: DateTime<Utc>) -> LedgerResult<Vec<Transaction>>;

    async fn list(&self, limit: i64, offset: i64) -> LedgerResult<Vec<Transaction>>;

    /// Total of the referenced sale, if it exists. Used to cap refunds.
    async fn sale_total(&self, sale_id: Uuid) -> LedgerResult<Option<BigDecimal>>;

    /// Storage connectivity check for the health endpoint.
    async fn ping(&self) -> LedgerResult<()>;
}
