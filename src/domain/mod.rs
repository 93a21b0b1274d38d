pub mod transaction;

pub use transaction::{
    CorrelationIds, LinkedRecord, NewTransaction, Transaction, TransactionKind, TransactionStatus,
};
