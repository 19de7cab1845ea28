//! Error types for the consistency core

use crate::types::AccountId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for consistency core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consistency core errors
#[derive(Error, Debug)]
pub enum Error {
    /// The store could not be reached or refused the write. Nothing was applied.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The request reached the store but its outcome was never reported back
    #[error("Outcome unknown: {0}")]
    OutcomeUnknown(String),

    /// Ledger entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Suspense entry was already attributed to an account
    #[error("Entry {entry_id} already assigned")]
    AlreadyAssigned {
        /// The suspense entry
        entry_id: Uuid,
        /// Entry created by the winning reassignment, when known
        new_entry_id: Option<Uuid>,
    },

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Account already exists
    #[error("Account already exists: {0}")]
    AccountExists(AccountId),

    /// Conditional balance check failed inside a transaction
    #[error("Balance conflict on {account_id}: expected {expected}, found {actual}")]
    BalanceConflict {
        /// Account checked
        account_id: AccountId,
        /// Balance the caller expected
        expected: rust_decimal::Decimal,
        /// Balance inside the transaction
        actual: rust_decimal::Decimal,
    },

    /// Malformed request (bad identifier, zero amount, duplicate entry id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invariant violation (entry changed under us, counter regression, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transient failures a caller may retry with backoff.
    ///
    /// `OutcomeUnknown` is deliberately excluded: the request may have been
    /// applied, so retrying blindly could consume a second sequence value.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Expected race outcome, to be shown as "already handled"
    pub fn is_already_handled(&self) -> bool {
        matches!(self, Error::AlreadyAssigned { .. })
    }

    /// Permanent failures that stem from the caller's input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EntryNotFound(_)
                | Error::AccountNotFound(_)
                | Error::AccountExists(_)
                | Error::InvalidRequest(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}
