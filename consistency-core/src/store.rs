//! Store contracts
//!
//! The allocator and the transfer engine only see these traits, so the
//! RocksDB-backed actor can be swapped for another transactional store.
//!
//! # Transactions
//!
//! A transaction is an ordered list of [`TxStep`]s. Steps run in order
//! against a private view of the store: later steps observe the writes of
//! earlier ones, nothing is visible to other readers until the whole list
//! has succeeded, and any failing step discards every write.

use crate::types::{Account, AccountId, EntityClass, EntryDisposition, LedgerEntry};
use crate::Result;
use rust_decimal::Decimal;
use std::future::Future;
use uuid::Uuid;

/// Durable per-class counters with atomic increment-and-fetch
pub trait SequenceStore: Send + Sync {
    /// Issue the next value for `entity_class`.
    ///
    /// Never returns the same value twice for one class. On first use the
    /// counter is seeded so the first value equals `start_from`.
    fn next_value(
        &self,
        entity_class: EntityClass,
        start_from: u64,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Like [`next_value`](Self::next_value), but a repeated `key` returns
    /// the value issued the first time instead of consuming a new one.
    fn next_value_for_key(
        &self,
        entity_class: EntityClass,
        start_from: u64,
        key: String,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// Account and entry storage with all-or-nothing multi-step writes
pub trait LedgerStore: Send + Sync {
    /// Execute `steps` as one atomic, isolated unit of work
    fn run_transaction(&self, steps: Vec<TxStep>) -> impl Future<Output = Result<TxReceipt>> + Send;

    /// Current balance (display only; never feed into a later write)
    fn get_account_balance(&self, account_id: &AccountId) -> Result<Decimal>;

    /// Entry by ID (display only)
    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry>;

    /// How a retired suspense entry left suspense, if it did
    fn get_disposition(&self, entry_id: Uuid) -> Result<Option<EntryDisposition>>;
}

/// One step of a ledger transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TxStep {
    /// Record the account in the receipt (`AccountNotFound` if absent)
    ReadAccount {
        /// Account to read
        account_id: AccountId,
    },

    /// Record the entry in the receipt (`EntryNotFound` if absent)
    ReadEntry {
        /// Entry to read
        entry_id: Uuid,
    },

    /// Entry must exist, be unassigned, and carry `amount`
    ExpectSuspense {
        /// Suspense entry
        entry_id: Uuid,
        /// Amount observed when the transaction was planned
        amount: Decimal,
    },

    /// Conditional write guard on the balance as seen inside the transaction
    ExpectBalance {
        /// Account checked
        account_id: AccountId,
        /// Required balance
        expected: Decimal,
    },

    /// Insert a new account (`AccountExists` if present)
    CreateAccount(Account),

    /// Re-read the balance and add `amount` to it
    CreditAccount {
        /// Account credited (negative amounts debit)
        account_id: AccountId,
        /// Signed amount
        amount: Decimal,
    },

    /// Insert a new entry
    InsertEntry(LedgerEntry),

    /// Delete a suspense entry (attributed entries are immutable)
    DeleteEntry {
        /// Entry to delete
        entry_id: Uuid,
    },

    /// Record how a suspense entry was retired
    RecordDisposition {
        /// Retired entry
        entry_id: Uuid,
        /// Terminal disposition
        disposition: EntryDisposition,
    },
}

impl TxStep {
    /// Short step name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TxStep::ReadAccount { .. } => "read_account",
            TxStep::ReadEntry { .. } => "read_entry",
            TxStep::ExpectSuspense { .. } => "expect_suspense",
            TxStep::ExpectBalance { .. } => "expect_balance",
            TxStep::CreateAccount(_) => "create_account",
            TxStep::CreditAccount { .. } => "credit_account",
            TxStep::InsertEntry(_) => "insert_entry",
            TxStep::DeleteEntry { .. } => "delete_entry",
            TxStep::RecordDisposition { .. } => "record_disposition",
        }
    }
}

/// What a committed transaction observed and produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxReceipt {
    /// Accounts recorded by `ReadAccount`
    pub accounts: Vec<Account>,

    /// Entries recorded by `ReadEntry`
    pub entries: Vec<LedgerEntry>,

    /// Balance after each `CreditAccount`, in step order
    pub balances: Vec<(AccountId, Decimal)>,

    /// Entries created by `InsertEntry`, in step order
    pub inserted: Vec<Uuid>,
}

impl TxReceipt {
    /// Final balance of an account credited in this transaction
    pub fn balance_of(&self, account_id: &AccountId) -> Option<Decimal> {
        self.balances
            .iter()
            .rev()
            .find(|(id, _)| id == account_id)
            .map(|(_, balance)| *balance)
    }
}
