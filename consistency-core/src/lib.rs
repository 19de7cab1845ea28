//! Consistency Core
//!
//! Race-free sequential identifiers and atomic suspense reassignment for a
//! member ledger.
//!
//! # Architecture
//!
//! - **Single Writer**: One actor task applies every counter bump and ledger transaction
//! - **Ordered Steps**: A transfer is one list of steps, committed as one RocksDB batch
//! - **Dispositions**: Entries leaving suspense leave a record of where they went
//!
//! # Invariants
//!
//! - Identifiers are unique per entity class and never reused
//! - Account balance == Σ(entries attributed to the account)
//! - A suspense entry is reassigned at most once
//! - A failed transaction leaves no partial writes

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod allocator;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod types;

// Re-exports
pub use crate::core::ConsistencyCore;
pub use config::Config;
pub use error::{Error, Result};
pub use storage::{Storage, StorageStats};
pub use types::{
    Account, AccountId, EntityClass, EntryDisposition, EntryKind, Identifier, LedgerEntry,
    ReassignOutcome, Reconciliation,
};
