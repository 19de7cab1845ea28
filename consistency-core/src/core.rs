//! Consistency core
//!
//! This module ties together storage, the store actor, the identifier
//! allocator and the transfer engine into the API callers use.
//!
//! # Example
//!
//! ```no_run
//! use consistency_core::{Config, ConsistencyCore, EntityClass};
//!
//! #[tokio::main]
//! async fn main() -> consistency_core::Result<()> {
//!     let core = ConsistencyCore::open(Config::default()).await?;
//!
//!     let member_id = core.allocate_identifier(EntityClass::Member).await?;
//!     println!("new member: {}", member_id);
//!
//!     core.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_store_actor, StoreHandle},
    allocator::IdentifierAllocator,
    config::RetryConfig,
    metrics::Metrics,
    store::LedgerStore,
    transfer::LedgerTransferEngine,
    types::{
        Account, AccountId, EntityClass, EntryDisposition, EntryKind, Identifier, LedgerEntry,
        ReassignOutcome, Reconciliation, SequenceCounter,
    },
    Config, Error, Result, Storage, StorageStats,
};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Entry point for identifier allocation and ledger transfers
pub struct ConsistencyCore {
    /// Actor handle for writes
    handle: StoreHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    allocator: IdentifierAllocator<StoreHandle>,

    transfers: LedgerTransferEngine<StoreHandle>,

    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for ConsistencyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCore")
            .field("data_dir", &self.config.data_dir)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ConsistencyCore {
    /// Open the core with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let handle = spawn_store_actor(
            storage.clone(),
            config.store.mailbox_capacity,
            config.store.request_timeout(),
            metrics.clone(),
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = %config.data_dir.display(),
            "Consistency core opened"
        );

        Ok(Self {
            allocator: IdentifierAllocator::new(handle.clone(), config.identifiers.clone()),
            transfers: LedgerTransferEngine::new(handle.clone()),
            handle,
            storage,
            metrics,
            config,
        })
    }

    /// Stop the store actor.
    ///
    /// Requests queued before the call still complete. Returns once the
    /// actor has exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await?;
        tracing::info!("Consistency core shut down");
        Ok(())
    }

    // Identifiers

    /// Issue the next identifier for `entity_class`, e.g. `M001`
    pub async fn allocate_identifier(&self, entity_class: EntityClass) -> Result<Identifier> {
        let identifier = self
            .with_retry("allocate_identifier", || self.allocator.allocate(entity_class))
            .await?;

        self.metrics.record_identifier(entity_class.as_str());
        tracing::info!(
            entity_class = %entity_class,
            value = identifier.value(),
            identifier = %identifier,
            "Identifier allocated"
        );

        Ok(identifier)
    }

    /// Issue an identifier bound to a creation key.
    ///
    /// Callers that saw [`Error::OutcomeUnknown`] repeat the call with the
    /// same key and receive the identifier issued the first time.
    pub async fn allocate_identifier_with_key(
        &self,
        entity_class: EntityClass,
        key: impl Into<String>,
    ) -> Result<Identifier> {
        let key = key.into();
        let identifier = self
            .with_retry("allocate_identifier_with_key", || {
                self.allocator.allocate_with_key(entity_class, key.clone())
            })
            .await?;

        self.metrics.record_identifier(entity_class.as_str());
        tracing::info!(
            entity_class = %entity_class,
            value = identifier.value(),
            identifier = %identifier,
            key = %key,
            "Identifier allocated"
        );

        Ok(identifier)
    }

    // Suspense

    /// Credit a suspense entry to a member account
    pub async fn reassign_suspense_entry(
        &self,
        entry_id: Uuid,
        account_id: &AccountId,
        description: impl Into<String>,
    ) -> Result<ReassignOutcome> {
        let description = description.into();
        let result = self
            .with_retry("reassign_suspense_entry", || {
                self.transfers
                    .reassign(entry_id, account_id, description.clone())
            })
            .await;

        match result {
            Ok(new_entry_id) => {
                self.metrics.record_reassignment();
                Ok(ReassignOutcome { new_entry_id })
            }
            Err(e) => {
                if e.is_already_handled() {
                    self.metrics.record_reassign_conflict();
                }
                tracing::warn!(
                    entry_id = %entry_id,
                    account_id = %account_id,
                    error = %e,
                    "Reassignment rejected"
                );
                Err(e)
            }
        }
    }

    /// Retire a suspense entry without crediting anyone
    pub async fn abandon_suspense_entry(&self, entry_id: Uuid) -> Result<()> {
        self.with_retry("abandon_suspense_entry", || self.transfers.abandon(entry_id))
            .await
    }

    /// Record a payment that could not be matched to a member
    pub async fn record_suspense_payment(
        &self,
        amount: Decimal,
        reference: Option<String>,
    ) -> Result<Uuid> {
        self.with_retry("record_suspense_payment", || {
            self.transfers.record_suspense(amount, reference.clone())
        })
        .await
    }

    /// How a suspense entry left suspense, if it has
    pub fn reassignment_status(&self, entry_id: Uuid) -> Result<Option<EntryDisposition>> {
        self.transfers.resolve(entry_id)
    }

    // Accounts

    /// Open an empty account owned by a member
    pub async fn open_account(
        &self,
        account_id: AccountId,
        owner_member_id: Identifier,
    ) -> Result<Account> {
        if owner_member_id.entity_class() != EntityClass::Member {
            return Err(Error::InvalidRequest(format!(
                "Account owner must be a member, got {}",
                owner_member_id
            )));
        }

        let account = Account::open(account_id, owner_member_id);
        let account = self
            .with_retry("open_account", || self.transfers.open_account(account.clone()))
            .await?;

        tracing::info!(
            account_id = %account.account_id,
            owner = %account.owner_member_id,
            "Account opened"
        );

        Ok(account)
    }

    /// Post a contribution, disbursement or wallet funding
    pub async fn post_entry(
        &self,
        account_id: &AccountId,
        amount: Decimal,
        kind: EntryKind,
        reference: Option<String>,
        description: Option<String>,
    ) -> Result<Uuid> {
        self.with_retry("post_entry", || {
            self.transfers.post(
                account_id,
                amount,
                kind,
                reference.clone(),
                description.clone(),
            )
        })
        .await
    }

    // Reads

    /// Current balance of an account
    pub fn account_balance(&self, account_id: &AccountId) -> Result<Decimal> {
        self.handle.get_account_balance(account_id)
    }

    /// Account by ID
    pub fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.storage.get_account(account_id)
    }

    /// Entry by ID
    pub fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.handle.get_entry(entry_id)
    }

    /// Entries still waiting in suspense
    pub fn suspense_entries(&self) -> Result<Vec<LedgerEntry>> {
        self.storage.list_suspense_entries()
    }

    /// Entries attributed to an account
    pub fn account_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.storage.list_account_entries(account_id)
    }

    /// Counter state for an entity class, if it has been used
    pub fn sequence_counter(&self, entity_class: EntityClass) -> Result<Option<SequenceCounter>> {
        self.storage.get_counter(entity_class)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    // Checks

    /// Compare an account's balance with the sum of its entries
    pub fn reconcile_account(&self, account_id: &AccountId) -> Result<Reconciliation> {
        let (account, entries) = self.storage.account_with_entries(account_id)?;
        let ledger_sum = entries.iter().map(|e| e.amount).sum::<Decimal>();

        let reconciliation = Reconciliation {
            account_id: account.account_id,
            balance: account.balance,
            ledger_sum,
            entry_count: entries.len(),
        };

        if !reconciliation.is_balanced() {
            tracing::error!(
                account_id = %reconciliation.account_id,
                balance = %reconciliation.balance,
                ledger_sum = %reconciliation.ledger_sum,
                "Balance drift detected"
            );
        }

        Ok(reconciliation)
    }

    /// Reconcile every account
    pub fn reconcile_all(&self) -> Result<Vec<Reconciliation>> {
        self.storage
            .list_accounts()?
            .iter()
            .map(|account| self.reconcile_account(&account.account_id))
            .collect()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Transfer engine, for composing custom transactions
    pub fn transfers(&self) -> &LedgerTransferEngine<StoreHandle> {
        &self.transfers
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_transient(&self.config.retry, &self.metrics, operation, attempt).await
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the policy's
/// attempts are used up.
///
/// Only [`Error::StoreUnavailable`] is retried. It is raised before a
/// request reaches the writer or when the write itself failed, so
/// repeating it cannot apply an operation twice.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryConfig,
    metrics: &Metrics,
    operation: &'static str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_transient() && retry + 1 < policy.max_attempts => {
                retry += 1;
                let delay = policy.backoff(retry);
                metrics.record_retry();
                tracing::warn!(
                    operation,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}
