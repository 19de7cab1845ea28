//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `sequences` - Identifier counters (key: entity class byte)
//! - `allocations` - Idempotency keys (key: entity class byte || key)
//! - `accounts` - Member wallets (key: account_id)
//! - `entries` - Ledger entries (key: entry_id)
//! - `indices` - Secondary indices (length-prefixed account || entry, suspense entries)
//! - `dispositions` - Tombstones of retired suspense entries (key: entry_id)
//!
//! Every mutation is a single `WriteBatch`, so readers observe either all
//! of a transaction or none of it. Mutations also serialize on an internal
//! write lock: a transaction's reads cannot go stale before its commit.

use crate::{
    error::{Error, Result},
    store::{TxReceipt, TxStep},
    types::{Account, AccountId, EntityClass, EntryDisposition, LedgerEntry, SequenceCounter},
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, Snapshot,
    WriteBatch, WriteOptions, DB,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_SEQUENCES: &str = "sequences";
const CF_ALLOCATIONS: &str = "allocations";
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_INDICES: &str = "indices";
const CF_DISPOSITIONS: &str = "dispositions";

const ALL_CFS: [&str; 6] = [
    CF_SEQUENCES,
    CF_ALLOCATIONS,
    CF_ACCOUNTS,
    CF_ENTRIES,
    CF_INDICES,
    CF_DISPOSITIONS,
];

/// Index key tags
const IDX_ACCOUNT: u8 = b'a';
const IDX_SUSPENSE: u8 = b's';

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,

    /// Held for the duration of every read-modify-write
    write_lock: Mutex<()>,

    /// fsync each commit
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_SEQUENCES, Self::cf_options_small()),
            ColumnFamilyDescriptor::new(CF_ALLOCATIONS, Self::cf_options_small()),
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_DISPOSITIONS, Self::cf_options_small()),
        ];

        // Fails if another process holds the directory lock
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            "Opened RocksDB at {:?} with {} column families",
            path,
            ALL_CFS.iter().filter(|name| db.cf_handle(name).is_some()).count()
        );

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            sync_writes: config.store.sync_writes,
        })
    }

    // Column family options

    fn cf_options_small() -> Options {
        Options::default()
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helpers

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::StoreUnavailable(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn get_record<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(cf)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    // Sequence operations

    /// Atomically bump the counter of `entity_class` and return the new value.
    ///
    /// With a `key`, a value previously issued under the same key is returned
    /// instead and the counter is left alone.
    pub fn next_sequence_value(
        &self,
        entity_class: EntityClass,
        start_from: u64,
        key: Option<&str>,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let allocation_key = key.map(|key| Self::allocation_key(entity_class, key));
        if let Some(ref allocation_key) = allocation_key {
            if let Some(bytes) = self.db.get_cf(&self.cf(CF_ALLOCATIONS)?, allocation_key)? {
                let value = Self::decode_u64(&bytes)?;
                tracing::debug!(
                    entity_class = %entity_class,
                    value,
                    "Allocation key replayed"
                );
                return Ok(value);
            }
        }

        let class_key = [entity_class as u8];
        let mut counter = self
            .get_record::<SequenceCounter>(CF_SEQUENCES, &class_key)?
            .unwrap_or_else(|| SequenceCounter::seeded(entity_class, start_from));
        let value = counter.bump()?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_SEQUENCES)?, class_key, bincode::serialize(&counter)?);
        if let Some(ref allocation_key) = allocation_key {
            batch.put_cf(&self.cf(CF_ALLOCATIONS)?, allocation_key, value.to_be_bytes());
        }
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(entity_class = %entity_class, value, "Sequence value issued");

        Ok(value)
    }

    /// Counter row of a class, if it has issued anything yet
    pub fn get_counter(&self, entity_class: EntityClass) -> Result<Option<SequenceCounter>> {
        self.get_record(CF_SEQUENCES, &[entity_class as u8])
    }

    // Ledger transactions

    /// Execute `steps` atomically; nothing is written unless every step succeeds
    pub fn run_transaction(&self, steps: &[TxStep]) -> Result<TxReceipt> {
        let _guard = self.write_lock.lock();

        let mut tx = TxContext::new(self);
        for (index, step) in steps.iter().enumerate() {
            if let Err(err) = tx.apply(step) {
                tracing::warn!(
                    step = index,
                    step_name = step.name(),
                    error = %err,
                    "Transaction rolled back"
                );
                return Err(err);
            }
        }

        let (batch, receipt) = tx.finish()?;
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(steps = steps.len(), "Transaction committed");

        Ok(receipt)
    }

    // Point reads

    /// Get account by ID
    pub fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.get_record(CF_ACCOUNTS, account_id.as_str().as_bytes())?
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.get_record(CF_ENTRIES, entry_id.as_bytes())?
            .ok_or(Error::EntryNotFound(entry_id))
    }

    /// Disposition of a retired suspense entry
    pub fn get_disposition(&self, entry_id: Uuid) -> Result<Option<EntryDisposition>> {
        self.get_record(CF_DISPOSITIONS, entry_id.as_bytes())
    }

    /// All accounts, in key order
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            accounts.push(bincode::deserialize(&value)?);
        }
        Ok(accounts)
    }

    /// Entries attributed to an account (via index)
    pub fn list_account_entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::index_key_account(account_id, None);
        self.entries_from_index(&prefix)
    }

    /// Unattributed entries (via index), oldest first
    pub fn list_suspense_entries(&self) -> Result<Vec<LedgerEntry>> {
        self.entries_from_index(&[IDX_SUSPENSE])
    }

    fn entries_from_index(&self, prefix: &[u8]) -> Result<Vec<LedgerEntry>> {
        let snapshot = self.db.snapshot();
        self.snapshot_entries(&snapshot, prefix)
    }

    /// Index scan and entry reads against one snapshot, so a commit landing
    /// mid-scan is either fully visible or not at all
    fn snapshot_entries(&self, snapshot: &Snapshot<'_>, prefix: &[u8]) -> Result<Vec<LedgerEntry>> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_indices = self.cf(CF_INDICES)?;

        let mut entries = Vec::new();
        for item in snapshot.iterator_cf(&cf_indices, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let entry_id = Self::entry_id_suffix(&key)?;
            let bytes = snapshot.get_cf(&cf_entries, entry_id.as_bytes())?.ok_or_else(|| {
                Error::InvariantViolation(format!("Index points at missing entry {}", entry_id))
            })?;
            entries.push(bincode::deserialize(&bytes)?);
        }
        Ok(entries)
    }

    /// Account together with its attributed entries, read from one snapshot
    pub fn account_with_entries(&self, account_id: &AccountId) -> Result<(Account, Vec<LedgerEntry>)> {
        let snapshot = self.db.snapshot();
        let cf_accounts = self.cf(CF_ACCOUNTS)?;

        let account: Account = match snapshot.get_cf(&cf_accounts, account_id.as_str().as_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => return Err(Error::AccountNotFound(account_id.clone())),
        };

        let prefix = Self::index_key_account(account_id, None);
        let entries = self.snapshot_entries(&snapshot, &prefix)?;

        Ok((account, entries))
    }

    // Key helpers

    fn allocation_key(entity_class: EntityClass, key: &str) -> Vec<u8> {
        let mut bytes = vec![entity_class as u8];
        bytes.extend_from_slice(key.as_bytes());
        bytes
    }

    /// `a || len(account_id) as u16 BE || account_id || entry_id`.
    ///
    /// The length prefix keeps one account's prefix from matching another
    /// account whose ID merely starts with it.
    fn index_key_account(account_id: &AccountId, entry_id: Option<Uuid>) -> Vec<u8> {
        let id = account_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(3 + id.len() + 16);
        key.push(IDX_ACCOUNT);
        key.extend_from_slice(&(id.len() as u16).to_be_bytes());
        key.extend_from_slice(id);
        if let Some(entry_id) = entry_id {
            key.extend_from_slice(entry_id.as_bytes());
        }
        key
    }

    fn index_key_suspense(entry_id: Uuid) -> Vec<u8> {
        let mut key = vec![IDX_SUSPENSE];
        key.extend_from_slice(entry_id.as_bytes());
        key
    }

    fn index_key_for(entry: &LedgerEntry) -> Vec<u8> {
        match &entry.account_id {
            Some(account_id) => Self::index_key_account(account_id, Some(entry.entry_id)),
            None => Self::index_key_suspense(entry.entry_id),
        }
    }

    fn entry_id_suffix(key: &[u8]) -> Result<Uuid> {
        if key.len() < 17 {
            return Err(Error::InvariantViolation("Truncated index key".to_string()));
        }
        let bytes: [u8; 16] = key[key.len() - 16..]
            .try_into()
            .map_err(|_| Error::InvariantViolation("Truncated index key".to_string()))?;
        Ok(Uuid::from_bytes(bytes))
    }

    fn decode_u64(bytes: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::InvariantViolation("Corrupt allocation record".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(CF_ACCOUNTS)?,
            total_entries: self.approximate_count(CF_ENTRIES)?,
            suspense_entries: self.scan_prefix(CF_INDICES, &[IDX_SUSPENSE])?.len() as u64,
        })
    }

    fn approximate_count(&self, cf: &str) -> Result<u64> {
        let cf = self.cf(cf)?;
        let prop = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate account count
    pub total_accounts: u64,
    /// Approximate entry count
    pub total_entries: u64,
    /// Exact number of entries in suspense
    pub suspense_entries: u64,
}

/// Private view of the store for one transaction
struct TxContext<'a> {
    storage: &'a Storage,

    /// `None` marks a deletion
    accounts: HashMap<AccountId, Option<Account>>,
    entries: HashMap<Uuid, Option<LedgerEntry>>,
    dispositions: HashMap<Uuid, EntryDisposition>,

    /// Index keys to add and remove
    index_puts: Vec<Vec<u8>>,
    index_deletes: Vec<Vec<u8>>,

    /// Balance change per account against the entries attributed to it
    balance_delta: HashMap<AccountId, Decimal>,
    entry_delta: HashMap<AccountId, Decimal>,

    receipt: TxReceipt,
}

impl<'a> TxContext<'a> {
    fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            accounts: HashMap::new(),
            entries: HashMap::new(),
            dispositions: HashMap::new(),
            index_puts: Vec::new(),
            index_deletes: Vec::new(),
            balance_delta: HashMap::new(),
            entry_delta: HashMap::new(),
            receipt: TxReceipt::default(),
        }
    }

    fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        match self.accounts.get(account_id) {
            Some(pending) => Ok(pending.clone()),
            None => self
                .storage
                .get_record(CF_ACCOUNTS, account_id.as_str().as_bytes()),
        }
    }

    fn entry(&self, entry_id: Uuid) -> Result<Option<LedgerEntry>> {
        match self.entries.get(&entry_id) {
            Some(pending) => Ok(pending.clone()),
            None => self.storage.get_record(CF_ENTRIES, entry_id.as_bytes()),
        }
    }

    fn disposition(&self, entry_id: Uuid) -> Result<Option<EntryDisposition>> {
        match self.dispositions.get(&entry_id) {
            Some(pending) => Ok(Some(pending.clone())),
            None => self.storage.get_disposition(entry_id),
        }
    }

    fn require_account(&self, account_id: &AccountId) -> Result<Account> {
        self.account(account_id)?
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }

    fn apply(&mut self, step: &TxStep) -> Result<()> {
        match step {
            TxStep::ReadAccount { account_id } => {
                let account = self.require_account(account_id)?;
                self.receipt.accounts.push(account);
            }

            TxStep::ReadEntry { entry_id } => {
                let entry = self.entry(*entry_id)?.ok_or(Error::EntryNotFound(*entry_id))?;
                self.receipt.entries.push(entry);
            }

            TxStep::ExpectSuspense { entry_id, amount } => {
                let entry = match self.entry(*entry_id)? {
                    Some(entry) => entry,
                    None => {
                        return Err(match self.disposition(*entry_id)? {
                            Some(EntryDisposition::Reassigned { new_entry_id, .. }) => {
                                Error::AlreadyAssigned {
                                    entry_id: *entry_id,
                                    new_entry_id: Some(new_entry_id),
                                }
                            }
                            _ => Error::EntryNotFound(*entry_id),
                        })
                    }
                };
                if !entry.is_suspense() {
                    return Err(Error::AlreadyAssigned {
                        entry_id: *entry_id,
                        new_entry_id: None,
                    });
                }
                if entry.amount != *amount {
                    return Err(Error::InvariantViolation(format!(
                        "Entry {} amount changed from {} to {}",
                        entry_id, amount, entry.amount
                    )));
                }
            }

            TxStep::ExpectBalance {
                account_id,
                expected,
            } => {
                let account = self.require_account(account_id)?;
                if account.balance != *expected {
                    return Err(Error::BalanceConflict {
                        account_id: account_id.clone(),
                        expected: *expected,
                        actual: account.balance,
                    });
                }
            }

            TxStep::CreateAccount(account) => {
                let id_len = account.account_id.as_str().len();
                if id_len == 0 || id_len > u16::MAX as usize {
                    return Err(Error::InvalidRequest(format!(
                        "Account ID must be 1..={} bytes, got {}",
                        u16::MAX,
                        id_len
                    )));
                }
                if self.account(&account.account_id)?.is_some() {
                    return Err(Error::AccountExists(account.account_id.clone()));
                }
                if !account.balance.is_zero() {
                    return Err(Error::InvalidRequest(
                        "Accounts open with a zero balance".to_string(),
                    ));
                }
                self.accounts
                    .insert(account.account_id.clone(), Some(account.clone()));
            }

            TxStep::CreditAccount { account_id, amount } => {
                let mut account = self.require_account(account_id)?;
                account.balance += *amount;
                *self.balance_delta.entry(account_id.clone()).or_default() += *amount;
                self.receipt
                    .balances
                    .push((account_id.clone(), account.balance));
                self.accounts.insert(account_id.clone(), Some(account));
            }

            TxStep::InsertEntry(entry) => {
                if entry.amount.is_zero() {
                    return Err(Error::InvalidRequest("Entry amount must be non-zero".to_string()));
                }
                if self.entry(entry.entry_id)?.is_some()
                    || self.disposition(entry.entry_id)?.is_some()
                {
                    return Err(Error::InvalidRequest(format!(
                        "Entry {} already exists",
                        entry.entry_id
                    )));
                }
                if let Some(ref account_id) = entry.account_id {
                    self.require_account(account_id)?;
                    *self.entry_delta.entry(account_id.clone()).or_default() += entry.amount;
                }
                self.index_puts.push(Storage::index_key_for(entry));
                self.receipt.inserted.push(entry.entry_id);
                self.entries.insert(entry.entry_id, Some(entry.clone()));
            }

            TxStep::DeleteEntry { entry_id } => {
                let entry = self.entry(*entry_id)?.ok_or(Error::EntryNotFound(*entry_id))?;
                if !entry.is_suspense() {
                    return Err(Error::InvalidRequest(format!(
                        "Entry {} is attributed and cannot be deleted",
                        entry_id
                    )));
                }
                let index_key = Storage::index_key_for(&entry);
                match self.index_puts.iter().position(|key| *key == index_key) {
                    Some(pos) => {
                        self.index_puts.remove(pos);
                    }
                    None => self.index_deletes.push(index_key),
                }
                self.entries.insert(*entry_id, None);
            }

            TxStep::RecordDisposition {
                entry_id,
                disposition,
            } => {
                if self.disposition(*entry_id)?.is_some() {
                    return Err(Error::InvariantViolation(format!(
                        "Entry {} already retired",
                        entry_id
                    )));
                }
                self.dispositions.insert(*entry_id, disposition.clone());
            }
        }

        Ok(())
    }

    /// Check commit-time invariants and build the write batch
    fn finish(self) -> Result<(WriteBatch, TxReceipt)> {
        for account_id in self.balance_delta.keys().chain(self.entry_delta.keys()) {
            let credited = self.balance_delta.get(account_id).copied().unwrap_or_default();
            let recorded = self.entry_delta.get(account_id).copied().unwrap_or_default();
            if credited != recorded {
                return Err(Error::InvariantViolation(format!(
                    "Balance of {} moved by {} but entries record {}",
                    account_id, credited, recorded
                )));
            }
        }

        for (entry_id, pending) in &self.entries {
            if pending.is_none() && !self.dispositions.contains_key(entry_id) {
                return Err(Error::InvariantViolation(format!(
                    "Entry {} deleted without a disposition",
                    entry_id
                )));
            }
        }

        let storage = self.storage;
        let cf_accounts = storage.cf(CF_ACCOUNTS)?;
        let cf_entries = storage.cf(CF_ENTRIES)?;
        let cf_indices = storage.cf(CF_INDICES)?;
        let cf_dispositions = storage.cf(CF_DISPOSITIONS)?;

        let mut batch = WriteBatch::default();

        for (account_id, pending) in &self.accounts {
            let key = account_id.as_str().as_bytes();
            match pending {
                Some(account) => batch.put_cf(&cf_accounts, key, bincode::serialize(account)?),
                None => batch.delete_cf(&cf_accounts, key),
            }
        }

        for (entry_id, pending) in &self.entries {
            match pending {
                Some(entry) => batch.put_cf(&cf_entries, entry_id.as_bytes(), bincode::serialize(entry)?),
                None => batch.delete_cf(&cf_entries, entry_id.as_bytes()),
            }
        }

        for key in &self.index_deletes {
            batch.delete_cf(&cf_indices, key);
        }
        for key in &self.index_puts {
            batch.put_cf(&cf_indices, key, b"");
        }

        for (entry_id, disposition) in &self.dispositions {
            batch.put_cf(
                &cf_dispositions,
                entry_id.as_bytes(),
                bincode::serialize(disposition)?,
            );
        }

        Ok((batch, self.receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryKind, Identifier};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.store.sync_writes = false;
        (config, temp_dir)
    }

    fn wallet(storage: &Storage, n: u64) -> AccountId {
        let member = Identifier::new(EntityClass::Member, n);
        let account = Account::open(AccountId::wallet_for(&member), member);
        let account_id = account.account_id.clone();
        storage
            .run_transaction(&[TxStep::CreateAccount(account)])
            .unwrap();
        account_id
    }

    fn suspense(storage: &Storage, cents: i64) -> LedgerEntry {
        let entry = LedgerEntry::suspense(Decimal::new(cents, 2), Some("REF-1".into()));
        storage
            .run_transaction(&[TxStep::InsertEntry(entry.clone())])
            .unwrap();
        entry
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        for name in ALL_CFS {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_sequence_starts_from_offset() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        assert_eq!(storage.next_sequence_value(EntityClass::Member, 50, None).unwrap(), 50);
        assert_eq!(storage.next_sequence_value(EntityClass::Member, 50, None).unwrap(), 51);
        // Classes are independent
        assert_eq!(storage.next_sequence_value(EntityClass::Case, 1, None).unwrap(), 1);

        let counter = storage.get_counter(EntityClass::Member).unwrap().unwrap();
        assert_eq!(counter.current_value, 51);
        assert_eq!(counter.start_from, 50);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let (config, _temp) = test_config();
        {
            let storage = Storage::open(&config).unwrap();
            storage.next_sequence_value(EntityClass::Case, 1, None).unwrap();
            storage.next_sequence_value(EntityClass::Case, 1, None).unwrap();
            storage.close().unwrap();
        }
        let storage = Storage::open(&config).unwrap();
        // A changed start offset does not rewind an existing counter
        assert_eq!(storage.next_sequence_value(EntityClass::Case, 1, None).unwrap(), 3);
    }

    #[test]
    fn test_allocation_key_replays() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let first = storage
            .next_sequence_value(EntityClass::Member, 1, Some("form-42"))
            .unwrap();
        let replay = storage
            .next_sequence_value(EntityClass::Member, 1, Some("form-42"))
            .unwrap();
        let other = storage
            .next_sequence_value(EntityClass::Member, 1, Some("form-43"))
            .unwrap();

        assert_eq!(first, replay);
        assert_eq!(other, first + 1);

        // The same key under another class is a separate allocation
        let case = storage
            .next_sequence_value(EntityClass::Case, 1, Some("form-42"))
            .unwrap();
        assert_eq!(case, 1);
    }

    #[test]
    fn test_credit_and_entry_commit_together() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account_id = wallet(&storage, 1);

        let entry = LedgerEntry::posted(
            account_id.clone(),
            Decimal::new(5000, 2),
            EntryKind::Contribution,
            None,
            None,
        );
        let receipt = storage
            .run_transaction(&[
                TxStep::InsertEntry(entry.clone()),
                TxStep::CreditAccount {
                    account_id: account_id.clone(),
                    amount: entry.amount,
                },
            ])
            .unwrap();

        assert_eq!(receipt.balance_of(&account_id), Some(Decimal::new(5000, 2)));
        assert_eq!(storage.get_account(&account_id).unwrap().balance, Decimal::new(5000, 2));
        assert_eq!(storage.list_account_entries(&account_id).unwrap().len(), 1);
    }

    #[test]
    fn test_unrecorded_credit_is_rejected() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account_id = wallet(&storage, 1);

        let result = storage.run_transaction(&[TxStep::CreditAccount {
            account_id: account_id.clone(),
            amount: Decimal::ONE,
        }]);

        assert!(matches!(result, Err(Error::InvariantViolation(_))));
        assert_eq!(storage.get_account(&account_id).unwrap().balance, Decimal::ZERO);
    }

    #[test]
    fn test_failed_step_discards_earlier_writes() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account_id = wallet(&storage, 1);
        let entry = suspense(&storage, 1000);

        let result = storage.run_transaction(&[
            TxStep::ExpectSuspense {
                entry_id: entry.entry_id,
                amount: entry.amount,
            },
            TxStep::CreditAccount {
                account_id: account_id.clone(),
                amount: entry.amount,
            },
            TxStep::DeleteEntry {
                entry_id: entry.entry_id,
            },
            TxStep::ExpectBalance {
                account_id: account_id.clone(),
                expected: Decimal::new(99, 0),
            },
        ]);

        assert!(matches!(result, Err(Error::BalanceConflict { .. })));
        assert_eq!(storage.get_account(&account_id).unwrap().balance, Decimal::ZERO);
        assert!(storage.get_entry(entry.entry_id).unwrap().is_suspense());
        assert_eq!(storage.list_suspense_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_read_your_writes() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account_id = wallet(&storage, 1);

        let entry = LedgerEntry::posted(
            account_id.clone(),
            Decimal::new(300, 0),
            EntryKind::Contribution,
            None,
            None,
        );
        let receipt = storage
            .run_transaction(&[
                TxStep::InsertEntry(entry.clone()),
                TxStep::CreditAccount {
                    account_id: account_id.clone(),
                    amount: entry.amount,
                },
                TxStep::ExpectBalance {
                    account_id: account_id.clone(),
                    expected: Decimal::new(300, 0),
                },
                TxStep::ReadEntry {
                    entry_id: entry.entry_id,
                },
                TxStep::ReadAccount {
                    account_id: account_id.clone(),
                },
            ])
            .unwrap();

        assert_eq!(receipt.entries[0].entry_id, entry.entry_id);
        assert_eq!(receipt.accounts[0].balance, Decimal::new(300, 0));
    }

    #[test]
    fn test_delete_requires_disposition() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let entry = suspense(&storage, 700);

        let result = storage.run_transaction(&[TxStep::DeleteEntry {
            entry_id: entry.entry_id,
        }]);
        assert!(matches!(result, Err(Error::InvariantViolation(_))));

        storage
            .run_transaction(&[
                TxStep::DeleteEntry {
                    entry_id: entry.entry_id,
                },
                TxStep::RecordDisposition {
                    entry_id: entry.entry_id,
                    disposition: EntryDisposition::Abandoned { at: Utc::now() },
                },
            ])
            .unwrap();

        assert!(matches!(storage.get_entry(entry.entry_id), Err(Error::EntryNotFound(_))));
        assert!(storage.list_suspense_entries().unwrap().is_empty());
        assert!(matches!(
            storage.get_disposition(entry.entry_id).unwrap(),
            Some(EntryDisposition::Abandoned { .. })
        ));
    }

    #[test]
    fn test_expect_suspense_reports_winner() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let entry = suspense(&storage, 700);
        let new_entry_id = Uuid::now_v7();

        storage
            .run_transaction(&[
                TxStep::DeleteEntry {
                    entry_id: entry.entry_id,
                },
                TxStep::RecordDisposition {
                    entry_id: entry.entry_id,
                    disposition: EntryDisposition::Reassigned {
                        new_entry_id,
                        account_id: AccountId::new("W-M001"),
                        at: Utc::now(),
                    },
                },
            ])
            .unwrap();

        let result = storage.run_transaction(&[TxStep::ExpectSuspense {
            entry_id: entry.entry_id,
            amount: entry.amount,
        }]);
        match result {
            Err(Error::AlreadyAssigned {
                new_entry_id: Some(winner),
                ..
            }) => assert_eq!(winner, new_entry_id),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_attributed_entries_are_immutable() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account_id = wallet(&storage, 1);
        let entry = LedgerEntry::posted(
            account_id.clone(),
            Decimal::TEN,
            EntryKind::Contribution,
            None,
            None,
        );
        storage
            .run_transaction(&[
                TxStep::InsertEntry(entry.clone()),
                TxStep::CreditAccount {
                    account_id,
                    amount: Decimal::TEN,
                },
            ])
            .unwrap();

        let result = storage.run_transaction(&[TxStep::DeleteEntry {
            entry_id: entry.entry_id,
        }]);
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_account_snapshot_read() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let account_id = wallet(&storage, 3);

        let (account, entries) = storage.account_with_entries(&account_id).unwrap();
        assert_eq!(account.balance, Decimal::ZERO);
        assert!(entries.is_empty());

        assert!(matches!(
            storage.account_with_entries(&AccountId::new("W-M999")),
            Err(Error::AccountNotFound(_))
        ));
    }

    fn open_named(storage: &Storage, name: &str) -> AccountId {
        let account_id = AccountId::new(name);
        let owner = Identifier::new(EntityClass::Member, 1);
        storage
            .run_transaction(&[TxStep::CreateAccount(Account::open(account_id.clone(), owner))])
            .unwrap();
        account_id
    }

    #[test]
    fn test_account_index_does_not_leak_across_prefixes() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let short = open_named(&storage, "W-M001");
        let joint = open_named(&storage, "W-M001|joint");

        let entry = LedgerEntry::posted(
            joint.clone(),
            Decimal::new(500, 0),
            EntryKind::Contribution,
            None,
            None,
        );
        storage
            .run_transaction(&[
                TxStep::InsertEntry(entry),
                TxStep::CreditAccount {
                    account_id: joint.clone(),
                    amount: Decimal::new(500, 0),
                },
            ])
            .unwrap();

        assert!(storage.list_account_entries(&short).unwrap().is_empty());
        let (account, entries) = storage.account_with_entries(&short).unwrap();
        assert_eq!(account.balance, Decimal::ZERO);
        assert!(entries.is_empty());

        let (_, joint_entries) = storage.account_with_entries(&joint).unwrap();
        assert_eq!(joint_entries.len(), 1);
    }

    #[test]
    fn test_empty_account_id_is_rejected() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let result = storage.run_transaction(&[TxStep::CreateAccount(Account::open(
            AccountId::new(""),
            Identifier::new(EntityClass::Member, 1),
        ))]);
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_listing_survives_concurrent_retirement() {
        let (config, _temp) = test_config();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let entries: Vec<LedgerEntry> = (1..=200).map(|cents| suspense(&storage, cents)).collect();

        let writer = {
            let storage = storage.clone();
            std::thread::spawn(move || {
                for entry in entries {
                    storage
                        .run_transaction(&[
                            TxStep::DeleteEntry {
                                entry_id: entry.entry_id,
                            },
                            TxStep::RecordDisposition {
                                entry_id: entry.entry_id,
                                disposition: EntryDisposition::Abandoned { at: Utc::now() },
                            },
                        ])
                        .unwrap();
                }
            })
        };

        let mut previous = usize::MAX;
        loop {
            let listed = storage.list_suspense_entries().unwrap();
            assert!(listed.len() <= previous);
            previous = listed.len();
            if listed.is_empty() {
                break;
            }
        }
        writer.join().unwrap();
    }
}
