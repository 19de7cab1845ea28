//! Ledger transfers
//!
//! Every balance movement is planned as one ordered list of [`TxStep`]s
//! and submitted to the [`LedgerStore`] in a single call. Values read
//! outside the transaction (such as a suspense entry's amount) are only
//! used for planning and are re-validated by the transaction itself.
//!
//! # Suspense lifecycle
//!
//! ```text
//! SUSPENSE ──reassign──▶ ASSIGNED   (entry deleted, replacement entry credited)
//!     │
//!     └──────abandon───▶ ABANDONED  (entry deleted, nobody credited)
//! ```

use crate::store::{LedgerStore, TxStep};
use crate::types::{Account, AccountId, EntryDisposition, EntryKind, LedgerEntry};
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Executes balance movements as atomic units of work
#[derive(Debug, Clone)]
pub struct LedgerTransferEngine<L> {
    store: L,
}

impl<L: LedgerStore> LedgerTransferEngine<L> {
    /// Create an engine over a ledger store
    pub fn new(store: L) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &L {
        &self.store
    }

    /// Credit a suspense entry to `target_account_id`.
    ///
    /// Returns the ID of the replacement entry. Exactly one of several
    /// concurrent calls for the same entry succeeds; the others fail with
    /// [`Error::AlreadyAssigned`].
    pub async fn reassign(
        &self,
        entry_id: Uuid,
        target_account_id: &AccountId,
        description: impl Into<String>,
    ) -> Result<Uuid> {
        let entry = self.load_suspense(entry_id)?;
        let (new_entry_id, steps) =
            Self::plan_reassignment(&entry, target_account_id, description.into());

        let receipt = self.store.run_transaction(steps).await?;

        tracing::info!(
            entry_id = %entry_id,
            new_entry_id = %new_entry_id,
            account_id = %target_account_id,
            amount = %entry.amount,
            balance = ?receipt.balance_of(target_account_id),
            "Suspense entry reassigned"
        );

        Ok(new_entry_id)
    }

    /// Steps that move `entry` out of suspense onto `target_account_id`.
    ///
    /// The returned ID is the replacement entry the steps insert.
    pub fn plan_reassignment(
        entry: &LedgerEntry,
        target_account_id: &AccountId,
        description: String,
    ) -> (Uuid, Vec<TxStep>) {
        let replacement = LedgerEntry::posted(
            target_account_id.clone(),
            entry.amount,
            EntryKind::WalletFunding,
            entry.reference.clone(),
            Some(description),
        );
        let new_entry_id = replacement.entry_id;

        let steps = vec![
            TxStep::ExpectSuspense {
                entry_id: entry.entry_id,
                amount: entry.amount,
            },
            TxStep::CreditAccount {
                account_id: target_account_id.clone(),
                amount: entry.amount,
            },
            TxStep::InsertEntry(replacement),
            TxStep::DeleteEntry {
                entry_id: entry.entry_id,
            },
            TxStep::RecordDisposition {
                entry_id: entry.entry_id,
                disposition: EntryDisposition::Reassigned {
                    new_entry_id,
                    account_id: target_account_id.clone(),
                    at: Utc::now(),
                },
            },
        ];

        (new_entry_id, steps)
    }

    /// Retire a suspense entry without crediting anyone
    pub async fn abandon(&self, entry_id: Uuid) -> Result<()> {
        let entry = self.load_suspense(entry_id)?;

        self.store
            .run_transaction(vec![
                TxStep::ExpectSuspense {
                    entry_id,
                    amount: entry.amount,
                },
                TxStep::DeleteEntry { entry_id },
                TxStep::RecordDisposition {
                    entry_id,
                    disposition: EntryDisposition::Abandoned { at: Utc::now() },
                },
            ])
            .await?;

        tracing::info!(entry_id = %entry_id, amount = %entry.amount, "Suspense entry abandoned");

        Ok(())
    }

    /// Record a payment that could not be matched to a member
    pub async fn record_suspense(&self, amount: Decimal, reference: Option<String>) -> Result<Uuid> {
        let entry = LedgerEntry::suspense(amount, reference);
        let entry_id = entry.entry_id;

        self.store
            .run_transaction(vec![TxStep::InsertEntry(entry)])
            .await?;

        tracing::debug!(entry_id = %entry_id, amount = %amount, "Suspense entry recorded");

        Ok(entry_id)
    }

    /// Post a contribution, disbursement or wallet funding to an account.
    ///
    /// Disbursements carry negative amounts, every other kind positive ones.
    pub async fn post(
        &self,
        account_id: &AccountId,
        amount: Decimal,
        kind: EntryKind,
        reference: Option<String>,
        description: Option<String>,
    ) -> Result<Uuid> {
        match kind {
            EntryKind::SuspensePayment => {
                return Err(Error::InvalidRequest(
                    "Suspense payments are not posted to accounts".to_string(),
                ))
            }
            EntryKind::Disbursement if amount >= Decimal::ZERO => {
                return Err(Error::InvalidRequest(
                    "Disbursements must be negative".to_string(),
                ))
            }
            EntryKind::Contribution | EntryKind::WalletFunding if amount <= Decimal::ZERO => {
                return Err(Error::InvalidRequest(format!(
                    "{:?} amounts must be positive",
                    kind
                )))
            }
            _ => {}
        }

        let entry = LedgerEntry::posted(account_id.clone(), amount, kind, reference, description);
        let entry_id = entry.entry_id;

        let receipt = self
            .store
            .run_transaction(vec![
                TxStep::InsertEntry(entry),
                TxStep::CreditAccount {
                    account_id: account_id.clone(),
                    amount,
                },
            ])
            .await?;

        tracing::debug!(
            entry_id = %entry_id,
            account_id = %account_id,
            amount = %amount,
            balance = ?receipt.balance_of(account_id),
            "Entry posted"
        );

        Ok(entry_id)
    }

    /// Open an empty account
    pub async fn open_account(&self, account: Account) -> Result<Account> {
        let account_id = account.account_id.clone();
        let receipt = self
            .store
            .run_transaction(vec![
                TxStep::CreateAccount(account),
                TxStep::ReadAccount {
                    account_id: account_id.clone(),
                },
            ])
            .await?;

        receipt.accounts.into_iter().next().ok_or_else(|| {
            Error::InvariantViolation(format!("Account {} missing after creation", account_id))
        })
    }

    /// How a suspense entry left suspense, if it has
    pub fn resolve(&self, entry_id: Uuid) -> Result<Option<EntryDisposition>> {
        self.store.get_disposition(entry_id)
    }

    /// Point-read an entry and check it is still in suspense
    fn load_suspense(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let entry = match self.store.get_entry(entry_id) {
            Ok(entry) => entry,
            Err(Error::EntryNotFound(_)) => {
                return Err(match self.store.get_disposition(entry_id)? {
                    Some(EntryDisposition::Reassigned { new_entry_id, .. }) => {
                        Error::AlreadyAssigned {
                            entry_id,
                            new_entry_id: Some(new_entry_id),
                        }
                    }
                    _ => Error::EntryNotFound(entry_id),
                })
            }
            Err(e) => return Err(e),
        };

        if !entry.is_suspense() {
            return Err(Error::AlreadyAssigned {
                entry_id,
                new_entry_id: None,
            });
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{spawn_store_actor, StoreHandle};
    use crate::metrics::Metrics;
    use crate::types::{EntityClass, Identifier};
    use crate::{Config, Storage};
    use std::sync::Arc;
    use tokio::time::Duration;

    struct Fixture {
        engine: LedgerTransferEngine<StoreHandle>,
        _temp: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.store.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_store_actor(storage, 64, Duration::from_secs(5), Metrics::new().unwrap());
        Fixture {
            engine: LedgerTransferEngine::new(handle),
            _temp: temp,
        }
    }

    async fn open_wallet(engine: &LedgerTransferEngine<StoreHandle>, n: u64) -> AccountId {
        let member = Identifier::new(EntityClass::Member, n);
        let account = Account::open(AccountId::wallet_for(&member), member);
        engine.open_account(account).await.unwrap().account_id
    }

    #[tokio::test]
    async fn test_reassign_moves_suspense_to_wallet() {
        let f = fixture().await;
        let wallet = open_wallet(&f.engine, 1).await;
        let entry_id = f
            .engine
            .record_suspense(Decimal::new(1500, 2), Some("MPESA-A1".into()))
            .await
            .unwrap();

        let new_entry_id = f
            .engine
            .reassign(entry_id, &wallet, "Paid via wrong number")
            .await
            .unwrap();

        let store = f.engine.store();
        assert!(matches!(store.get_entry(entry_id), Err(Error::EntryNotFound(_))));

        let replacement = store.get_entry(new_entry_id).unwrap();
        assert_eq!(replacement.account_id, Some(wallet.clone()));
        assert_eq!(replacement.amount, Decimal::new(1500, 2));
        assert_eq!(replacement.kind, EntryKind::WalletFunding);
        assert_eq!(replacement.reference.as_deref(), Some("MPESA-A1"));
        assert_eq!(replacement.description.as_deref(), Some("Paid via wrong number"));

        assert_eq!(store.get_account_balance(&wallet).unwrap(), Decimal::new(1500, 2));
    }

    #[tokio::test]
    async fn test_second_reassign_is_already_assigned() {
        let f = fixture().await;
        let wallet = open_wallet(&f.engine, 1).await;
        let entry_id = f.engine.record_suspense(Decimal::TEN, None).await.unwrap();

        let winner = f.engine.reassign(entry_id, &wallet, "first").await.unwrap();
        let err = f.engine.reassign(entry_id, &wallet, "second").await.unwrap_err();

        match err {
            Error::AlreadyAssigned { new_entry_id, .. } => assert_eq!(new_entry_id, Some(winner)),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.engine.store().get_account_balance(&wallet).unwrap(), Decimal::TEN);
    }

    #[tokio::test]
    async fn test_reassign_unknown_account_leaves_entry() {
        let f = fixture().await;
        let entry_id = f.engine.record_suspense(Decimal::TEN, None).await.unwrap();

        let err = f
            .engine
            .reassign(entry_id, &AccountId::new("W-M404"), "typo")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AccountNotFound(_)));
        assert!(f.engine.store().get_entry(entry_id).unwrap().is_suspense());
        assert!(f.engine.resolve(entry_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandon_then_reassign() {
        let f = fixture().await;
        let wallet = open_wallet(&f.engine, 1).await;
        let entry_id = f.engine.record_suspense(Decimal::TEN, None).await.unwrap();

        f.engine.abandon(entry_id).await.unwrap();

        assert!(matches!(
            f.engine.resolve(entry_id).unwrap(),
            Some(EntryDisposition::Abandoned { .. })
        ));
        let err = f.engine.reassign(entry_id, &wallet, "late").await.unwrap_err();
        assert!(matches!(err, Error::EntryNotFound(_)));
        assert_eq!(f.engine.store().get_account_balance(&wallet).unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_post_validates_sign() {
        let f = fixture().await;
        let wallet = open_wallet(&f.engine, 2).await;

        f.engine
            .post(&wallet, Decimal::new(200, 0), EntryKind::Contribution, None, None)
            .await
            .unwrap();
        f.engine
            .post(&wallet, Decimal::new(-50, 0), EntryKind::Disbursement, None, Some("Funeral support".into()))
            .await
            .unwrap();

        let err = f
            .engine
            .post(&wallet, Decimal::new(50, 0), EntryKind::Disbursement, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        assert_eq!(f.engine.store().get_account_balance(&wallet).unwrap(), Decimal::new(150, 0));
    }

    #[tokio::test]
    async fn test_open_account_twice() {
        let f = fixture().await;
        open_wallet(&f.engine, 5).await;

        let member = Identifier::new(EntityClass::Member, 5);
        let err = f
            .engine
            .open_account(Account::open(AccountId::wallet_for(&member), member))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountExists(_)));
    }
}
