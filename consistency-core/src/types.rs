//! Core types for the consistency core
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Human-readable identifiers (`M001`, `C042`)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Zero-padding width of formatted identifiers
pub const IDENTIFIER_WIDTH: usize = 3;

/// Category an identifier sequence is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityClass {
    /// Welfare member
    Member = 1,
    /// Welfare case
    Case = 2,
}

impl EntityClass {
    /// Every entity class, in key order
    pub const ALL: [EntityClass; 2] = [EntityClass::Member, EntityClass::Case];

    /// Fixed identifier prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityClass::Member => "M",
            EntityClass::Case => "C",
        }
    }

    /// Lower-case name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Member => "member",
            EntityClass::Case => "case",
        }
    }

    /// Look up the class owning a prefix
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.prefix() == prefix)
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable sequential identifier, e.g. `M007`
///
/// Values wider than the padding width widen the number rather than
/// truncating it (`M1000`). Identity is the class and the value, so
/// `"M0007".parse()` equals the issued `M007`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    entity_class: EntityClass,
    value: u64,
}

impl Identifier {
    /// Build an identifier from a sequence value
    pub fn new(entity_class: EntityClass, value: u64) -> Self {
        Self {
            entity_class,
            value,
        }
    }

    /// Entity class encoded in the prefix
    pub fn entity_class(&self) -> EntityClass {
        self.entity_class
    }

    /// Numeric sequence value
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$}",
            self.entity_class.prefix(),
            self.value,
            width = IDENTIFIER_WIDTH
        )
    }
}

impl FromStr for Identifier {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidRequest(format!("Malformed identifier: {:?}", s));

        let split = s.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?;
        let (prefix, digits) = s.split_at(split);
        let entity_class = EntityClass::from_prefix(prefix).ok_or_else(invalid)?;

        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;

        Ok(Self::new(entity_class, value))
    }
}

/// Durable counter row, one per entity class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounter {
    /// Class this counter issues values for
    pub entity_class: EntityClass,

    /// First value the counter issues
    pub start_from: u64,

    /// Last value issued (or the seed, before the first issue)
    pub current_value: u64,
}

impl SequenceCounter {
    /// Seed a counter so that its first issued value equals `start_from`
    pub fn seeded(entity_class: EntityClass, start_from: u64) -> Self {
        Self {
            entity_class,
            start_from,
            current_value: start_from.saturating_sub(1),
        }
    }

    /// Advance the counter and return the newly issued value
    pub fn bump(&mut self) -> crate::Result<u64> {
        self.current_value = self.current_value.checked_add(1).ok_or_else(|| {
            crate::Error::InvariantViolation(format!(
                "{} sequence exhausted",
                self.entity_class
            ))
        })?;
        Ok(self.current_value)
    }
}

/// Account (member wallet) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Conventional wallet account of a member
    pub fn wallet_for(member: &Identifier) -> Self {
        Self(format!("W-{}", member))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Member wallet holding a running balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub account_id: AccountId,

    /// Member owning the account
    pub owner_member_id: Identifier,

    /// Running balance (sum of attributed entries)
    pub balance: Decimal,

    /// Opened timestamp
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Open an empty account
    pub fn open(account_id: AccountId, owner_member_id: Identifier) -> Self {
        Self {
            account_id,
            owner_member_id,
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Member contribution
    Contribution = 1,
    /// Payout on a welfare case
    Disbursement = 2,
    /// Wallet top-up, including reassigned suspense payments
    WalletFunding = 3,
    /// Payment received without a known member
    SuspensePayment = 4,
}

/// Ledger entry (transaction record)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Account credited, `None` while in suspense
    pub account_id: Option<AccountId>,

    /// Signed amount (exact decimal)
    pub amount: Decimal,

    /// Entry kind
    pub kind: EntryKind,

    /// External payment reference (e.g. mobile money receipt)
    pub reference: Option<String>,

    /// Free-form description
    pub description: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// New unattributed payment
    pub fn suspense(amount: Decimal, reference: Option<String>) -> Self {
        Self {
            entry_id: Uuid::now_v7(),
            account_id: None,
            amount,
            kind: EntryKind::SuspensePayment,
            reference,
            description: None,
            created_at: Utc::now(),
        }
    }

    /// New entry attributed to an account
    pub fn posted(
        account_id: AccountId,
        amount: Decimal,
        kind: EntryKind,
        reference: Option<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::now_v7(),
            account_id: Some(account_id),
            amount,
            kind,
            reference,
            description,
            created_at: Utc::now(),
        }
    }

    /// Whether the entry is still waiting for attribution
    pub fn is_suspense(&self) -> bool {
        self.account_id.is_none()
    }
}

/// How a suspense entry left suspense (terminal)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryDisposition {
    /// Credited to an account through a replacement entry
    Reassigned {
        /// Replacement entry on the target account
        new_entry_id: Uuid,
        /// Target account
        account_id: AccountId,
        /// When the reassignment committed
        at: DateTime<Utc>,
    },
    /// Deleted without crediting anyone
    Abandoned {
        /// When the entry was abandoned
        at: DateTime<Utc>,
    },
}

/// Result of a successful reassignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignOutcome {
    /// Entry now holding the credit
    pub new_entry_id: Uuid,
}

/// Balance against ledger-sum comparison for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Account checked
    pub account_id: AccountId,
    /// Stored running balance
    pub balance: Decimal,
    /// Sum of entries attributed to the account
    pub ledger_sum: Decimal,
    /// Number of attributed entries
    pub entry_count: usize,
}

impl Reconciliation {
    /// Whether the balance equals the ledger sum
    pub fn is_balanced(&self) -> bool {
        self.balance == self.ledger_sum
    }
}
