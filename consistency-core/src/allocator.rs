//! Sequential identifier allocation
//!
//! Turns a [`SequenceStore`] increment into a prefixed, zero-padded
//! identifier. Allocation is not idempotent: every call consumes a value.
//! A value lost to a confirmed failure is simply skipped; it is never
//! issued twice. Store errors propagate unchanged and are never replaced
//! by a fallback identifier.

use crate::config::IdentifierConfig;
use crate::store::SequenceStore;
use crate::types::{EntityClass, Identifier};
use crate::Result;

/// Formats sequence values as identifiers
#[derive(Debug, Clone)]
pub struct IdentifierAllocator<S> {
    store: S,
    config: IdentifierConfig,
}

impl<S: SequenceStore> IdentifierAllocator<S> {
    /// Create an allocator over a sequence store
    pub fn new(store: S, config: IdentifierConfig) -> Self {
        Self { store, config }
    }

    /// Issue the next identifier for `entity_class`
    pub async fn allocate(&self, entity_class: EntityClass) -> Result<Identifier> {
        let value = self
            .store
            .next_value(entity_class, self.config.start_from(entity_class))
            .await?;
        Ok(self.format(entity_class, value))
    }

    /// Issue an identifier tied to a caller-chosen creation key.
    ///
    /// Repeating the key (e.g. after a timeout) returns the identifier
    /// issued the first time.
    pub async fn allocate_with_key(
        &self,
        entity_class: EntityClass,
        key: impl Into<String>,
    ) -> Result<Identifier> {
        let value = self
            .store
            .next_value_for_key(entity_class, self.config.start_from(entity_class), key.into())
            .await?;
        Ok(self.format(entity_class, value))
    }

    fn format(&self, entity_class: EntityClass, value: u64) -> Identifier {
        Identifier::new(entity_class, value)
    }
}
