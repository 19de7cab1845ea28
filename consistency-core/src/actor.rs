//! Actor-based concurrency for the store
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One logical writer task owns every counter bump and ledger transaction
//! - Callers queue behind a bounded mailbox (backpressure, no silent racing)
//! - Point reads bypass the actor and hit storage directly
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │         Request handlers (forms, API endpoints)       │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               StoreHandle (Clone)                     │
//! │   SequenceStore + LedgerStore, reply timeout          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              StoreActor (Single Task)                 │
//! │   next_sequence_value() / run_transaction()           │
//! │          (one WriteBatch per request)                 │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A request the actor has dequeued always runs to commit or rollback,
//! even if the caller stopped waiting for the reply.

use crate::metrics::Metrics;
use crate::store::{LedgerStore, SequenceStore, TxReceipt, TxStep};
use crate::types::{AccountId, EntityClass, EntryDisposition, LedgerEntry};
use crate::{Error, Result, Storage};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

/// Message sent to the store actor
#[derive(Debug)]
pub enum StoreMessage {
    /// Issue the next sequence value
    NextValue {
        entity_class: EntityClass,
        start_from: u64,
        key: Option<String>,
        response: oneshot::Sender<Result<u64>>,
    },

    /// Run a ledger transaction
    RunTransaction {
        steps: Vec<TxStep>,
        response: oneshot::Sender<Result<TxReceipt>>,
    },

    /// Stop after every message queued ahead of this one
    Shutdown,
}

/// Actor that owns the write path
#[derive(Debug)]
pub struct StoreActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<StoreMessage>,

    /// Transaction metrics
    metrics: Metrics,
}

impl StoreActor {
    /// Create new actor
    pub fn new(storage: Arc<Storage>, mailbox: mpsc::Receiver<StoreMessage>, metrics: Metrics) -> Self {
        Self {
            storage,
            mailbox,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                StoreMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }

        tracing::info!("Store actor stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: StoreMessage) {
        match msg {
            StoreMessage::NextValue {
                entity_class,
                start_from,
                key,
                response,
            } => {
                let result = self
                    .storage
                    .next_sequence_value(entity_class, start_from, key.as_deref());
                if let Err(ref e) = result {
                    tracing::error!(entity_class = %entity_class, "Sequence bump failed: {}", e);
                }
                let _ = response.send(result);
            }

            StoreMessage::RunTransaction { steps, response } => {
                let started = Instant::now();
                let result = self.storage.run_transaction(&steps);
                self.metrics
                    .record_transaction(started.elapsed().as_secs_f64(), result.is_ok());
                let _ = response.send(result);
            }

            StoreMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreMessage>,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// How long to wait for the actor's reply
    request_timeout: Duration,

    /// Actor task, taken by the first `shutdown`
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("request_timeout", &self.request_timeout)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl StoreHandle {
    /// Create new handle
    pub fn new(
        sender: mpsc::Sender<StoreMessage>,
        storage: Arc<Storage>,
        request_timeout: Duration,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            sender,
            storage,
            request_timeout,
            task: Arc::new(Mutex::new(task)),
        }
    }

    /// Storage for reads that need more than the trait exposes
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> StoreMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();

        // A refused send never reached the actor, so nothing was applied
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::StoreUnavailable("Store actor mailbox closed".to_string()))?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::OutcomeUnknown(
                "Store actor dropped the reply".to_string(),
            )),
            Err(_) => Err(Error::OutcomeUnknown(format!(
                "No reply from store within {:?}",
                self.request_timeout
            ))),
        }
    }

    /// Shutdown actor.
    ///
    /// Requests queued before the shutdown still run. Returns once the actor
    /// has exited and released its storage handle; requests made afterwards
    /// fail with [`Error::StoreUnavailable`].
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(StoreMessage::Shutdown)
            .await
            .map_err(|_| Error::StoreUnavailable("Store actor mailbox closed".to_string()))?;

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::StoreUnavailable(format!("Store actor failed: {}", e)))?;
        }
        Ok(())
    }
}

impl SequenceStore for StoreHandle {
    fn next_value(
        &self,
        entity_class: EntityClass,
        start_from: u64,
    ) -> impl Future<Output = Result<u64>> + Send {
        self.request(move |response| StoreMessage::NextValue {
            entity_class,
            start_from,
            key: None,
            response,
        })
    }

    fn next_value_for_key(
        &self,
        entity_class: EntityClass,
        start_from: u64,
        key: String,
    ) -> impl Future<Output = Result<u64>> + Send {
        self.request(move |response| StoreMessage::NextValue {
            entity_class,
            start_from,
            key: Some(key),
            response,
        })
    }
}

impl LedgerStore for StoreHandle {
    fn run_transaction(&self, steps: Vec<TxStep>) -> impl Future<Output = Result<TxReceipt>> + Send {
        self.request(move |response| StoreMessage::RunTransaction { steps, response })
    }

    fn get_account_balance(&self, account_id: &AccountId) -> Result<Decimal> {
        Ok(self.storage.get_account(account_id)?.balance)
    }

    fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.storage.get_entry(entry_id)
    }

    fn get_disposition(&self, entry_id: Uuid) -> Result<Option<EntryDisposition>> {
        self.storage.get_disposition(entry_id)
    }
}

/// Spawn the store actor
pub fn spawn_store_actor(
    storage: Arc<Storage>,
    mailbox_capacity: usize,
    request_timeout: Duration,
    metrics: Metrics,
) -> StoreHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = StoreActor::new(storage.clone(), rx, metrics);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    StoreHandle::new(tx, storage, request_timeout, Some(task))
}
