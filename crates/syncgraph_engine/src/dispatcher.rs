//! The batching dispatcher.
//!
//! Queued operations leave in batches over the transport, at most one
//! batch in flight at a time. Each queued operation carries a completion
//! that resolves with the snapshots of the entities its server answer
//! produced. The server's answers drain straight back through the store's
//! patch-application path, so absorbing a response can never re-emit the
//! same change outbound.

use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use crate::transport::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use syncgraph_protocol::{BatchItem, Guid, Operation, OperationKind, Patch};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Resolves with the server's answer to one queued operation: the
/// post-application snapshots of every entity the answer carried, in
/// response order.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<SyncResult<Vec<Value>>>,
}

impl Completion {
    /// Waits for the operation to settle.
    pub async fn wait(self) -> SyncResult<Vec<Value>> {
        self.receiver.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

#[derive(Debug)]
struct OutboundItem {
    operation: Operation,
    completion: Option<oneshot::Sender<SyncResult<Vec<Value>>>>,
}

#[derive(Debug, Default)]
struct FlushState {
    outbound: VecDeque<OutboundItem>,
    active: bool,
    pending: bool,
}

/// Batches outbound operations and absorbs the server's answers.
#[derive(Debug)]
pub struct Dispatcher<T: Transport> {
    transport: T,
    store: Arc<Mutex<Store>>,
    batch_limit: usize,
    state: Mutex<FlushState>,
}

impl<T: Transport> Dispatcher<T> {
    /// Creates a dispatcher over a transport and the shared store.
    pub fn new(transport: T, store: Arc<Mutex<Store>>, batch_limit: usize) -> Self {
        Self {
            transport,
            store,
            batch_limit: batch_limit.max(1),
            state: Mutex::new(FlushState::default()),
        }
    }

    /// The shared store this dispatcher drains responses into.
    pub fn store(&self) -> &Arc<Mutex<Store>> {
        &self.store
    }

    /// The transport batches leave through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Enqueues one operation. The returned completion resolves when the
    /// operation settles (delivered and absorbed, rejected by the server,
    /// or cancelled).
    pub fn queue(&self, operation: Operation) -> Completion {
        let (sender, receiver) = oneshot::channel();
        self.state.lock().outbound.push_back(OutboundItem {
            operation,
            completion: Some(sender),
        });
        Completion { receiver }
    }

    /// Moves the store's coalesced pending patches onto the outbound
    /// queue. Returns how many operations were queued.
    pub fn queue_pending(&self) -> usize {
        let patches = self.store.lock().take_pending();
        let count = patches.len();
        let mut state = self.state.lock();
        for patch in patches {
            state.outbound.push_back(OutboundItem {
                operation: Operation::patch(patch),
                completion: None,
            });
        }
        count
    }

    /// Number of operations waiting to leave.
    pub fn queue_len(&self) -> usize {
        self.state.lock().outbound.len()
    }

    /// Drains the outbound queue in batches, one request at a time.
    ///
    /// Re-entrant calls while a flush is running mark it pending and
    /// return immediately; the running flush keeps looping until the
    /// queue is empty and nothing is pending. A transport failure leaves
    /// the undelivered operations at the front of the queue; when a flush
    /// was requested during the failed request the running flush retries
    /// once more, otherwise the error surfaces to the caller.
    pub async fn flush(&self) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            if state.active {
                state.pending = true;
                return Ok(());
            }
            state.active = true;
        }
        let result = self.run_flush().await;
        self.state.lock().active = false;
        result
    }

    async fn run_flush(&self) -> SyncResult<()> {
        loop {
            // Snapshot the count before going async; operations queued
            // during the request wait for the next iteration.
            let batch: Vec<OutboundItem> = {
                let mut state = self.state.lock();
                state.pending = false;
                let count = state.outbound.len().min(self.batch_limit);
                state.outbound.drain(..count).collect()
            };
            if batch.is_empty() {
                return Ok(());
            }

            let operations: Vec<Operation> =
                batch.iter().map(|item| item.operation.clone()).collect();
            debug!(operations = operations.len(), "submitting batch");

            let items = match self.transport.submit(operations).await {
                Ok(items) => items,
                Err(err) => {
                    let retry = {
                        let mut state = self.state.lock();
                        for item in batch.into_iter().rev() {
                            state.outbound.push_front(item);
                        }
                        state.pending
                    };
                    // A flush requested during the failed request still
                    // gets its attempt, with the failed batch back at
                    // the front of the queue.
                    if retry {
                        warn!(error = %err, "batch delivery failed, retrying for a pending flush");
                        continue;
                    }
                    warn!(error = %err, "batch delivery failed, operations remain queued");
                    return Err(err);
                }
            };
            self.settle(batch, items);

            let more = {
                let state = self.state.lock();
                state.pending || !state.outbound.is_empty()
            };
            if !more {
                return Ok(());
            }
        }
    }

    /// Rejects every queued operation without delivering it. Returns how
    /// many were rejected. The escape hatch for tearing down a context
    /// whose transport is gone for good.
    pub fn reject_all(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.outbound.len();
        for mut item in state.outbound.drain(..) {
            if let Some(sender) = item.completion.take() {
                let _ = sender.send(Err(SyncError::Cancelled));
            }
        }
        count
    }

    /// Applies server-pushed patches (wire form) outside the
    /// request/response cycle. Returns the affected GUIDs in order.
    pub fn apply_inbound(&self, values: Vec<Value>) -> SyncResult<Vec<Guid>> {
        let mut store = self.store.lock();
        let mut guids = Vec::with_capacity(values.len());
        for value in values {
            let patch = Patch::from_wire(value)?;
            guids.push(store.apply(patch)?);
        }
        Ok(guids)
    }

    // Pairs each delivered operation with its answer and resolves its
    // completion. A short response rejects the unmatched tail.
    fn settle(&self, batch: Vec<OutboundItem>, items: Vec<BatchItem>) {
        let mut items = items.into_iter();
        for mut queued in batch {
            let outcome = match items.next() {
                None => Err(SyncError::Server("missing response for operation".into())),
                Some(BatchItem::Failed(message)) => Err(SyncError::Server(message)),
                Some(item) => self.absorb(item),
            };
            match queued.completion.take() {
                Some(sender) => {
                    let _ = sender.send(outcome);
                }
                None => {
                    if let Err(err) = outcome {
                        warn!(error = %err, "queued patch settled with an error");
                    }
                }
            }
        }
    }

    // Applies every answer in a batch item (a single result or a cascade
    // of related updates) and snapshots the affected entities.
    fn absorb(&self, item: BatchItem) -> SyncResult<Vec<Value>> {
        let mut store = self.store.lock();
        let mut snapshots = Vec::new();
        for value in item.operations() {
            let operation = Operation::from_wire(value.clone())?;
            match operation.kind {
                OperationKind::Patch => {
                    if let Some(patch) = operation.patch {
                        let guid = store.apply(patch)?;
                        if let Some(snapshot) = store.snapshot(&guid) {
                            snapshots.push(snapshot);
                        }
                    }
                }
                OperationKind::Fetch(key) => {
                    // Servers answer fetches with patches; a fetch echo
                    // carries no entity state.
                    debug!(%key, "ignoring fetch echo in response");
                }
            }
        }
        Ok(snapshots)
    }
}
