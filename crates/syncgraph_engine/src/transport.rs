//! The network seam.
//!
//! The dispatcher talks to the server exclusively through [`Transport`]:
//! one batch of operations out, one batch item per operation back, in
//! order. Two in-process implementations ship with the crate: a scripted
//! [`MockTransport`] and a handler-backed [`LoopbackTransport`].

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use syncgraph_protocol::{BatchItem, Operation};

/// Delivers operation batches to the server.
pub trait Transport: Send + Sync + 'static {
    /// Submits one batch and returns the server's answer: exactly one
    /// [`BatchItem`] per submitted operation, in submission order.
    ///
    /// A returned error means the whole batch went undelivered; the
    /// dispatcher keeps the operations queued in that case.
    fn submit(
        &self,
        operations: Vec<Operation>,
    ) -> impl Future<Output = SyncResult<Vec<BatchItem>>> + Send;
}

/// A transport answering from a scripted FIFO of responses.
///
/// Each call to [`Transport::submit`] consumes the next scripted response
/// and records the submitted batch. Submitting past the end of the script
/// fails with a non-retryable transport error.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<SyncResult<Vec<BatchItem>>>>,
    submitted: Mutex<Vec<Vec<Operation>>>,
}

impl MockTransport {
    /// Creates a transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a response to the script.
    pub fn enqueue(&self, response: SyncResult<Vec<BatchItem>>) {
        self.responses.lock().push_back(response);
    }

    /// Every batch submitted so far, in order.
    pub fn submitted(&self) -> Vec<Vec<Operation>> {
        self.submitted.lock().clone()
    }
}

impl Transport for MockTransport {
    fn submit(
        &self,
        operations: Vec<Operation>,
    ) -> impl Future<Output = SyncResult<Vec<BatchItem>>> + Send {
        self.submitted.lock().push(operations);
        let response = self.responses.lock().pop_front();
        async move {
            response.unwrap_or_else(|| {
                Err(SyncError::Transport {
                    message: "no scripted response".into(),
                    retryable: false,
                })
            })
        }
    }
}

/// A transport answering each operation through an in-process handler.
/// Useful for integration tests playing the server role.
#[derive(Debug)]
pub struct LoopbackTransport<F> {
    handler: F,
}

impl<F> LoopbackTransport<F>
where
    F: Fn(&Operation) -> BatchItem + Send + Sync + 'static,
{
    /// Creates a transport over the given handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Transport for LoopbackTransport<F>
where
    F: Fn(&Operation) -> BatchItem + Send + Sync + 'static,
{
    fn submit(
        &self,
        operations: Vec<Operation>,
    ) -> impl Future<Output = SyncResult<Vec<BatchItem>>> + Send {
        let items: Vec<BatchItem> = operations.iter().map(|op| (self.handler)(op)).collect();
        async move { Ok(items) }
    }
}
