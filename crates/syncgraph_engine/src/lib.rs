//! # Syncgraph Engine
//!
//! Client-side entity synchronization engine.
//!
//! This crate provides:
//! - The entity graph store: identity tracking, change observation, patch
//!   production and application with version reconciliation
//! - The dispatcher: outbound/inbound operation queues with batched,
//!   serialized network flushes and per-operation completion futures
//! - The resource client facade (`fetch_one`/`fetch_some`/`create`/`patch`)
//! - `SyncContext`, the explicitly constructed bundle threading the store,
//!   dispatcher, and registry through call sites
//!
//! ## Architecture
//!
//! Local mutations go through the store, which validates them, converts
//! them into coalesced per-entity patches, and hands them to the
//! dispatcher. The dispatcher batches queued operations into single
//! network round trips (at most one in flight) and drains the server's
//! response back through the store's patch-application path, which
//! reconciles by version (merge, replace, or ignore-stale) and never
//! re-emits the applied changes outbound.
//!
//! ## Key invariants
//!
//! - At most one live instance per GUID in the graph
//! - Entity references are stored as identity proxies, never deep copies
//! - Applying an inbound patch never enqueues an outbound patch
//! - At most one outstanding batch request at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod context;
mod dispatcher;
mod error;
mod observer;
mod store;
mod transport;

pub use client::{AuthProvider, NoAuth, ResourceClient, SendOptions};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use dispatcher::{Completion, Dispatcher};
pub use error::{SyncError, SyncResult};
pub use observer::{ObserverKind, ObserverTable};
pub use store::Store;
pub use transport::{LoopbackTransport, MockTransport, Transport};
