//! The resource client facade.
//!
//! A [`ResourceClient`] bundles one registered resource with the shared
//! store and dispatcher, exposing the operations a caller actually wants:
//! create an entity, patch it, and run the resource's declared fetches.
//! Fetch results are filtered to the client's own resource; cascaded
//! updates for related resources still land in the store, they just do
//! not surface as primary results.

use crate::dispatcher::{Completion, Dispatcher};
use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use crate::transport::Transport;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use syncgraph_protocol::{
    resource_of, FieldPath, Guid, Operation, Patch, Resource, ID_KEY, META_KEY,
};

/// Supplies credentials before operations leave the client.
pub trait AuthProvider: Send + Sync {
    /// Refreshes credentials, returning the token the transport should
    /// present. Called before every send; implementations are expected to
    /// cache and renew as needed.
    fn authenticate(&self) -> BoxFuture<'_, SyncResult<String>>;
}

/// An [`AuthProvider`] for unauthenticated transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn authenticate(&self) -> BoxFuture<'_, SyncResult<String>> {
        Box::pin(async { Ok(String::new()) })
    }
}

/// Per-call delivery options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Queue without triggering a flush; the operation leaves with the
    /// next flush instead of immediately.
    pub wait: bool,
}

/// A capability handle for one resource.
pub struct ResourceClient<T: Transport> {
    resource: Arc<Resource>,
    store: Arc<Mutex<Store>>,
    dispatcher: Arc<Dispatcher<T>>,
    auth: Arc<dyn AuthProvider>,
    wait_by_default: bool,
}

impl<T: Transport> std::fmt::Debug for ResourceClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClient")
            .field("resource", &self.resource.name)
            .field("wait_by_default", &self.wait_by_default)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ResourceClient<T> {
    /// Creates a client for one resource over the shared machinery.
    pub fn new(
        resource: Arc<Resource>,
        store: Arc<Mutex<Store>>,
        dispatcher: Arc<Dispatcher<T>>,
        auth: Arc<dyn AuthProvider>,
        wait_by_default: bool,
    ) -> Self {
        Self {
            resource,
            store,
            dispatcher,
            auth,
            wait_by_default,
        }
    }

    /// The resource this client operates on.
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Materializes a new entity from the resource template plus the
    /// seed (which must carry the entity's `id`), tracks it, and sends
    /// it to the server as a full patch. Returns the settled snapshot.
    pub async fn create(&self, seed: Map<String, Value>) -> SyncResult<Value> {
        let doc = self.resource.new_entity(&seed);
        let guid = self.store.lock().track(doc.clone())?;

        let mut patch = Patch::for_entity(&doc)?;
        if let Value::Object(map) = &doc {
            for (key, value) in map {
                if key == ID_KEY || key == META_KEY {
                    continue;
                }
                patch.set(&FieldPath::root().join(key.as_str()), value.clone())?;
            }
        }
        self.send(Operation::patch(patch), SendOptions { wait: false })
            .await?
            .wait()
            .await?;

        self.store
            .lock()
            .snapshot(&guid)
            .ok_or(SyncError::Untracked { guid })
    }

    /// Sends an explicit patch. With `wait`, the patch only joins the
    /// outbound queue and leaves with a later flush; otherwise it is
    /// delivered now and the settled snapshot of the target returned.
    pub async fn patch(&self, patch: Patch, wait: bool) -> SyncResult<Option<Value>> {
        let guid = patch.guid();
        let wait = wait || self.wait_by_default;
        let completion = self
            .send(Operation::patch(patch), SendOptions { wait })
            .await?;
        if wait {
            return Ok(None);
        }
        completion.wait().await?;
        Ok(self.store.lock().snapshot(&guid))
    }

    /// Runs a declared fetch expecting at most one primary result.
    pub async fn fetch_one(&self, key: &str, args: &[Value]) -> SyncResult<Option<Value>> {
        let mut results = self.invoke(key, args).await?;
        if results.is_empty() {
            Ok(None)
        } else {
            Ok(Some(results.swap_remove(0)))
        }
    }

    /// Runs a declared fetch, returning every primary result.
    pub async fn fetch_some(&self, key: &str, args: &[Value]) -> SyncResult<Vec<Value>> {
        self.invoke(key, args).await
    }

    /// Runs a declared fetch by key with positional arguments, mapped
    /// onto the operation's declared argument names. Results are the
    /// post-application snapshots of this resource's entities; cascaded
    /// answers for other resources are applied but filtered out.
    pub async fn invoke(&self, key: &str, args: &[Value]) -> SyncResult<Vec<Value>> {
        let (query, unique) = {
            let Some(spec) = self.resource.operation(key) else {
                return Err(SyncError::UnknownOperation {
                    resource: self.resource.name.clone(),
                    key: key.to_string(),
                });
            };
            if args.len() != spec.args.len() {
                return Err(SyncError::Arity {
                    resource: self.resource.name.clone(),
                    key: key.to_string(),
                    expected: spec.args.len(),
                    given: args.len(),
                });
            }
            let mut query = Map::new();
            for (name, value) in spec.args.iter().zip(args) {
                query.insert(name.clone(), value.clone());
            }
            (query, spec.unique)
        };

        let operation = Operation::fetch(self.resource.name.clone(), key, query);
        let results = self
            .send(operation, SendOptions { wait: false })
            .await?
            .wait()
            .await?;

        let mut primaries: Vec<Value> = results
            .into_iter()
            .filter(|doc| self.is_primary(doc))
            .collect();
        if unique {
            primaries.truncate(1);
        }
        Ok(primaries)
    }

    /// Queues one operation. Without `wait` a flush attempt follows the
    /// enqueue; with `wait` the operation sits in the queue until someone
    /// flushes. The returned completion resolves with the snapshots the
    /// server's answer produced, whenever that delivery happens.
    pub async fn send(
        &self,
        operation: Operation,
        options: SendOptions,
    ) -> SyncResult<Completion> {
        self.auth.authenticate().await?;
        let completion = self.dispatcher.queue(operation);
        if !options.wait {
            self.dispatcher.flush().await?;
        }
        Ok(completion)
    }

    /// Convenience lookup of a tracked snapshot by id.
    pub fn tracked(&self, id: impl Into<syncgraph_protocol::EntityId>) -> Option<Value> {
        let guid = Guid {
            resource: self.resource.name.clone(),
            id: id.into(),
        };
        self.store.lock().snapshot(&guid)
    }

    // A fetch's primary results are the entities of the requested
    // resource, including resources that specialize it.
    fn is_primary(&self, doc: &Value) -> bool {
        let Some(name) = resource_of(doc) else {
            return false;
        };
        if name == self.resource.name {
            return true;
        }
        let registry = {
            let store = self.store.lock();
            store.registry().clone()
        };
        let mut next = registry.lookup(name).and_then(|r| r.parent.clone());
        while let Some(parent) = next {
            if parent == self.resource.name {
                return true;
            }
            next = registry.lookup(&parent).and_then(|r| r.parent.clone());
        }
        false
    }
}
