//! The sync context.
//!
//! A [`SyncContext`] is the explicitly constructed bundle of everything
//! one synchronization session needs: the resource registry, the entity
//! store, the dispatcher over its transport, and the credential provider.
//! There are no process-wide singletons; two contexts side by side are
//! two independent sessions.
//!
//! Mutations made through the context schedule a deferred commit: the
//! first mutation of a task arms a commit at the next tick boundary, and
//! every further mutation before that boundary coalesces into the same
//! outbound batch.

use crate::client::{AuthProvider, NoAuth, ResourceClient};
use crate::config::SyncConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{SyncError, SyncResult};
use crate::store::Store;
use crate::transport::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syncgraph_protocol::{FieldPath, Guid, Registry, Validation};
use tracing::warn;

/// One synchronization session: registry, store, dispatcher, and auth.
pub struct SyncContext<T: Transport> {
    config: SyncConfig,
    registry: Arc<Registry>,
    store: Arc<Mutex<Store>>,
    dispatcher: Arc<Dispatcher<T>>,
    auth: Arc<dyn AuthProvider>,
    commit_armed: Arc<AtomicBool>,
}

impl<T: Transport> SyncContext<T> {
    /// Creates a context over a registry and transport.
    pub fn new(config: SyncConfig, registry: Arc<Registry>, transport: T) -> Self {
        let store = Arc::new(Mutex::new(Store::new(registry.clone())));
        let dispatcher = Arc::new(Dispatcher::new(transport, store.clone(), config.batch_limit));
        Self {
            config,
            registry,
            store,
            dispatcher,
            auth: Arc::new(NoAuth),
            commit_armed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the credential provider.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// The session configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The resource registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The shared entity store.
    pub fn store(&self) -> &Arc<Mutex<Store>> {
        &self.store
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<T>> {
        &self.dispatcher
    }

    /// A capability handle for one registered resource.
    pub fn resource(&self, name: &str) -> SyncResult<ResourceClient<T>> {
        let resource = self
            .registry
            .lookup(name)
            .ok_or_else(|| SyncError::UnknownResource {
                name: name.to_string(),
            })?;
        Ok(ResourceClient::new(
            resource,
            self.store.clone(),
            self.dispatcher.clone(),
            self.auth.clone(),
            self.config.wait_by_default,
        ))
    }

    /// Brings an entity under management. Tracking alone produces no
    /// outbound traffic.
    pub fn track(&self, entity: Value) -> SyncResult<Guid> {
        self.store.lock().track(entity)
    }

    /// Releases a tracked entity.
    pub fn untrack(&self, entity: &Value) -> SyncResult<()> {
        self.store.lock().untrack(entity)
    }

    /// A point-in-time copy of a tracked document.
    pub fn snapshot(&self, guid: &Guid) -> Option<Value> {
        self.store.lock().snapshot(guid)
    }

    /// Sets a field and schedules a deferred commit.
    pub fn set(&self, guid: &Guid, path: &FieldPath, value: Value) -> SyncResult<Validation> {
        let validation = self.store.lock().set(guid, path, value)?;
        if validation.is_valid() {
            self.arm_commit();
        }
        Ok(validation)
    }

    /// Removes a field and schedules a deferred commit.
    pub fn remove(&self, guid: &Guid, path: &FieldPath) -> SyncResult<Validation> {
        let validation = self.store.lock().remove(guid, path)?;
        if validation.is_valid() {
            self.arm_commit();
        }
        Ok(validation)
    }

    /// Splices an array field and schedules a deferred commit.
    pub fn splice(
        &self,
        guid: &Guid,
        path: &FieldPath,
        index: usize,
        removed: usize,
        inserted: Vec<Value>,
    ) -> SyncResult<()> {
        self.store.lock().splice(guid, path, index, removed, inserted)?;
        self.arm_commit();
        Ok(())
    }

    /// Drains pending local changes to the outbound queue and flushes.
    /// The deferred-commit path calls this automatically; callers can use
    /// it to force delivery at a known point.
    pub async fn commit(&self) -> SyncResult<()> {
        self.dispatcher.queue_pending();
        self.dispatcher.flush().await
    }

    // Arms at most one deferred commit per tick. The spawned task yields
    // once so every mutation made in the current task run coalesces into
    // the same batch. Outside a runtime the flag is cleared again and
    // changes wait for an explicit commit().
    fn arm_commit(&self) {
        if self.commit_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.commit_armed.store(false, Ordering::SeqCst);
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let armed = self.commit_armed.clone();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            armed.store(false, Ordering::SeqCst);
            if dispatcher.queue_pending() > 0 {
                if let Err(err) = dispatcher.flush().await {
                    warn!(error = %err, "deferred commit failed, changes remain queued");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use syncgraph_protocol::{BatchItem, Resource};

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register(Resource::new("user").with_template(json!({"name": ""})))
            .unwrap();
        Arc::new(registry)
    }

    fn context() -> SyncContext<MockTransport> {
        SyncContext::new(
            SyncConfig::new("loopback:"),
            registry(),
            MockTransport::new(),
        )
    }

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn mutations_coalesce_into_one_deferred_batch() {
        let context = context();
        let transport = context.dispatcher().transport();
        transport.enqueue(Ok(vec![BatchItem::One(
            json!({"id": 1, "_m": {"_r": "user", "_v": 2}}),
        )]));

        let guid = context
            .track(json!({"id": 1, "_m": {"_r": "user", "_v": 1}, "name": "Ann"}))
            .unwrap();
        context.set(&guid, &path("name"), json!("Anne")).unwrap();
        context.set(&guid, &path("name"), json!("Anna")).unwrap();
        context.set(&guid, &path("email"), json!("a@example.com")).unwrap();

        // Let the deferred commit run.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let submitted = transport.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].len(), 1);
        let patch = submitted[0][0].patch.as_ref().unwrap();
        assert_eq!(patch.len(), 2);

        assert_eq!(
            context.snapshot(&guid).unwrap()["_m"]["_v"],
            json!(2)
        );
    }

    #[tokio::test]
    async fn explicit_commit_flushes_immediately() {
        let context = context();
        context.dispatcher().transport().enqueue(Ok(vec![BatchItem::One(
            json!({"id": 1, "_m": {"_r": "user", "_v": 2}}),
        )]));

        let guid = context
            .track(json!({"id": 1, "_m": {"_r": "user", "_v": 1}, "name": "Ann"}))
            .unwrap();
        context.set(&guid, &path("name"), json!("Anna")).unwrap();
        context.commit().await.unwrap();

        assert_eq!(context.dispatcher().transport().submitted().len(), 1);
        assert_eq!(context.snapshot(&guid).unwrap()["_m"]["_v"], json!(2));
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected() {
        let context = context();
        assert!(matches!(
            context.resource("ghost").unwrap_err(),
            SyncError::UnknownResource { name } if name == "ghost"
        ));
        assert!(context.resource("user").is_ok());
    }

    #[tokio::test]
    async fn invalid_mutations_do_not_arm_a_commit() {
        let registry = Registry::new();
        registry
            .register(
                Resource::new("user")
                    .with_validator("age", |value| match value.and_then(Value::as_i64) {
                        Some(age) if age >= 0 => Validation::valid(),
                        _ => Validation::invalid("bad age"),
                    })
                    .unwrap(),
            )
            .unwrap();
        let context = SyncContext::new(
            SyncConfig::new("loopback:"),
            Arc::new(registry),
            MockTransport::new(),
        );

        let guid = context
            .track(json!({"id": 1, "_m": {"_r": "user", "_v": 1}}))
            .unwrap();
        let validation = context.set(&guid, &path("age"), json!(-1)).unwrap();
        assert!(!validation.is_valid());

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        // Nothing left the client.
        assert!(context.dispatcher().transport().submitted().is_empty());
    }
}
