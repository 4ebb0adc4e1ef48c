//! The entity graph store.
//!
//! The store owns every tracked entity document, keyed by GUID, and
//! guarantees at most one live instance per GUID. All local mutations go
//! through [`Store::set`], [`Store::remove`], and [`Store::splice`], which
//! validate the change, maintain the observer table, and coalesce the
//! change into one pending outbound patch per entity. Inbound patches go
//! through [`Store::apply`], which reconciles by version and never feeds
//! back into the pending set.
//!
//! Entity-valued fields are never stored as deep copies: any full entity
//! encountered inside another document is detached, tracked on its own
//! (unless its GUID is already live), and replaced in place by its
//! identity proxy.

use crate::error::{SyncError, SyncResult};
use crate::observer::{ObserverKind, ObserverTable};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use syncgraph_protocol::{
    guid_of, is_entity, meta_of, set_version, strip, EntityRef, FieldPath, Guid, Patch,
    PatchValue, ProtocolError, Registry, Splice, Validation, ID_KEY, META_KEY, VALIDATION_KEY,
    VERSION_KEY,
};
use tracing::{debug, warn};

/// How an inbound patch is reconciled against the tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconcile {
    /// Apply field changes in place.
    Merge,
    /// Strip to identity, re-seed from the template, then apply fields.
    Replace,
    /// The patch predates the tracked state; drop it.
    Stale,
}

/// The entity graph: tracked documents, their observers, and the pending
/// outbound patches produced by local mutations.
#[derive(Debug)]
pub struct Store {
    registry: Arc<Registry>,
    graph: HashMap<Guid, Value>,
    observers: ObserverTable,
    pending: HashMap<Guid, Patch>,
}

impl Store {
    /// Creates an empty store over a resource registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            graph: HashMap::new(),
            observers: ObserverTable::new(),
            pending: HashMap::new(),
        }
    }

    /// The resource registry this store resolves templates and validators
    /// through.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Brings an entity document under management.
    ///
    /// Nested entities inside the document are detached and tracked on
    /// their own; the document keeps identity proxies in their place.
    /// Tracking a document equal to the already-tracked instance is a
    /// no-op; tracking a *different* document under a live GUID is an
    /// error, since that would split identity.
    pub fn track(&mut self, mut entity: Value) -> SyncResult<Guid> {
        if !is_entity(&entity) {
            return Err(SyncError::NotAnEntity);
        }
        let Some(guid) = guid_of(&entity) else {
            return Err(SyncError::NotAnEntity);
        };

        let mut detached = Vec::new();
        detach_nested(&mut entity, true, &mut detached)?;

        match self.graph.get(&guid) {
            Some(existing) if *existing == entity => {
                debug!(%guid, "entity already tracked");
            }
            Some(_) => {
                return Err(SyncError::DuplicateTracking { guid });
            }
            None => {
                self.graph.insert(guid.clone(), entity);
                self.rebuild_observers(&guid, &FieldPath::root());
                debug!(%guid, observers = self.observers.count(&guid), "tracking entity");
            }
        }

        for node in detached {
            self.resolve(node)?;
        }
        Ok(guid)
    }

    /// Releases an entity: drops its document, observers, and pending
    /// patch. Untracking something that is not tracked is non-fatal.
    pub fn untrack(&mut self, entity: &Value) -> SyncResult<()> {
        if !is_entity(entity) {
            return Err(SyncError::NotAnEntity);
        }
        let Some(guid) = guid_of(entity) else {
            return Err(SyncError::NotAnEntity);
        };
        if self.graph.remove(&guid).is_none() {
            warn!(%guid, "untrack of an entity that is not tracked");
            return Ok(());
        }
        self.observers.close_entity(&guid);
        self.pending.remove(&guid);
        debug!(%guid, "untracked entity");
        Ok(())
    }

    /// Returns true if a GUID has a tracked instance.
    pub fn contains(&self, guid: &Guid) -> bool {
        self.graph.contains_key(guid)
    }

    /// Borrows the tracked document for a GUID.
    pub fn get(&self, guid: &Guid) -> Option<&Value> {
        self.graph.get(guid)
    }

    /// Clones the tracked document for a GUID.
    pub fn snapshot(&self, guid: &Guid) -> Option<Value> {
        self.graph.get(guid).cloned()
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Number of live observers for one entity.
    pub fn observer_count(&self, guid: &Guid) -> usize {
        self.observers.count(guid)
    }

    /// Sets a field on a tracked entity.
    ///
    /// The value is validated first; an invalid value is recorded at the
    /// field's metadata slot and excluded from both the document and the
    /// pending patch. Entity values are reduced to identity proxies (the
    /// full document is tracked separately if its GUID is new). `null` is
    /// not a legal domain value.
    pub fn set(&mut self, guid: &Guid, path: &FieldPath, value: Value) -> SyncResult<Validation> {
        if path.is_root() {
            return Err(
                ProtocolError::InvalidPath("cannot overwrite the entity root".into()).into(),
            );
        }
        if value.is_null() {
            return Err(ProtocolError::NullDomainValue {
                path: path.to_string(),
            }
            .into());
        }
        self.check_target(guid, path)?;

        let validation = self.validate_and_record(guid, path, Some(&value))?;
        if !validation.is_valid() {
            debug!(%guid, %path, message = ?validation.message, "value rejected by validator");
            return Ok(validation);
        }

        let mut value = value;
        let mut detached = Vec::new();
        detach_nested(&mut value, false, &mut detached)?;
        let stored_is_proxy = is_entity(&value);

        // Write the document first; a failed write must leave the pending
        // patch untouched.
        {
            let Some(doc) = self.graph.get_mut(guid) else {
                return Err(SyncError::Untracked { guid: guid.clone() });
            };
            path.set(doc, value.clone())?;
        }
        self.observers.close_prefix(guid, path);
        {
            let patch = self.pending_for(guid)?;
            match EntityRef::of(&value) {
                Some(proxy) => patch.reference(path, proxy),
                None => patch.set(path, value)?,
            }
        }
        if !stored_is_proxy {
            self.rebuild_observers(guid, path);
        }

        for node in detached {
            self.resolve(node)?;
        }
        Ok(validation)
    }

    /// Removes a field from a tracked entity.
    ///
    /// Runs the path's validator with `None`; an invalid removal is
    /// recorded and excluded like an invalid set. The pending patch
    /// carries a deletion marker when a field was actually removed.
    pub fn remove(&mut self, guid: &Guid, path: &FieldPath) -> SyncResult<Validation> {
        if path.is_root() {
            return Err(
                ProtocolError::InvalidPath("cannot remove the entity root".into()).into(),
            );
        }
        self.check_target(guid, path)?;

        let validation = self.validate_and_record(guid, path, None)?;
        if !validation.is_valid() {
            debug!(%guid, %path, message = ?validation.message, "removal rejected by validator");
            return Ok(validation);
        }

        self.observers.close_prefix(guid, path);
        let removed = {
            let Some(doc) = self.graph.get_mut(guid) else {
                return Err(SyncError::Untracked { guid: guid.clone() });
            };
            path.remove(doc).is_some()
        };
        if removed {
            self.pending_for(guid)?.delete(path);
        }
        Ok(validation)
    }

    /// Splices an array field in place: removes `removed` elements at
    /// `index`, then inserts `inserted` there. Out-of-range arguments are
    /// clamped to the array bounds. Inserted entities are reduced to
    /// proxies like set values.
    pub fn splice(
        &mut self,
        guid: &Guid,
        path: &FieldPath,
        index: usize,
        removed: usize,
        inserted: Vec<Value>,
    ) -> SyncResult<()> {
        self.check_target(guid, path)?;

        let mut inserted = inserted;
        let mut detached = Vec::new();
        for item in &mut inserted {
            if item.is_null() {
                return Err(ProtocolError::NullDomainValue {
                    path: path.to_string(),
                }
                .into());
            }
            detach_nested(item, false, &mut detached)?;
        }

        let (index, removed) = {
            let Some(doc) = self.graph.get_mut(guid) else {
                return Err(SyncError::Untracked { guid: guid.clone() });
            };
            let Some(target) = path.get_mut(doc) else {
                return Err(ProtocolError::InvalidPath(format!(
                    "{path} does not exist on {guid}"
                ))
                .into());
            };
            let Value::Array(items) = target else {
                return Err(
                    ProtocolError::InvalidPath(format!("{path} is not an array")).into(),
                );
            };
            let index = index.min(items.len());
            let removed = removed.min(items.len() - index);
            let _ = items.splice(index..index + removed, inserted.iter().cloned());
            (index, removed)
        };

        self.pending_for(guid)?
            .splice(path, Splice::new(index, removed, inserted));
        self.rebuild_observers(guid, path);

        for node in detached {
            self.resolve(node)?;
        }
        Ok(())
    }

    /// Drains the coalesced pending patches, one per locally mutated
    /// entity, in GUID order. Empty patches are dropped.
    pub fn take_pending(&mut self) -> Vec<Patch> {
        let mut patches: Vec<Patch> = self
            .pending
            .drain()
            .map(|(_, patch)| patch)
            .filter(|patch| !patch.is_empty())
            .collect();
        patches.sort_by_key(Patch::guid);
        patches
    }

    /// Returns true if any entity has undelivered local changes.
    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|patch| !patch.is_empty())
    }

    /// Applies an inbound patch, reconciling by version.
    ///
    /// - No tracked instance: the entity is materialized from its
    ///   resource template plus the patch fields and tracked.
    /// - Version-only patch: the tracked instance's version is bumped in
    ///   place (the optimistic acknowledgement path).
    /// - Unversioned patch: plain merge.
    /// - Patch version newer than the entity (or the entity has no
    ///   version): full replace (strip to identity, re-seed from the
    ///   template, apply fields, adopt the patch version).
    /// - Patch version older: stale, ignored but acknowledged.
    /// - Equal versions: merge.
    ///
    /// Applying always discards the entity's pending local patch, so an
    /// inbound change can never echo back outbound.
    pub fn apply(&mut self, patch: Patch) -> SyncResult<Guid> {
        let guid = patch.guid();

        if patch.is_version_bump() {
            let Some(doc) = self.graph.get_mut(&guid) else {
                return Err(SyncError::Untracked { guid });
            };
            if let Some(version) = patch.version {
                set_version(doc, version);
            }
            self.pending.remove(&guid);
            debug!(%guid, version = ?patch.version, "version acknowledged");
            return Ok(guid);
        }

        if !self.graph.contains_key(&guid) {
            let doc = self.materialize(&patch)?;
            self.track(doc)?;
            self.pending.remove(&guid);
            debug!(%guid, "materialized entity from patch");
            return Ok(guid);
        }

        let mode = self.reconcile_mode(&guid, &patch)?;
        debug!(%guid, ?mode, fields = patch.len(), "applying patch");
        match mode {
            Reconcile::Stale => {
                self.pending.remove(&guid);
                Ok(guid)
            }
            Reconcile::Replace => self.apply_replace(guid, patch),
            Reconcile::Merge => self.apply_merge(guid, patch),
        }
    }

    fn reconcile_mode(&self, guid: &Guid, patch: &Patch) -> SyncResult<Reconcile> {
        let Some(doc) = self.graph.get(guid) else {
            return Err(SyncError::Untracked { guid: guid.clone() });
        };
        let entity_version = match meta_of(doc).and_then(|meta| meta.get(VERSION_KEY)) {
            None => None,
            Some(raw) => match raw.as_u64() {
                Some(version) => Some(version),
                None => {
                    return Err(SyncError::IncompatibleVersion {
                        guid: guid.clone(),
                        entity: raw.to_string(),
                        patch: patch
                            .version
                            .map_or_else(|| "none".to_string(), |v| v.to_string()),
                    })
                }
            },
        };

        Ok(match (patch.version, entity_version) {
            (None, _) => Reconcile::Merge,
            (Some(_), None) => Reconcile::Replace,
            (Some(incoming), Some(current)) if incoming > current => Reconcile::Replace,
            (Some(incoming), Some(current)) if incoming < current => Reconcile::Stale,
            _ => Reconcile::Merge,
        })
    }

    fn apply_replace(&mut self, guid: Guid, patch: Patch) -> SyncResult<Guid> {
        let Some(mut doc) = self.graph.remove(&guid) else {
            return Err(SyncError::Untracked { guid });
        };
        self.observers.close_entity(&guid);

        strip(&mut doc);
        if let (Some(resource), Value::Object(map)) =
            (self.registry.lookup(&guid.resource), &mut doc)
        {
            for (key, value) in resource.template() {
                if key == ID_KEY || key == META_KEY {
                    continue;
                }
                map.insert(key.clone(), value.clone());
            }
        }

        let mut refs = Vec::new();
        apply_fields(&mut doc, &patch, &mut refs)?;
        if let Some(version) = patch.version {
            set_version(&mut doc, version);
        }
        self.graph.insert(guid.clone(), doc);
        self.rebuild_observers(&guid, &FieldPath::root());

        for node in refs {
            self.resolve(node)?;
        }
        self.pending.remove(&guid);
        Ok(guid)
    }

    fn apply_merge(&mut self, guid: Guid, patch: Patch) -> SyncResult<Guid> {
        let changed: Vec<FieldPath> = patch
            .fields()
            .map(|(key, _)| FieldPath::parse(key))
            .collect::<Result<_, _>>()?;
        for path in &changed {
            self.observers.close_prefix(&guid, path);
        }

        let mut refs = Vec::new();
        {
            let Some(doc) = self.graph.get_mut(&guid) else {
                return Err(SyncError::Untracked { guid });
            };
            apply_fields(doc, &patch, &mut refs)?;
        }
        for path in &changed {
            self.rebuild_observers(&guid, path);
        }

        for node in refs {
            self.resolve(node)?;
        }
        self.pending.remove(&guid);
        Ok(guid)
    }

    // Builds a fresh document for a patch targeting an unknown GUID:
    // resource template (identity stub if unregistered) plus the patch
    // fields and version.
    fn materialize(&self, patch: &Patch) -> SyncResult<Value> {
        let guid = patch.guid();
        let mut doc = match self.registry.lookup(&guid.resource) {
            Some(resource) => {
                let mut map = resource.template().clone();
                map.insert(ID_KEY.to_string(), patch.id.to_value());
                Value::Object(map)
            }
            None => EntityRef {
                resource: guid.resource.clone(),
                id: guid.id.clone(),
                version: None,
            }
            .to_value(),
        };

        let mut refs = Vec::new();
        apply_fields(&mut doc, patch, &mut refs)?;
        if let Some(version) = patch.version {
            set_version(&mut doc, version);
        }
        // Referenced entities resolve when the document is tracked.
        let _ = refs;
        Ok(doc)
    }

    // Resolves a detached entity node against the graph: a live GUID wins
    // (the node's data is discarded), an unknown GUID makes the node the
    // tracked canonical instance.
    fn resolve(&mut self, node: Value) -> SyncResult<Guid> {
        let Some(guid) = guid_of(&node) else {
            return Err(SyncError::NotAnEntity);
        };
        if self.graph.contains_key(&guid) {
            return Ok(guid);
        }
        self.track(node)
    }

    // The coalesced pending patch for an entity, created on first use
    // with the entity's current identity and version.
    fn pending_for(&mut self, guid: &Guid) -> SyncResult<&mut Patch> {
        match self.pending.entry(guid.clone()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let Some(doc) = self.graph.get(guid) else {
                    return Err(SyncError::Untracked { guid: guid.clone() });
                };
                Ok(slot.insert(Patch::for_entity(doc)?))
            }
        }
    }

    // Mutations address fields of one entity; a path that reaches through
    // an entity reference must target the referenced entity instead.
    fn check_target(&self, guid: &Guid, path: &FieldPath) -> SyncResult<()> {
        let Some(doc) = self.graph.get(guid) else {
            return Err(SyncError::Untracked { guid: guid.clone() });
        };
        let mut prefix = FieldPath::root();
        for segment in &path.segments()[..path.len().saturating_sub(1)] {
            prefix = prefix.join(segment.clone());
            if prefix.get(doc).is_some_and(is_entity) {
                return Err(ProtocolError::InvalidPath(format!(
                    "{path} reaches through the entity reference at {prefix}"
                ))
                .into());
            }
        }
        Ok(())
    }

    // Runs the registered validator and records the outcome at the
    // field's metadata slot (parent._m.<field>.valid), when the parent is
    // an object.
    fn validate_and_record(
        &mut self,
        guid: &Guid,
        path: &FieldPath,
        value: Option<&Value>,
    ) -> SyncResult<Validation> {
        let validation = match self.registry.lookup(&guid.resource) {
            Some(resource) => resource.validate(path, value),
            None => Validation::valid(),
        };

        if let (Some(meta_path), Some(parent)) = (path.metadata_path(), path.parent()) {
            if let Some(doc) = self.graph.get_mut(guid) {
                let parent_is_object =
                    parent.is_root() || matches!(parent.get(doc), Some(Value::Object(_)));
                if parent_is_object {
                    meta_path
                        .join(VALIDATION_KEY)
                        .set(doc, validation.to_value())?;
                }
            }
        }
        Ok(validation)
    }

    // Re-derives observer entries for the subtree rooted at `base`,
    // replacing whatever was registered there.
    fn rebuild_observers(&mut self, guid: &Guid, base: &FieldPath) {
        self.observers.close_prefix(guid, base);
        let mut found = Vec::new();
        if let Some(doc) = self.graph.get(guid) {
            if let Some(value) = base.get(doc) {
                collect_observable(value, base.clone(), base.is_root(), &mut found);
            }
        }
        for (path, kind) in found {
            self.observers.insert(guid, &path, kind);
        }
    }
}

// Walks a subtree and registers every container as observable, stopping
// at entity boundaries (references are watched by their own entity).
fn collect_observable(
    value: &Value,
    path: FieldPath,
    at_entity_root: bool,
    out: &mut Vec<(FieldPath, ObserverKind)>,
) {
    if !at_entity_root && is_entity(value) {
        return;
    }
    match value {
        Value::Object(map) => {
            out.push((path.clone(), ObserverKind::Object));
            for (key, nested) in map {
                if key == META_KEY {
                    continue;
                }
                collect_observable(nested, path.join(key.as_str()), false, out);
            }
        }
        Value::Array(items) => {
            out.push((path.clone(), ObserverKind::Array));
            for (i, item) in items.iter().enumerate() {
                collect_observable(item, path.join(i), false, out);
            }
        }
        _ => {}
    }
}

// Replaces every nested entity in a subtree with its identity proxy,
// handing the detached documents back for resolution against the graph.
fn detach_nested(
    value: &mut Value,
    at_entity_root: bool,
    out: &mut Vec<Value>,
) -> SyncResult<()> {
    if !at_entity_root && is_entity(value) {
        let Some(proxy) = EntityRef::of(value) else {
            return Err(ProtocolError::MissingGuid.into());
        };
        let node = std::mem::replace(value, proxy.to_value());
        out.push(node);
        return Ok(());
    }
    match value {
        Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if key == META_KEY {
                    continue;
                }
                detach_nested(nested, false, out)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                detach_nested(item, false, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

// Writes a patch's field changes into a document. Entity references are
// collected for resolution by the caller; splices are clamped to the
// target array's bounds.
fn apply_fields(doc: &mut Value, patch: &Patch, refs: &mut Vec<Value>) -> SyncResult<()> {
    for (key, value) in patch.fields() {
        let path = FieldPath::parse(key)?;
        match value {
            PatchValue::Delete => {
                path.remove(doc);
            }
            PatchValue::Ref(proxy) => {
                path.set(doc, proxy.to_value())?;
                refs.push(proxy.to_value());
            }
            PatchValue::Set(incoming) => {
                let mut incoming = incoming.clone();
                detach_nested(&mut incoming, false, refs)?;
                path.set(doc, incoming)?;
            }
            PatchValue::Splices(splices) => {
                if path.get(doc).is_none() {
                    path.set(doc, Value::Array(Vec::new()))?;
                }
                let Some(target) = path.get_mut(doc) else {
                    continue;
                };
                let Value::Array(items) = target else {
                    return Err(
                        ProtocolError::InvalidPath(format!("{path} is not an array")).into(),
                    );
                };
                for splice in splices {
                    let mut inserted = splice.inserted.clone();
                    for item in &mut inserted {
                        detach_nested(item, false, refs)?;
                    }
                    let index = splice.index.min(items.len());
                    let removed = splice.removed.min(items.len() - index);
                    let _ = items.splice(index..index + removed, inserted);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncgraph_protocol::Resource;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register(
                Resource::new("user")
                    .with_template(json!({"name": "", "tags": []}))
                    .with_validator("age", |value| match value.and_then(Value::as_i64) {
                        Some(age) if age >= 0 => Validation::valid(),
                        _ => Validation::invalid("age must be a non-negative number"),
                    })
                    .unwrap(),
            )
            .unwrap();
        registry.register(Resource::new("team")).unwrap();
        Arc::new(registry)
    }

    fn store() -> Store {
        Store::new(registry())
    }

    fn user(id: i64, version: u64) -> Value {
        json!({
            "id": id,
            "_m": {"_r": "user", "_v": version},
            "name": "Ann",
            "tags": ["a"]
        })
    }

    #[test]
    fn track_and_get() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();

        assert_eq!(guid, Guid::new("user", 1));
        assert!(store.contains(&guid));
        assert_eq!(store.get(&guid).unwrap()["name"], json!("Ann"));
        // Root object plus the tags array.
        assert_eq!(store.observer_count(&guid), 2);
    }

    #[test]
    fn tracking_equal_document_is_a_noop() {
        let mut store = store();
        store.track(user(1, 1)).unwrap();
        store.track(user(1, 1)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn tracking_different_document_under_live_guid_fails() {
        let mut store = store();
        store.track(user(1, 1)).unwrap();

        let mut other = user(1, 1);
        other["name"] = json!("Impostor");
        let err = store.track(other).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateTracking { .. }));
    }

    #[test]
    fn non_entities_are_rejected() {
        let mut store = store();
        assert!(matches!(
            store.track(json!({"name": "no identity"})),
            Err(SyncError::NotAnEntity)
        ));
        assert!(matches!(
            store.untrack(&json!(42)),
            Err(SyncError::NotAnEntity)
        ));
    }

    #[test]
    fn untrack_releases_everything() {
        let mut store = store();
        let doc = user(1, 1);
        let guid = store.track(doc.clone()).unwrap();
        store.set(&guid, &path("name"), json!("Anna")).unwrap();

        store.untrack(&doc).unwrap();
        assert!(!store.contains(&guid));
        assert_eq!(store.observer_count(&guid), 0);
        assert!(store.take_pending().is_empty());

        // Untracked again: non-fatal.
        store.untrack(&doc).unwrap();
    }

    #[test]
    fn set_coalesces_into_one_patch_per_entity() {
        let mut store = store();
        let guid = store.track(user(1, 3)).unwrap();

        store.set(&guid, &path("name"), json!("Anne")).unwrap();
        store.set(&guid, &path("name"), json!("Anna")).unwrap();
        store.set(&guid, &path("email"), json!("a@example.com")).unwrap();

        let patches = store.take_pending();
        assert_eq!(patches.len(), 1);
        let patch = &patches[0];
        assert_eq!(patch.guid(), guid);
        assert_eq!(patch.version, Some(3));
        assert_eq!(patch.len(), 2);
        let fields: std::collections::BTreeMap<_, _> = patch.fields().collect();
        assert_eq!(fields["name"], &PatchValue::Set(json!("Anna")));

        // Draining leaves nothing behind.
        assert!(!store.has_pending());
    }

    #[test]
    fn set_rejects_null() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();
        let err = store.set(&guid, &path("name"), Value::Null).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::NullDomainValue { .. })
        ));
    }

    #[test]
    fn remove_records_a_deletion() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();

        store.remove(&guid, &path("name")).unwrap();
        assert!(store.get(&guid).unwrap().get("name").is_none());

        let patches = store.take_pending();
        assert_eq!(
            patches[0].fields().next(),
            Some(("name", &PatchValue::Delete))
        );
    }

    #[test]
    fn failed_set_records_nothing_pending() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();

        // "name" is a scalar; writing through it fails.
        let err = store
            .set(&guid, &path("name.first"), json!("A"))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::InvalidPath(_))
        ));

        assert_eq!(store.get(&guid).unwrap()["name"], json!("Ann"));
        assert!(!store.has_pending());
        assert!(store.take_pending().is_empty());
    }

    #[test]
    fn removing_a_missing_field_records_nothing() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();

        let validation = store.remove(&guid, &path("ghost")).unwrap();
        assert!(validation.is_valid());
        assert!(store.take_pending().is_empty());
    }

    #[test]
    fn invalid_value_is_recorded_and_excluded() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();

        let validation = store.set(&guid, &path("age"), json!(-5)).unwrap();
        assert!(!validation.is_valid());

        let doc = store.get(&guid).unwrap();
        assert!(doc.get("age").is_none());
        assert_eq!(doc["_m"]["age"]["valid"]["state"], json!("invalid"));
        assert!(store.take_pending().is_empty());

        // A later valid write clears the record.
        store.set(&guid, &path("age"), json!(30)).unwrap();
        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["age"], json!(30));
        assert_eq!(doc["_m"]["age"]["valid"]["state"], json!("valid"));
        assert_eq!(store.take_pending().len(), 1);
    }

    #[test]
    fn entity_values_are_stored_as_proxies() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();

        let manager = json!({
            "id": 2,
            "_m": {"_r": "user", "_v": 4},
            "name": "Boss"
        });
        store.set(&guid, &path("manager"), manager).unwrap();

        // The field holds the identity stub, not the document.
        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["manager"], json!({"id": 2, "_m": {"_r": "user", "_v": 4}}));

        // The full document is tracked under its own GUID.
        let manager_guid = Guid::new("user", 2);
        assert_eq!(store.get(&manager_guid).unwrap()["name"], json!("Boss"));

        // The patch carries a reference.
        let patches = store.take_pending();
        let (_, value) = patches[0].fields().next().unwrap();
        assert!(matches!(value, PatchValue::Ref(r) if r.guid() == manager_guid));
    }

    #[test]
    fn nested_entities_inside_tracked_documents_are_detached() {
        let mut store = store();
        let guid = store
            .track(json!({
                "id": 1,
                "_m": {"_r": "user", "_v": 1},
                "team": {"id": 9, "_m": {"_r": "team", "_v": 2}, "name": "Core"}
            }))
            .unwrap();

        assert_eq!(
            store.get(&guid).unwrap()["team"],
            json!({"id": 9, "_m": {"_r": "team", "_v": 2}})
        );
        assert_eq!(
            store.get(&Guid::new("team", 9)).unwrap()["name"],
            json!("Core")
        );
    }

    #[test]
    fn mutations_do_not_reach_through_references() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();
        store
            .set(
                &guid,
                &path("manager"),
                json!({"id": 2, "_m": {"_r": "user"}}),
            )
            .unwrap();

        let err = store
            .set(&guid, &path("manager.name"), json!("X"))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::InvalidPath(_))
        ));
    }

    #[test]
    fn splice_accumulates_in_order() {
        let mut store = store();
        let guid = store.track(user(1, 2)).unwrap();

        store
            .splice(&guid, &path("tags"), 1, 0, vec![json!("b"), json!("c")])
            .unwrap();
        store.splice(&guid, &path("tags"), 0, 1, vec![]).unwrap();

        assert_eq!(store.get(&guid).unwrap()["tags"], json!(["b", "c"]));

        let patches = store.take_pending();
        let (_, value) = patches[0].fields().next().unwrap();
        assert_eq!(
            value,
            &PatchValue::Splices(vec![
                Splice::new(1, 0, vec![json!("b"), json!("c")]),
                Splice::new(0, 1, vec![]),
            ])
        );
    }

    #[test]
    fn splice_requires_an_array() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();
        let err = store
            .splice(&guid, &path("name"), 0, 0, vec![json!("x")])
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::InvalidPath(_))
        ));
    }

    #[test]
    fn apply_version_bump_in_place() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();
        store.set(&guid, &path("name"), json!("Anna")).unwrap();

        store.apply(Patch::new("user", 1, Some(2))).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["_m"]["_v"], json!(2));
        // Locally applied fields survive the acknowledgement.
        assert_eq!(doc["name"], json!("Anna"));
        // And the pending patch is discarded, not echoed back.
        assert!(store.take_pending().is_empty());
    }

    #[test]
    fn apply_version_bump_to_unknown_entity_fails() {
        let mut store = store();
        let err = store.apply(Patch::new("user", 7, Some(2))).unwrap_err();
        assert!(matches!(err, SyncError::Untracked { .. }));
    }

    #[test]
    fn apply_merges_equal_versions() {
        let mut store = store();
        let guid = store.track(user(1, 2)).unwrap();

        let mut patch = Patch::new("user", 1, Some(2));
        patch.set(&path("name"), json!("Anna")).unwrap();
        store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["name"], json!("Anna"));
        assert_eq!(doc["_m"]["_v"], json!(2));
        // Merge keeps fields the patch does not mention.
        assert_eq!(doc["tags"], json!(["a"]));
    }

    #[test]
    fn apply_replaces_on_newer_version() {
        let mut store = store();
        let mut doc = user(1, 1);
        doc["nickname"] = json!("annie");
        let guid = store.track(doc).unwrap();

        let mut patch = Patch::new("user", 1, Some(3));
        patch.set(&path("name"), json!("Anna")).unwrap();
        store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["_m"]["_v"], json!(3));
        assert_eq!(doc["name"], json!("Anna"));
        // Replace re-seeds from the template; stale fields are gone.
        assert!(doc.get("nickname").is_none());
        assert_eq!(doc["tags"], json!([]));
    }

    #[test]
    fn apply_ignores_stale_patches() {
        let mut store = store();
        let guid = store.track(user(1, 5)).unwrap();

        let mut patch = Patch::new("user", 1, Some(2));
        patch.set(&path("name"), json!("Old")).unwrap();
        // Acknowledged, not an error.
        store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["name"], json!("Ann"));
        assert_eq!(doc["_m"]["_v"], json!(5));
    }

    #[test]
    fn apply_unversioned_patch_merges() {
        let mut store = store();
        let guid = store.track(user(1, 5)).unwrap();

        let mut patch = Patch::new("user", 1, None);
        patch.set(&path("name"), json!("Anna")).unwrap();
        store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["name"], json!("Anna"));
        assert_eq!(doc["_m"]["_v"], json!(5));
    }

    #[test]
    fn apply_replaces_when_entity_has_no_version() {
        let mut store = store();
        let guid = store
            .track(json!({"id": 1, "_m": {"_r": "user"}, "draft": true}))
            .unwrap();

        let mut patch = Patch::new("user", 1, Some(1));
        patch.set(&path("name"), json!("Anna")).unwrap();
        store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["_m"]["_v"], json!(1));
        assert!(doc.get("draft").is_none());
    }

    #[test]
    fn apply_rejects_malformed_entity_version() {
        let mut store = store();
        store
            .track(json!({"id": 1, "_m": {"_r": "user", "_v": "three"}}))
            .unwrap();

        let mut patch = Patch::new("user", 1, Some(2));
        patch.set(&path("name"), json!("X")).unwrap();
        let err = store.apply(patch).unwrap_err();
        assert!(matches!(err, SyncError::IncompatibleVersion { .. }));
    }

    #[test]
    fn apply_materializes_unknown_entities_from_the_template() {
        let mut store = store();

        let mut patch = Patch::new("user", 7, Some(1));
        patch.set(&path("name"), json!("New")).unwrap();
        let guid = store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["id"], json!(7));
        assert_eq!(doc["name"], json!("New"));
        // Template default, untouched by the patch.
        assert_eq!(doc["tags"], json!([]));
        assert_eq!(doc["_m"]["_v"], json!(1));
    }

    #[test]
    fn apply_splices_and_deletions() {
        let mut store = store();
        let guid = store.track(user(1, 2)).unwrap();

        let mut patch = Patch::new("user", 1, Some(2));
        patch.splice(&path("tags"), Splice::new(1, 0, vec![json!("b")]));
        patch.delete(&path("name"));
        store.apply(patch).unwrap();

        let doc = store.get(&guid).unwrap();
        assert_eq!(doc["tags"], json!(["a", "b"]));
        assert!(doc.get("name").is_none());
    }

    #[test]
    fn apply_tracks_referenced_entities_as_stubs() {
        let mut store = store();
        store.track(user(1, 2)).unwrap();

        let mut patch = Patch::new("user", 1, Some(2));
        patch.reference(&path("manager"), EntityRef::new("user", 2));
        store.apply(patch).unwrap();

        // The reference target is now tracked, awaiting hydration.
        let stub = store.get(&Guid::new("user", 2)).unwrap();
        assert!(is_entity(stub));
        assert!(stub.get("name").is_none());
    }

    #[test]
    fn apply_never_echoes_outbound() {
        let mut store = store();
        let guid = store.track(user(1, 2)).unwrap();
        store.set(&guid, &path("name"), json!("Local")).unwrap();

        let mut patch = Patch::new("user", 1, Some(3));
        patch.set(&path("name"), json!("Remote")).unwrap();
        store.apply(patch).unwrap();

        assert!(store.take_pending().is_empty());
        assert_eq!(store.get(&guid).unwrap()["name"], json!("Remote"));
    }

    #[test]
    fn observers_follow_structure() {
        let mut store = store();
        let guid = store.track(user(1, 1)).unwrap();
        let base = store.observer_count(&guid);

        store
            .set(&guid, &path("profile"), json!({"links": ["x"]}))
            .unwrap();
        // profile object + links array.
        assert_eq!(store.observer_count(&guid), base + 2);

        store.remove(&guid, &path("profile")).unwrap();
        assert_eq!(store.observer_count(&guid), base);
    }
}
