//! The observer ownership table.
//!
//! Every observed container inside a tracked entity has exactly one entry
//! here, keyed by `(guid, path)`. The table is the single source of truth
//! for what is observed: tearing down a subtree is a prefix-range removal,
//! and nothing observational hides inside entity documents themselves.

use std::collections::BTreeMap;
use syncgraph_protocol::{FieldPath, Guid};

/// What kind of container an observer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverKind {
    /// An object: field set/remove changes.
    Object,
    /// An array: splice changes.
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    guid: String,
    path: String,
}

impl Key {
    fn new(guid: &Guid, path: &FieldPath) -> Self {
        Self {
            guid: guid.to_string(),
            path: path.to_string(),
        }
    }
}

/// Ordered table of live observers across all tracked entities.
///
/// Ordering by `(guid, path)` makes per-entity and per-subtree teardown a
/// contiguous range scan.
#[derive(Debug, Default)]
pub struct ObserverTable {
    entries: BTreeMap<Key, ObserverKind>,
}

impl ObserverTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for a container. Re-registering a path
    /// overwrites its kind.
    pub fn insert(&mut self, guid: &Guid, path: &FieldPath, kind: ObserverKind) {
        self.entries.insert(Key::new(guid, path), kind);
    }

    /// The observer kind at a path, if one is registered.
    pub fn get(&self, guid: &Guid, path: &FieldPath) -> Option<ObserverKind> {
        self.entries.get(&Key::new(guid, path)).copied()
    }

    /// Removes the observer at `path` and every observer underneath it.
    /// Returns how many entries were removed.
    pub fn close_prefix(&mut self, guid: &Guid, path: &FieldPath) -> usize {
        let guid = guid.to_string();
        let prefix = path.to_string();
        let doomed: Vec<Key> = self
            .entries
            .range(
                Key {
                    guid: guid.clone(),
                    path: prefix.clone(),
                }..,
            )
            .take_while(|(key, _)| key.guid == guid && path_under(&key.path, &prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed.len()
    }

    /// Removes every observer belonging to an entity. Returns how many
    /// entries were removed.
    pub fn close_entity(&mut self, guid: &Guid) -> usize {
        self.close_prefix(guid, &FieldPath::root())
    }

    /// Number of observers registered for one entity.
    pub fn count(&self, guid: &Guid) -> usize {
        let guid = guid.to_string();
        self.entries
            .range(
                Key {
                    guid: guid.clone(),
                    path: String::new(),
                }..,
            )
            .take_while(|(key, _)| key.guid == guid)
            .count()
    }

    /// Total number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Segment-wise prefix check on rendered paths: "a.b" covers "a.b" and
// "a.b.c" but not "a.bc". The root prefix covers everything.
fn path_under(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn insert_and_get() {
        let mut table = ObserverTable::new();
        let guid = Guid::new("user", 1);

        table.insert(&guid, &FieldPath::root(), ObserverKind::Object);
        table.insert(&guid, &path("tags"), ObserverKind::Array);

        assert_eq!(
            table.get(&guid, &FieldPath::root()),
            Some(ObserverKind::Object)
        );
        assert_eq!(table.get(&guid, &path("tags")), Some(ObserverKind::Array));
        assert_eq!(table.get(&guid, &path("ghost")), None);
        assert_eq!(table.count(&guid), 2);
    }

    #[test]
    fn close_prefix_is_segment_wise() {
        let mut table = ObserverTable::new();
        let guid = Guid::new("user", 1);

        table.insert(&guid, &path("a.b"), ObserverKind::Object);
        table.insert(&guid, &path("a.b.c"), ObserverKind::Object);
        table.insert(&guid, &path("a.bc"), ObserverKind::Object);

        let removed = table.close_prefix(&guid, &path("a.b"));
        assert_eq!(removed, 2);
        assert_eq!(table.get(&guid, &path("a.bc")), Some(ObserverKind::Object));
    }

    #[test]
    fn close_entity_removes_only_that_guid() {
        let mut table = ObserverTable::new();
        let one = Guid::new("user", 1);
        let two = Guid::new("user", 2);

        table.insert(&one, &FieldPath::root(), ObserverKind::Object);
        table.insert(&one, &path("profile"), ObserverKind::Object);
        table.insert(&two, &FieldPath::root(), ObserverKind::Object);

        assert_eq!(table.close_entity(&one), 2);
        assert_eq!(table.count(&one), 0);
        assert_eq!(table.count(&two), 1);
    }

    #[test]
    fn numeric_and_text_ids_do_not_collide_in_ranges() {
        let mut table = ObserverTable::new();
        let numeric = Guid::new("user", 1);
        let text = Guid::new("user", "1x");

        table.insert(&numeric, &FieldPath::root(), ObserverKind::Object);
        table.insert(&text, &FieldPath::root(), ObserverKind::Object);

        assert_eq!(table.close_entity(&numeric), 1);
        assert_eq!(table.count(&text), 1);
    }
}
