//! Typed field paths.
//!
//! Change observation and patch application both address fields through
//! dotted paths. Paths enter the system as strings (possibly carrying
//! bracketed array indices and `..` parent back-references) and are
//! normalized exactly once, at [`FieldPath::parse`]; everything downstream
//! works with the typed segment form.

use crate::error::{ProtocolError, ProtocolResult};
use crate::META_KEY;
use serde_json::{Map, Value};
use std::fmt;

/// One step of a field path: a named field or an array index.
///
/// Numeric tokens parse as indices, matching the object-path convention
/// where `items.2` addresses the third array element.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    /// A named object field.
    Field(String),
    /// An array index.
    Index(usize),
}

impl Segment {
    /// The key form of this segment, as used for per-field metadata slots.
    pub fn key(&self) -> String {
        match self {
            Segment::Field(name) => name.clone(),
            Segment::Index(i) => i.to_string(),
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => write!(f, "Field({name:?})"),
            Segment::Index(i) => write!(f, "Index({i})"),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => f.write_str(name),
            Segment::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Field(s.to_string())
    }
}

impl From<usize> for Segment {
    fn from(i: usize) -> Self {
        Segment::Index(i)
    }
}

/// A normalized field path: a sequence of segments addressing one field
/// inside an entity document.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    /// The empty path, addressing the entity root.
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }

    /// Parses and normalizes an observer-style path string.
    ///
    /// Accepts dotted paths (`a.b`), bracketed indices (`a[2].b`), and `..`
    /// parent back-references (each pops the preceding segment). Parsing the
    /// [`Display`](fmt::Display) rendering of a path yields the same path.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut chars = raw.chars().peekable();
        let mut token = String::new();

        let flush = |token: &mut String, segments: &mut Vec<Segment>| {
            if token.is_empty() {
                return;
            }
            if let Ok(i) = token.parse::<usize>() {
                segments.push(Segment::Index(i));
            } else {
                segments.push(Segment::Field(std::mem::take(token)));
            }
            token.clear();
        };

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    flush(&mut token, &mut segments);
                    // A ".." token directly after a separator pops the
                    // previous segment.
                    while chars.peek() == Some(&'.') {
                        chars.next();
                        if chars.next_if_eq(&'.').is_none() {
                            return Err(ProtocolError::InvalidPath(raw.to_string()));
                        }
                        segments.pop();
                        // Consume the separator trailing the back-reference.
                        if chars.peek() == Some(&'.') && chars.clone().nth(1) != Some('.') {
                            chars.next();
                        }
                    }
                }
                '[' => {
                    flush(&mut token, &mut segments);
                    let mut digits = String::new();
                    let mut closed = false;
                    for d in chars.by_ref() {
                        if d == ']' {
                            closed = true;
                            break;
                        }
                        digits.push(d);
                    }
                    if !closed {
                        return Err(ProtocolError::InvalidPath(raw.to_string()));
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| ProtocolError::InvalidPath(raw.to_string()))?;
                    segments.push(Segment::Index(index));
                }
                ']' => return Err(ProtocolError::InvalidPath(raw.to_string())),
                _ => token.push(c),
            }
        }
        flush(&mut token, &mut segments);

        Ok(FieldPath(segments))
    }

    /// Returns true if this path addresses the entity root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The segments of this path.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Extends the path by one segment. Joining onto the root path yields
    /// a single-segment path.
    pub fn join(&self, segment: impl Into<Segment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        FieldPath(segments)
    }

    /// The path of the parent container, or the root for single-segment
    /// paths. Returns `None` only for the root itself.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(FieldPath(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// The final segment, if any.
    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    /// Returns true if `prefix` is a (non-strict) prefix of this path.
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The path addressing this field's metadata slot: the `_m` map of the
    /// parent container, keyed by the field's own name. Root has no
    /// metadata path.
    pub fn metadata_path(&self) -> Option<Self> {
        let last = self.last()?;
        let parent = self.parent()?;
        Some(parent.join(META_KEY).join(last.key().as_str()))
    }

    /// Reads the value at this path, if present.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.0 {
            current = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Mutable access to the value at this path, if present.
    pub fn get_mut<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
        let mut current = root;
        for segment in &self.0 {
            current = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get_mut(name)?,
                (Segment::Index(i), Value::Array(items)) => items.get_mut(*i)?,
                (Segment::Index(i), Value::Object(map)) => map.get_mut(&i.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes a value at this path, creating intermediate objects as
    /// needed. Arrays are padded with `null` when writing past their end.
    /// Writing at the root is a no-op (the root is the entity itself).
    pub fn set(&self, root: &mut Value, value: Value) -> ProtocolResult<()> {
        let Some(last) = self.last() else {
            return Ok(());
        };
        let parent_path = self.parent().unwrap_or_default();

        let mut current = root;
        for segment in parent_path.segments() {
            current = match segment {
                Segment::Field(name) => {
                    let map = as_object_mut(current, self)?;
                    map.entry(name.clone())
                        .or_insert_with(|| Value::Object(Map::new()))
                }
                Segment::Index(i) => {
                    let items = as_array_mut(current, self)?;
                    if items.len() <= *i {
                        items.resize(*i + 1, Value::Null);
                    }
                    let slot = &mut items[*i];
                    if slot.is_null() {
                        *slot = Value::Object(Map::new());
                    }
                    slot
                }
            };
        }

        match last {
            Segment::Field(name) => {
                let map = as_object_mut(current, self)?;
                map.insert(name.clone(), value);
            }
            Segment::Index(i) => {
                let items = as_array_mut(current, self)?;
                if items.len() <= *i {
                    items.resize(*i + 1, Value::Null);
                }
                items[*i] = value;
            }
        }
        Ok(())
    }

    /// Removes the value at this path, returning it if it was present.
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let last = self.last()?;
        let parent = self.parent()?.get_mut(root)?;
        match (last, parent) {
            (Segment::Field(name), Value::Object(map)) => map.remove(name),
            (Segment::Index(i), Value::Array(items)) if *i < items.len() => Some(items.remove(*i)),
            (Segment::Index(i), Value::Object(map)) => map.remove(&i.to_string()),
            _ => None,
        }
    }
}

fn as_object_mut<'a>(
    value: &'a mut Value,
    path: &FieldPath,
) -> ProtocolResult<&'a mut Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::InvalidPath(format!(
            "{path} traverses a non-object value"
        ))),
    }
}

fn as_array_mut<'a>(value: &'a mut Value, path: &FieldPath) -> ProtocolResult<&'a mut Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(ProtocolError::InvalidPath(format!(
            "{path} indexes a non-array value"
        ))),
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldPath({self})")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<Vec<Segment>> for FieldPath {
    fn from(segments: Vec<Segment>) -> Self {
        FieldPath(segments)
    }
}
