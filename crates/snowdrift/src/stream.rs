//! Per-stream buffering state.

use std::cmp::Ordering;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::flatten::{FlatRecord, FlatValue};
use crate::sync::TableTarget;
use crate::transform::RecordTransform;

/// Min and max of the single bookmark column of a stream, reported as
/// archive metadata.
#[derive(Debug, Clone, Default)]
pub struct BookmarkRange {
    column: Option<String>,
    min: Option<FlatValue>,
    max: Option<FlatValue>,
}

impl BookmarkRange {
    /// Tracks values only when exactly one bookmark property is declared.
    pub fn new(bookmark_properties: Option<&[String]>) -> Self {
        let column = match bookmark_properties {
            Some([column]) => Some(column.clone()),
            _ => None,
        };
        Self {
            column,
            min: None,
            max: None,
        }
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn observe(&mut self, row: &FlatRecord) {
        let Some(column) = &self.column else {
            return;
        };
        let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
            return;
        };
        if self.min.as_ref().is_none_or(|min| compare(value, min) == Ordering::Less) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().is_none_or(|max| compare(value, max) == Ordering::Greater) {
            self.max = Some(value.clone());
        }
    }

    /// `incremental-key`, `incremental-key-min` and `incremental-key-max`
    /// once a value has been observed.
    pub fn metadata(&self) -> Vec<(String, String)> {
        match (&self.column, &self.min, &self.max) {
            (Some(column), Some(min), Some(max)) => vec![
                ("incremental-key".to_string(), column.clone()),
                ("incremental-key-min".to_string(), min.to_string()),
                ("incremental-key-max".to_string(), max.to_string()),
            ],
            _ => Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.min = None;
        self.max = None;
    }
}

/// Numbers compare numerically, everything else by its text.
fn compare(a: &FlatValue, b: &FlatValue) -> Ordering {
    let number = |v: &FlatValue| match v {
        FlatValue::Int(i) => Some(*i as f64),
        FlatValue::Float(f) => Some(*f),
        _ => None,
    };
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// A stream with a schema, its destination and its buffered rows.
#[derive(Debug)]
pub struct StreamState {
    pub transform: Arc<RecordTransform>,
    pub target: TableTarget,
    /// Rows keyed by primary-key string. A later record with the same key
    /// replaces the earlier one in place.
    pub bucket: IndexMap<String, FlatRecord>,
    /// Distinct keys buffered since the last flush.
    pub row_count: usize,
    /// Distinct keys buffered since the schema was set.
    pub total_rows: u64,
    pub bookmarks: BookmarkRange,
}

impl StreamState {
    pub fn new(transform: Arc<RecordTransform>, target: TableTarget, bookmark_properties: Option<&[String]>) -> Self {
        Self {
            transform,
            target,
            bucket: IndexMap::new(),
            row_count: 0,
            total_rows: 0,
            bookmarks: BookmarkRange::new(bookmark_properties),
        }
    }

    /// Add a row under `key`, or under a synthetic `RID-<n>` key when the
    /// stream has no key properties. Returns whether the key was new.
    pub fn buffer(&mut self, key: Option<String>, row: FlatRecord) -> bool {
        let key = key.unwrap_or_else(|| format!("RID-{}", self.total_rows));
        self.bookmarks.observe(&row);
        let is_new = self.bucket.insert(key, row).is_none();
        if is_new {
            self.row_count += 1;
            self.total_rows += 1;
        }
        is_new
    }

    pub fn has_rows(&self) -> bool {
        !self.bucket.is_empty()
    }

    /// Copy of the buffered rows in insertion order.
    pub fn snapshot(&self) -> Vec<FlatRecord> {
        self.bucket.values().cloned().collect()
    }

    /// Forget buffered rows after a successful flush.
    pub fn clear(&mut self) {
        self.bucket.clear();
        self.row_count = 0;
        self.bookmarks.reset();
    }
}
