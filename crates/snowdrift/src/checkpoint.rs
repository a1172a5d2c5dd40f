//! Checkpoint tracking.
//!
//! The latest `STATE` value is kept as-is. The flushed value only moves a
//! stream's bookmark forward once that stream's rows are loaded, and is what
//! gets written to the output. State values are opaque apart from the
//! `bookmarks` object, keyed by stream name.

use serde_json::{Map, Value};

const BOOKMARKS: &str = "bookmarks";

#[derive(Debug, Default)]
pub struct Checkpoint {
    latest: Option<Value>,
    flushed: Option<Value>,
    last_emitted: Option<Value>,
}

fn bookmarks(value: &Value) -> Option<&Map<String, Value>> {
    value.get(BOOKMARKS).and_then(Value::as_object)
}

fn bookmarks_mut(value: &mut Value) -> Option<&mut Map<String, Value>> {
    let object = value.as_object_mut()?;
    object
        .entry(BOOKMARKS)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

impl Checkpoint {
    pub fn latest(&self) -> Option<&Value> {
        self.latest.as_ref()
    }

    pub fn flushed(&self) -> Option<&Value> {
        self.flushed.as_ref()
    }

    /// Record a `STATE` value.
    ///
    /// The first one also seeds the flushed value, minus the bookmarks of
    /// `held` streams whose data is not loaded yet.
    pub fn on_state(&mut self, value: Value, held: &[&str]) {
        if self.flushed.is_none() {
            let mut flushed = value.clone();
            if let Some(object) = flushed.get_mut(BOOKMARKS).and_then(Value::as_object_mut) {
                for stream in held {
                    object.shift_remove(*stream);
                }
            }
            self.flushed = Some(flushed);
        }
        self.latest = Some(value);
    }

    /// Copy the latest bookmark of each of `streams` into the flushed value.
    /// Streams without a latest bookmark keep their flushed bookmark.
    pub fn advance_streams<S: AsRef<str>>(&mut self, streams: &[S]) {
        let (Some(latest), Some(flushed)) = (&self.latest, &mut self.flushed) else {
            return;
        };
        let Some(latest_bookmarks) = bookmarks(latest) else {
            return;
        };
        let Some(flushed_bookmarks) = bookmarks_mut(flushed) else {
            return;
        };
        for stream in streams {
            let stream = stream.as_ref();
            if let Some(bookmark) = latest_bookmarks.get(stream) {
                flushed_bookmarks.insert(stream.to_string(), bookmark.clone());
            }
        }
    }

    /// Make the flushed value a copy of the latest one, keeping flushed
    /// bookmarks of streams the latest value does not mention.
    ///
    /// `held` streams still have uncommitted data: they keep their flushed
    /// bookmark, or get none.
    pub fn advance_all(&mut self, held: &[&str]) {
        let Some(latest) = &self.latest else {
            return;
        };
        let mut next = latest.clone();
        let previous = self.flushed.as_ref().and_then(bookmarks);
        if let Some(next_bookmarks) = next.get_mut(BOOKMARKS).and_then(Value::as_object_mut) {
            for stream in held {
                match previous.and_then(|previous| previous.get(*stream)) {
                    Some(bookmark) => next_bookmarks.insert(stream.to_string(), bookmark.clone()),
                    None => next_bookmarks.shift_remove(*stream),
                };
            }
        }
        if let Some(previous) = previous {
            if let Some(next_bookmarks) = bookmarks_mut(&mut next) {
                for (stream, bookmark) in previous {
                    if !next_bookmarks.contains_key(stream) {
                        next_bookmarks.insert(stream.clone(), bookmark.clone());
                    }
                }
            }
        }
        self.flushed = Some(next);
    }

    /// The flushed value, when it is set and differs from the last one taken.
    pub fn take_emission(&mut self) -> Option<Value> {
        let flushed = self.flushed.as_ref()?;
        if self.last_emitted.as_ref() == Some(flushed) {
            return None;
        }
        self.last_emitted = Some(flushed.clone());
        self.last_emitted.clone()
    }
}
