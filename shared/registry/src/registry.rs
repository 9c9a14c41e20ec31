use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::hash_str;

/// Opaque handle returned by [`Registry::add`]; pass it back to
/// [`Registry::del`] to remove exactly the entry it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

struct Entry<T: ?Sized> {
    id: u64,
    key: String,
    obj: Arc<T>,
}

struct Inner<T: ?Sized> {
    buckets: HashMap<u32, Vec<Entry<T>>>,
    next_id: u64,
    len: usize,
}

/// Hash-bucketed map of `Arc<T>` entries keyed by string.
///
/// The registry holds one strong reference per entry. `find` returns a fresh
/// strong reference, so the caller may keep using the object after the entry
/// is deleted. Duplicate keys are allowed (the dialplan registers several
/// extensions under one name); `find` returns the oldest surviving entry.
pub struct Registry<T: ?Sized> {
    name: &'static str,
    inner: RwLock<Inner<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(Inner {
                buckets: HashMap::new(),
                next_id: 1,
                len: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a strong reference under `key`.
    pub fn add(&self, key: &str, obj: Arc<T>) -> EntryId {
        let hash = hash_str(key);
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.len += 1;
        inner.buckets.entry(hash).or_default().push(Entry {
            id,
            key: key.to_owned(),
            obj,
        });
        EntryId(id)
    }

    /// Remove the entry named by `id`, returning its object (the registry's
    /// reference) if it was still present.
    pub fn del(&self, id: EntryId) -> Option<Arc<T>> {
        let inner = &mut *self.inner.write();
        let mut found = None;
        for (hash, bucket) in inner.buckets.iter() {
            if let Some(pos) = bucket.iter().position(|e| e.id == id.0) {
                found = Some((*hash, pos));
                break;
            }
        }
        let (hash, pos) = found?;
        let bucket = inner.buckets.get_mut(&hash)?;
        let entry = bucket.remove(pos);
        let emptied = bucket.is_empty();
        if emptied {
            inner.buckets.remove(&hash);
        }
        inner.len -= 1;
        Some(entry.obj)
    }

    /// Look up `key`, returning a new strong reference on a hit.
    pub fn find(&self, key: &str) -> Option<Arc<T>> {
        let hash = hash_str(key);
        let inner = self.inner.read();
        inner
            .buckets
            .get(&hash)?
            .iter()
            .find(|e| e.key == key)
            .map(|e| Arc::clone(&e.obj))
    }

    /// Replace whatever is stored under `key` with `obj`, or remove the
    /// binding when `obj` is `None`. Returns the previous object.
    ///
    /// This is the mutation primitive of the variable stores: values are
    /// immutable, reassignment swaps the whole entry.
    pub fn replace(&self, key: &str, obj: Option<Arc<T>>) -> Option<Arc<T>> {
        let hash = hash_str(key);
        let inner = &mut *self.inner.write();

        let mut old = None;
        if let Some(bucket) = inner.buckets.get_mut(&hash) {
            if let Some(pos) = bucket.iter().position(|e| e.key == key) {
                old = Some(bucket.remove(pos).obj);
            }
            if bucket.is_empty() {
                inner.buckets.remove(&hash);
            }
        }
        if old.is_some() {
            inner.len -= 1;
        }

        if let Some(obj) = obj {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.len += 1;
            inner.buckets.entry(hash).or_default().push(Entry {
                id,
                key: key.to_owned(),
                obj,
            });
        }
        old
    }

    /// Apply `f` to every entry in unspecified order. Return `true` from `f`
    /// to stop early.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<T>) -> bool,
    {
        let inner = self.inner.read();
        for bucket in inner.buckets.values() {
            for entry in bucket {
                if f(&entry.key, &entry.obj) {
                    return;
                }
            }
        }
    }

    /// Apply `f` to every entry in stable key order.
    pub fn iterate_ordered<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<T>) -> bool,
    {
        let snapshot = self.snapshot_sorted();
        for (key, obj) in &snapshot {
            if f(key, obj) {
                return;
            }
        }
    }

    /// Sorted (key, object) snapshot, cheap enough for CLI rendering.
    pub fn snapshot_sorted(&self) -> Vec<(String, Arc<T>)> {
        let inner = self.inner.read();
        let mut out: Vec<(String, Arc<T>)> = inner
            .buckets
            .values()
            .flatten()
            .map(|e| (e.key.clone(), Arc::clone(&e.obj)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Drop every entry.
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.buckets.clear();
        inner.len = 0;
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
