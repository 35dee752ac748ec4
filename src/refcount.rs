//! Shared ownership of a [`LabelSet`](crate::labelset::LabelSet) between an async task and its
//! children, with copy-on-write promoted to the mutator (see [`crate::scope`]).
//!
//! Unlike the atomic `RefCount` a concurrent reader/writer map needs, this refcount is plain
//! `usize`, never atomic: an `AsyncMap` and every `RefCountedSet` it can reach belong to exactly
//! one thread, so there is no concurrent mutator to race against — only the out-of-process reader,
//! which never touches refcounts at all.

use std::process::abort;

use crate::labelset::LabelSet;

/// A label set shared by reference count among `AsyncMap` entries.
///
/// `refs` counts the number of map entries pointing at this carrier. When it reaches zero the
/// carrier is unreachable and must be freed by its owner.
pub struct RefCountedSet {
    /// The shared label set.
    pub labelset: LabelSet,
    refs: usize,
}

impl RefCountedSet {
    /// Creates a new carrier around `labelset` with a single reference.
    pub fn new(labelset: LabelSet) -> Self {
        Self { labelset, refs: 1 }
    }

    /// Current reference count.
    #[inline]
    pub fn refs(&self) -> usize {
        self.refs
    }

    /// True if more than one map entry points at this carrier.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.refs > 1
    }

    /// Adds one more reference, aborting on overflow rather than silently wrapping into a use-
    /// after-free later — an unreachable invariant violation, not a recoverable error.
    #[inline]
    pub fn increment(&mut self) {
        self.refs = match self.refs.checked_add(1) {
            Some(n) => n,
            None => abort(),
        };
    }

    /// Removes one reference and returns the remaining count.
    #[inline]
    pub fn decrement(&mut self) -> usize {
        debug_assert!(self.refs > 0);
        self.refs -= 1;
        self.refs
    }

    /// Decrements the reference count behind `ptr` and, if that was the last reference, frees the
    /// carrier (dropping its `LabelSet` along with it).
    ///
    /// Centralizing this here, rather than duplicating "decrement, maybe free" at each of
    /// `AsyncMap`'s teardown and `scope`'s `destroy`/`propagate`, is the one place that pattern
    /// needs to be correct.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid, non-null pointer produced by `Box::into_raw(Box::new(RefCountedSet
    /// ::new(..)))`, not already freed, and not aliased by any other live reference at the moment
    /// this call observes `refs == 1`.
    pub unsafe fn unref(ptr: *mut RefCountedSet) {
        debug_assert!(!ptr.is_null());
        unsafe {
            if (*ptr).decrement() == 0 {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_ref() {
        let rc = RefCountedSet::new(LabelSet::new(0));
        assert_eq!(rc.refs(), 1);
        assert!(!rc.is_shared());
    }

    #[test]
    fn increment_and_decrement() {
        let mut rc = RefCountedSet::new(LabelSet::new(0));
        rc.increment();
        assert_eq!(rc.refs(), 2);
        assert!(rc.is_shared());
        assert_eq!(rc.decrement(), 1);
        assert!(!rc.is_shared());
    }
}
