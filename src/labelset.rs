//! The signal-safe label vector: the data structure an out-of-process reader walks without any
//! cooperation from this thread.
//!
//! See [`crate::abi`] for the wire types and the barrier primitive every mutation protocol below
//! is built from, and the crate-level docs for the full reader contract.

use std::ptr::{self, NonNull};
use std::slice;

use crate::abi::{barrier, ByteString, Label};
use crate::current;
use crate::error::{CustomLabelsError, Result};
use crate::util::unlikely;

/// A growable, thread-owned vector of key/value labels.
///
/// `storage`, `count`, and `capacity` are laid out in that order (see [`crate::abi`]) because an
/// external reader dereferences a `LabelSet` by those field offsets; do not reorder, add, or
/// remove fields without bumping [`crate::abi::ABI_VERSION`].
///
/// A `LabelSet` is mutated only by the thread that owns it. When it is installed as that thread's
/// [`current`] set, every mutation goes through the careful, barrier-protected protocol described
/// in the module docs; otherwise the simpler in-place path is used, since no asynchronous reader
/// targets a set that isn't current.
#[repr(C)]
pub struct LabelSet {
    storage: NonNull<Label>,
    count: usize,
    capacity: usize,
}

// A `LabelSet` is exclusively owned by the thread that created it. The raw `NonNull<Label>`
// storage pointer already makes `Send`/`Sync` un-derivable for this struct, so illegal
// cross-thread sharing is a compile error without an explicit negative impl.

impl LabelSet {
    /// Creates a new, empty label set with room for `capacity` labels before the first grow.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: Self::alloc_storage(capacity),
            count: 0,
            capacity,
        }
    }

    /// Number of live labels, including any transient tombstones mid-mutation.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True if this label set has no live labels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn label_ptr(&self, index: usize) -> *const Label {
        debug_assert!(index < self.capacity);
        unsafe { self.storage.as_ptr().add(index) }
    }

    #[inline]
    fn label_mut_ptr(&mut self, index: usize) -> *mut Label {
        debug_assert!(index < self.capacity);
        unsafe { self.storage.as_ptr().add(index) }
    }

    #[inline]
    fn label_at(&self, index: usize) -> &Label {
        unsafe { &*self.label_ptr(index) }
    }

    /// Index of the first live label whose key matches `key`, per the first-occurrence rule the
    /// reader also follows.
    fn index_of(&self, key: &[u8]) -> Option<usize> {
        for i in 0..self.count {
            let label = self.label_at(i);
            if label.key.is_absent() {
                continue;
            }
            if label.key.as_slice() == key {
                return Some(i);
            }
        }
        None
    }

    /// Looks up a live label by key.
    ///
    /// The returned reference is invalidated by the next mutating call on this label set.
    pub fn get(&self, key: &[u8]) -> Option<&Label> {
        self.index_of(key).map(|i| self.label_at(i))
    }

    /// Inserts or replaces the value for `key`, returning the prior value's bytes, if any.
    ///
    /// `key` must be non-empty is not required, but it must be addressable; callers at the FFI
    /// boundary enforce the size limits from §6 of the design before reaching here.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let careful = current::is_current(self);
        let old_index = self.index_of(key);
        let old_value = old_index.map(|i| self.label_at(i).value.as_slice().to_vec());

        if careful {
            self.push_careful(key, value)?;
            if let Some(i) = old_index {
                self.swap_delete_careful(i);
            }
        } else {
            self.push_fast(key, value)?;
            if let Some(i) = old_index {
                self.swap_delete_fast(i);
            }
        }

        Ok(old_value)
    }

    /// Removes the label for `key`, if present. A no-op if absent.
    pub fn delete(&mut self, key: &[u8]) {
        let careful = current::is_current(self);
        if let Some(i) = self.index_of(key) {
            if careful {
                self.swap_delete_careful(i);
            } else {
                self.swap_delete_fast(i);
            }
        }
    }

    /// Deep-copies every live label into a fresh, independent label set.
    pub fn try_clone(&self) -> Result<LabelSet> {
        let mut new = LabelSet::new(self.count);
        for i in 0..self.count {
            let label = self.label_at(i);
            if label.key.is_absent() {
                continue;
            }
            let key_buf = Self::alloc_bytes(label.key.as_slice())?;
            let value_buf = Self::alloc_bytes(label.value.as_slice())?;
            unsafe {
                *new.label_mut_ptr(new.count) = Label {
                    key: ByteString {
                        len: label.key.len,
                        buf: key_buf.as_ptr(),
                    },
                    value: ByteString {
                        len: label.value.len,
                        buf: value_buf.as_ptr(),
                    },
                };
            }
            new.count += 1;
        }
        Ok(new)
    }

    /// Renders `"{k1: v1, k2: v2}"`, skipping tombstones, in storage order.
    pub fn debug_string(&self) -> String {
        let mut out = String::from("{");
        let mut first = true;
        for i in 0..self.count {
            let label = self.label_at(i);
            if label.key.is_absent() {
                continue;
            }
            if !first {
                out.push_str(", ");
            }
            first = false;
            out.push_str(&String::from_utf8_lossy(label.key.as_slice()));
            out.push_str(": ");
            out.push_str(&String::from_utf8_lossy(label.value.as_slice()));
        }
        out.push('}');
        out
    }

    // --- allocation helpers -------------------------------------------------------------

    fn alloc_storage(capacity: usize) -> NonNull<Label> {
        let placeholder = Label {
            key: ByteString::ABSENT,
            value: ByteString::ABSENT,
        };
        let mut v = vec![placeholder; capacity];
        let ptr = v.as_mut_ptr();
        std::mem::forget(v);
        // `Vec::as_mut_ptr` is never null, including for a zero-capacity vector.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Reclaims the raw array allocated by [`Self::alloc_storage`]. `Label` has no drop glue of
    /// its own (its buffers are freed explicitly, by value, wherever they're retired), so
    /// reconstructing a `Vec` over possibly-uninitialized-beyond-`count` slots and dropping it is
    /// just a deallocation, never a use of uninitialized data.
    unsafe fn free_storage(storage: NonNull<Label>, capacity: usize) {
        unsafe {
            drop(Vec::from_raw_parts(storage.as_ptr(), capacity, capacity));
        }
    }

    fn alloc_bytes(bytes: &[u8]) -> Result<NonNull<u8>> {
        let mut v: Vec<u8> = Vec::new();
        v.try_reserve_exact(bytes.len())
            .map_err(|_| CustomLabelsError::AllocFailed)?;
        v.extend_from_slice(bytes);
        let ptr = v.as_mut_ptr();
        std::mem::forget(v);
        // `Vec::as_mut_ptr` is never null, even for an empty (zero-length) buffer.
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn free_bytes(buf: *const u8, len: usize) {
        if !buf.is_null() {
            unsafe {
                drop(Vec::from_raw_parts(buf as *mut u8, len, len));
            }
        }
    }

    unsafe fn free_label_buffers(&mut self, index: usize) {
        let label = *self.label_ptr(index);
        unsafe {
            Self::free_bytes(label.key.buf, label.key.len);
            Self::free_bytes(label.value.buf, label.value.len);
        }
    }

    // --- grow -----------------------------------------------------------------------------

    /// Grow used while this set is [`current`]: allocate-copy-publish-free, never in place, so a
    /// reader holding the old `storage` pointer keeps seeing a valid, fully-populated array until
    /// the barrier after the publish.
    fn grow_careful(&mut self) -> Result<()> {
        let new_cap = (self.capacity * 2).max(1);
        let new_storage = Self::try_alloc_storage(new_cap)?;
        unsafe {
            ptr::copy_nonoverlapping(self.storage.as_ptr(), new_storage.as_ptr(), self.count);
        }
        let old_storage = self.storage;
        let old_cap = self.capacity;
        barrier();
        self.storage = new_storage;
        barrier();
        self.capacity = new_cap;
        barrier();
        unsafe { Self::free_storage(old_storage, old_cap) };
        Ok(())
    }

    /// Grow used when this set isn't current: no reader is watching it, so an in-place resize
    /// (conceptually a `realloc`) is fine.
    fn grow_fast(&mut self) -> Result<()> {
        let new_cap = (self.capacity * 2).max(1);
        let mut v = unsafe { Vec::from_raw_parts(self.storage.as_ptr(), self.count, self.capacity) };
        v.try_reserve_exact(new_cap - self.count)
            .map_err(|_| CustomLabelsError::AllocFailed)?;
        v.resize(
            new_cap,
            Label {
                key: ByteString::ABSENT,
                value: ByteString::ABSENT,
            },
        );
        let actual_cap = v.capacity();
        let ptr = v.as_mut_ptr();
        std::mem::forget(v);
        self.storage = unsafe { NonNull::new_unchecked(ptr) };
        self.capacity = actual_cap;
        Ok(())
    }

    fn try_alloc_storage(capacity: usize) -> Result<NonNull<Label>> {
        let placeholder = Label {
            key: ByteString::ABSENT,
            value: ByteString::ABSENT,
        };
        let mut v: Vec<Label> = Vec::new();
        v.try_reserve_exact(capacity)
            .map_err(|_| CustomLabelsError::AllocFailed)?;
        v.resize(capacity, placeholder);
        let ptr = v.as_mut_ptr();
        std::mem::forget(v);
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    // --- push -----------------------------------------------------------------------------

    fn push_careful(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if unlikely(self.count == self.capacity) {
            self.grow_careful()?;
        }
        let key_buf = Self::alloc_bytes(key)?;
        let value_buf = match Self::alloc_bytes(value) {
            Ok(buf) => buf,
            Err(e) => {
                unsafe { Self::free_bytes(key_buf.as_ptr(), key.len()) };
                return Err(e);
            }
        };
        let index = self.count;
        unsafe {
            *self.label_mut_ptr(index) = Label {
                key: ByteString {
                    len: key.len(),
                    buf: key_buf.as_ptr(),
                },
                value: ByteString {
                    len: value.len(),
                    buf: value_buf.as_ptr(),
                },
            };
        }
        // The new slot must be fully populated before the reader can see `count` include it.
        barrier();
        self.count += 1;
        Ok(())
    }

    fn push_fast(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if unlikely(self.count == self.capacity) {
            self.grow_fast()?;
        }
        let key_buf = Self::alloc_bytes(key)?;
        let value_buf = match Self::alloc_bytes(value) {
            Ok(buf) => buf,
            Err(e) => {
                unsafe { Self::free_bytes(key_buf.as_ptr(), key.len()) };
                return Err(e);
            }
        };
        let index = self.count;
        unsafe {
            *self.label_mut_ptr(index) = Label {
                key: ByteString {
                    len: key.len(),
                    buf: key_buf.as_ptr(),
                },
                value: ByteString {
                    len: value.len(),
                    buf: value_buf.as_ptr(),
                },
            };
        }
        self.count += 1;
        Ok(())
    }

    // --- swap-delete ------------------------------------------------------------------------

    /// Removes label `victim` under the careful, barrier-protected protocol required while this
    /// set is current. See the module docs for why each barrier is where it is.
    fn swap_delete_careful(&mut self, victim: usize) {
        debug_assert!(self.count > 0);
        let last = self.count - 1;

        if victim == last {
            self.count -= 1;
            // The memory must not be freed until the reader can no longer see `count` include it.
            barrier();
            unsafe { self.free_label_buffers(victim) };
            return;
        }

        let old_key_buf = self.label_at(victim).key.buf;
        let old_key_len = self.label_at(victim).key.len;
        let old_value = self.label_at(victim).value;

        unsafe {
            (*self.label_mut_ptr(victim)).key.buf = ptr::null();
        }
        // From here the reader must skip `victim` as a tombstone before its buffers are freed.
        barrier();
        unsafe {
            Self::free_bytes(old_key_buf, old_key_len);
            Self::free_bytes(old_value.buf, old_value.len);
        }

        let last_label = *self.label_ptr(last);
        unsafe {
            (*self.label_mut_ptr(victim)).value = last_label.value;
            (*self.label_mut_ptr(victim)).key.len = last_label.key.len;
        }
        // `victim` must look exactly like `last` (modulo its still-null key.buf) before we make
        // it live, or a reader could see a label with a stale value paired with the new key.
        barrier();
        unsafe {
            (*self.label_mut_ptr(victim)).key.buf = last_label.key.buf;
        }
        // There are now two live copies of the same key (`victim` and `last`); the reader's
        // first-occurrence rule makes this safe. Only once `victim` is visibly live do we retire
        // `last` by shrinking `count` past it.
        barrier();
        self.count -= 1;
    }

    /// Removes label `victim` without any barriers, since no reader targets a non-current set.
    fn swap_delete_fast(&mut self, victim: usize) {
        debug_assert!(self.count > 0);
        let last = self.count - 1;
        unsafe { self.free_label_buffers(victim) };
        let last_label = *self.label_ptr(last);
        unsafe {
            *self.label_mut_ptr(victim) = last_label;
        }
        self.count -= 1;
    }

    /// A reference implementation of the reader contract: walks `storage[0..count]`, skipping
    /// tombstones and resolving duplicate keys by first occurrence, using only the loads the ABI
    /// promises are safe at any instruction boundary (see the crate-level docs).
    ///
    /// This is what an out-of-process profiler does when it samples a thread; it's exposed here,
    /// rather than kept test-private, so that harnesses validating reader-snapshot integrity (and
    /// anyone implementing a reader against this ABI) have one canonical implementation to check
    /// against instead of re-deriving the walk.
    ///
    /// # Safety
    ///
    /// `ptr` must be either null (treated as "no labels") or point to a `LabelSet` whose `storage`
    /// allocation is still mapped — it may be retired (about to be freed or already logically
    /// dead) but must not have been unmapped from the process's address space.
    pub unsafe fn reader_snapshot(ptr: *const LabelSet) -> Vec<(Vec<u8>, Vec<u8>)> {
        if ptr.is_null() {
            return Vec::new();
        }
        let ls = unsafe { &*ptr };
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for i in 0..ls.count {
            let label = ls.label_at(i);
            if label.key.is_absent() {
                continue;
            }
            let key = label.key.as_slice().to_vec();
            if !seen.insert(key.clone()) {
                continue;
            }
            out.push((key, label.value.as_slice().to_vec()));
        }
        out
    }

    #[cfg(test)]
    fn reader_view(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        unsafe { Self::reader_snapshot(self) }
    }
}

impl Drop for LabelSet {
    fn drop(&mut self) {
        debug_assert!(
            !current::is_current(self),
            "a LabelSet must not be freed while it is the CurrentSet of its thread"
        );
        for i in 0..self.count {
            if !self.label_at(i).key.is_absent() {
                unsafe { self.free_label_buffers(i) };
            }
        }
        unsafe { Self::free_storage(self.storage, self.capacity) };
    }
}
