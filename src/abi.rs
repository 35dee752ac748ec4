//! Wire layout shared with the out-of-process reader, and the single barrier
//! primitive every mutation protocol in this crate is built from.
//!
//! Everything in this module is part of the stable ABI described in the crate's top-level
//! documentation. A change to a field's type, order, or meaning here is a breaking ABI change
//! and must bump [`ABI_VERSION`].

use std::sync::atomic::Ordering;

/// Monotonically increasing ABI version. Bump this whenever the wire layout of
/// [`ByteString`], [`Label`], [`crate::labelset::LabelSet`], or [`crate::hashmap::AsyncMap`]
/// changes in a way the reader must know about.
pub const ABI_VERSION: u32 = 1;

/// A length-prefixed, non-nul-terminated byte string.
///
/// `buf` may be null, in which case the string is considered absent regardless of `len`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ByteString {
    /// Length in bytes. Authoritative even when `buf` is null.
    pub len: usize,
    /// Pointer to the first byte, or null if absent.
    pub buf: *const u8,
}

impl ByteString {
    /// The canonical "absent" value used for out-parameters and tombstones.
    pub const ABSENT: ByteString = ByteString {
        len: 0,
        buf: std::ptr::null(),
    };

    /// True if this string is the absent marker (null `buf`), regardless of `len`.
    #[inline]
    pub fn is_absent(&self) -> bool {
        self.buf.is_null()
    }

    /// Borrows the bytes this string points to, or an empty slice if absent.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        if self.buf.is_null() {
            &[]
        } else {
            // SAFETY: callers that construct a non-null `ByteString` guarantee `buf` points to
            // `len` valid, immutable bytes for as long as the `ByteString` is reachable.
            unsafe { std::slice::from_raw_parts(self.buf, self.len) }
        }
    }
}

/// A single key/value label.
///
/// A `key.buf == null` marks this slot as a tombstone: the reader must skip it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Label {
    /// The label's key. `buf == null` marks this slot as a tombstone.
    pub key: ByteString,
    /// The label's value.
    pub value: ByteString,
}

/// Prevents the compiler from reordering memory operations across this point.
///
/// This is the Rust analogue of the C `BARRIER` macro (`asm volatile("" ::: "memory")`) used
/// throughout the original implementation. It is a *compiler* barrier only — it says nothing
/// about hardware reordering. On the architectures this crate targets (x86-64, aarch64) plain
/// loads and stores to aligned, pointer-sized locations are not reordered by the hardware with
/// respect to each other in the ways that matter here, so a compiler fence is sufficient; see
/// [`crate::hashmap`] for the one operation (rehash publish) that additionally requires an
/// atomic paired store.
///
/// Under `--cfg loom` this becomes a real `loom` fence instead of a compiler-only one, so the
/// model checker has a synchronization point to schedule interleavings around; a bare
/// `compiler_fence` is invisible to loom's scheduler and would make every barrier a no-op for
/// the purpose of exploring reader/writer races in `tests/loom.rs`.
#[inline(always)]
pub fn barrier() {
    #[cfg(loom)]
    {
        crate::util::loom::sync::atomic::fence(Ordering::SeqCst);
    }
    #[cfg(not(loom))]
    {
        std::sync::atomic::compiler_fence(Ordering::SeqCst);
    }
}
