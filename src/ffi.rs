//! The `extern "C"` boundary: argument validation and marshalling for the embedding language.
//!
//! Everything above this module deals in `Vec<u8>`/`&[u8]` and an honest `Result`. This module is
//! the only place that accepts raw pointers and lengths from outside the process's Rust code,
//! enforces the bounds from the crate docs (§6) before any state is touched, and translates this
//! crate's [`CustomLabelsError`] into the three-way result code the host binding expects.

use std::slice;

use crate::abi::{ByteString, Label};
use crate::current;
use crate::error::CustomLabelsError;
use crate::labelset::LabelSet;
use crate::scope;

/// Per-call cap on the number of labels `with_labels` accepts, matching the original addon's
/// `MAX_LABELS`.
pub const MAX_LABELS: usize = 10;
/// Per-call cap on key length in bytes, matching `MAX_KEY_SIZE`.
pub const MAX_KEY_SIZE: usize = 16;
/// Per-call cap on value length in bytes, matching `MAX_VAL_SIZE`.
pub const MAX_VAL_SIZE: usize = 48;

/// Result codes returned across the FFI boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The call completed as requested.
    Success = 0,
    /// A heap allocation failed; the affected state was left unchanged.
    AllocFailed = 1,
    /// `cl_propagate`'s child id already had an entry, which was replaced.
    ChildAlreadyExisted = 2,
    /// The caller violated a boundary contract (size/count limit, bad pointer). Nothing mutated.
    InvalidArgument = 3,
}

impl From<CustomLabelsError> for ResultCode {
    fn from(err: CustomLabelsError) -> Self {
        match err {
            CustomLabelsError::AllocFailed => ResultCode::AllocFailed,
            CustomLabelsError::ChildAlreadyExisted => ResultCode::ChildAlreadyExisted,
            CustomLabelsError::InvalidArgument(_) => ResultCode::InvalidArgument,
        }
    }
}

/// Shares `parent`'s labels with `child`. See [`crate::scope::propagate`].
#[no_mangle]
pub extern "C" fn cl_propagate(parent_id: u64, child_id: u64) -> ResultCode {
    match scope::propagate(parent_id, child_id) {
        Ok(()) => ResultCode::Success,
        Err(CustomLabelsError::ChildAlreadyExisted) => {
            log::debug!("cl_propagate: child {child_id} already had an entry; replaced");
            ResultCode::ChildAlreadyExisted
        }
        Err(e) => e.into(),
    }
}

/// Releases `async_id`'s entry. See [`crate::scope::destroy`].
#[no_mangle]
pub extern "C" fn cl_destroy(async_id: u64) -> ResultCode {
    match scope::destroy(async_id) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.into(),
    }
}

/// Signature of the embedding-language callback `cl_with_labels` invokes.
///
/// The callback receives the `user_data` pointer passed to `cl_with_labels` unchanged, and its
/// return value (if non-null) is forwarded back to the caller of `cl_with_labels`. A null return
/// is treated as "the callback raised", matching how the original addon surfaces a V8 exception
/// from inside `func->Call`.
pub type WithLabelsCallback =
    unsafe extern "C" fn(user_data: *mut std::ffi::c_void) -> *mut std::ffi::c_void;

/// Runs `callback` with up to [`MAX_LABELS`] additional labels applied to `async_id`'s label set,
/// restoring prior values once `callback` returns.
///
/// `keys`/`values` and `key_lens`/`value_lens` must each have `n_labels` elements. Bounds are
/// validated before any state is touched; on [`ResultCode::InvalidArgument`] nothing is mutated
/// and `callback` is never invoked.
///
/// # Safety
///
/// `keys[i]`/`values[i]` must each point to at least `key_lens[i]`/`value_lens[i]` valid,
/// readable bytes. `callback` must be a valid function pointer safe to call with `user_data`.
#[no_mangle]
pub unsafe extern "C" fn cl_with_labels(
    async_id: u64,
    callback: WithLabelsCallback,
    user_data: *mut std::ffi::c_void,
    n_labels: usize,
    keys: *const *const u8,
    key_lens: *const usize,
    values: *const *const u8,
    value_lens: *const usize,
    out: *mut *mut std::ffi::c_void,
) -> ResultCode {
    if n_labels > MAX_LABELS {
        log::warn!("cl_with_labels: {n_labels} labels exceeds max of {MAX_LABELS}");
        return ResultCode::InvalidArgument;
    }

    let mut labels = Vec::with_capacity(n_labels);
    for i in 0..n_labels {
        let (key_ptr, key_len, value_ptr, value_len) = unsafe {
            (
                *keys.add(i),
                *key_lens.add(i),
                *values.add(i),
                *value_lens.add(i),
            )
        };
        if key_len > MAX_KEY_SIZE || value_len > MAX_VAL_SIZE {
            log::warn!(
                "cl_with_labels: label {i} exceeds size limits (key {key_len}/{MAX_KEY_SIZE}, \
                 value {value_len}/{MAX_VAL_SIZE})"
            );
            return ResultCode::InvalidArgument;
        }
        let key = unsafe { slice::from_raw_parts(key_ptr, key_len) }.to_vec();
        let value = unsafe { slice::from_raw_parts(value_ptr, value_len) }.to_vec();
        labels.push((key, value));
    }

    let result = scope::with_labels(async_id, &labels, || unsafe { callback(user_data) });
    match result {
        Ok(ret) => {
            if !out.is_null() {
                unsafe { *out = ret };
            }
            ResultCode::Success
        }
        Err(e) => e.into(),
    }
}

/// Returns a handle to `async_id`'s label set, materializing one if none exists yet. See
/// [`crate::scope::reify_handle`].
///
/// # Safety
/// `out`, if non-null, must point to valid, writable storage for a `*mut LabelSet`.
#[no_mangle]
pub unsafe extern "C" fn cl_reify_handle(async_id: u64, out: *mut *mut LabelSet) -> ResultCode {
    match unsafe { scope::reify_handle(async_id) } {
        Ok(ptr) => {
            if !out.is_null() {
                unsafe { *out = ptr };
            }
            ResultCode::Success
        }
        Err(e) => e.into(),
    }
}

/// Sets `key` to `value` on the label set `ls` points to.
///
/// # Safety
/// `ls` must be a valid, exclusively-accessed `LabelSet`. `key`/`value` must point to `key_len`/
/// `value_len` valid bytes.
#[no_mangle]
pub unsafe extern "C" fn cl_labelset_set_value(
    ls: *mut LabelSet,
    key: *const u8,
    key_len: usize,
    value: *const u8,
    value_len: usize,
) -> ResultCode {
    if ls.is_null() || key.is_null() {
        return ResultCode::InvalidArgument;
    }
    let key = unsafe { slice::from_raw_parts(key, key_len) };
    let value = unsafe { slice::from_raw_parts(value, value_len) };
    match unsafe { &mut *ls }.set(key, value) {
        Ok(_) => ResultCode::Success,
        Err(e) => e.into(),
    }
}

/// Looks up `key` on the label set `ls` points to, writing its bytes into `out` if found.
///
/// Returns `true` if the key was found. The returned `ByteString` borrows from `ls`'s internal
/// storage and is invalidated by the next mutating call on `ls`, matching
/// `custom_labels_labelset_get`'s documented contract.
///
/// # Safety
/// `ls` must be a valid `LabelSet`. `out` must be a valid, writable `ByteString`.
#[no_mangle]
pub unsafe extern "C" fn cl_labelset_get_value(
    ls: *const LabelSet,
    key: *const u8,
    key_len: usize,
    out: *mut ByteString,
) -> bool {
    if ls.is_null() || key.is_null() || out.is_null() {
        return false;
    }
    let key = unsafe { slice::from_raw_parts(key, key_len) };
    match unsafe { &*ls }.get(key) {
        Some(Label { value, .. }) => {
            unsafe { *out = *value };
            true
        }
        None => false,
    }
}

/// Deletes `key` from the label set `ls` points to, if present.
///
/// # Safety
/// `ls` must be a valid, exclusively-accessed `LabelSet`.
#[no_mangle]
pub unsafe extern "C" fn cl_labelset_delete_value(ls: *mut LabelSet, key: *const u8, key_len: usize) {
    if ls.is_null() || key.is_null() {
        return;
    }
    let key = unsafe { slice::from_raw_parts(key, key_len) };
    unsafe { &mut *ls }.delete(key);
}

/// Installs `ls` as this thread's current label set, returning the previously installed one (or
/// null).
///
/// # Safety
/// `ls` must either be null or a valid, exclusively-owned `LabelSet` not already installed on
/// another thread.
#[no_mangle]
pub unsafe extern "C" fn cl_labelset_install(ls: *mut LabelSet) -> *mut LabelSet {
    unsafe { current::replace(ls) }
}

/// Installs null as this thread's current label set, returning the previously installed one.
#[no_mangle]
pub extern "C" fn cl_clear_current_label_set() -> *mut LabelSet {
    unsafe { current::replace(std::ptr::null_mut()) }
}

/// Returns the address of this thread's `current_set` slot, for the reader to learn once at
/// startup.
#[no_mangle]
pub extern "C" fn cl_current_set_addr() -> *const *mut LabelSet {
    current::current_set_addr()
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn identity_callback(data: *mut std::ffi::c_void) -> *mut std::ffi::c_void {
        data
    }

    #[test]
    fn rejects_too_many_labels() {
        let keys = [std::ptr::null::<u8>(); MAX_LABELS + 1];
        let key_lens = [0usize; MAX_LABELS + 1];
        let values = [std::ptr::null::<u8>(); MAX_LABELS + 1];
        let value_lens = [0usize; MAX_LABELS + 1];
        let mut out = std::ptr::null_mut();
        let code = unsafe {
            cl_with_labels(
                1,
                identity_callback,
                std::ptr::null_mut(),
                MAX_LABELS + 1,
                keys.as_ptr(),
                key_lens.as_ptr(),
                values.as_ptr(),
                value_lens.as_ptr(),
                &mut out,
            )
        };
        assert_eq!(code, ResultCode::InvalidArgument);
    }

    #[test]
    fn rejects_oversized_key() {
        let key = vec![b'k'; MAX_KEY_SIZE + 1];
        let value = vec![b'v'; 1];
        let keys = [key.as_ptr()];
        let key_lens = [key.len()];
        let values = [value.as_ptr()];
        let value_lens = [value.len()];
        let mut out = std::ptr::null_mut();
        let code = unsafe {
            cl_with_labels(
                2,
                identity_callback,
                std::ptr::null_mut(),
                1,
                keys.as_ptr(),
                key_lens.as_ptr(),
                values.as_ptr(),
                value_lens.as_ptr(),
                &mut out,
            )
        };
        assert_eq!(code, ResultCode::InvalidArgument);
    }

    #[test]
    fn set_get_delete_roundtrip_through_ffi() {
        let mut ls = LabelSet::new(0);
        let ls_ptr = &mut ls as *mut LabelSet;
        let key = b"env";
        let value = b"prod";
        let code = unsafe {
            cl_labelset_set_value(ls_ptr, key.as_ptr(), key.len(), value.as_ptr(), value.len())
        };
        assert_eq!(code, ResultCode::Success);

        let mut out = ByteString::ABSENT;
        let found = unsafe { cl_labelset_get_value(ls_ptr, key.as_ptr(), key.len(), &mut out) };
        assert!(found);
        assert_eq!(out.as_slice(), value);

        unsafe { cl_labelset_delete_value(ls_ptr, key.as_ptr(), key.len()) };
        let found = unsafe { cl_labelset_get_value(ls_ptr, key.as_ptr(), key.len(), &mut out) };
        assert!(!found);
    }
}
