//! Copy-on-write sharing between async tasks and the scoped "run with extra labels" primitive.
//!
//! This module owns the per-thread [`AsyncMap`] and is the only place that mutates
//! [`RefCountedSet`] refcounts, per the single-thread-owner rule in the crate docs.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{CustomLabelsError, Result};
use crate::hashmap::AsyncMap;
use crate::labelset::LabelSet;
use crate::refcount::RefCountedSet;

thread_local! {
    static ASYNC_MAP: RefCell<Option<AsyncMap>> = const { RefCell::new(None) };
}

/// Runs `f` with this thread's `AsyncMap`, lazily allocating it on first use.
///
/// The borrow of the thread-local `RefCell` lives only for the duration of `f`, never across a
/// caller-supplied callback: [`with_labels`] calls this once to `reify` the target set and drops
/// the borrow before invoking its callable, so the callable (and recursive `with_labels`,
/// `propagate`, or `destroy` calls it makes) never observes this borrow held.
fn with_map<R>(f: impl FnOnce(&mut AsyncMap) -> Result<R>) -> Result<R> {
    ASYNC_MAP.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(AsyncMap::try_new()?);
        }
        f(slot.as_mut().expect("just initialized above"))
    })
}

/// Shares `parent`'s label set with `child`, if `parent` has one and it isn't empty.
///
/// A parent with no entry, or an empty one, leaves the child untouched — this is what keeps the
/// map sparse: most async tasks never set a label, and we don't want an entry for every one of
/// them just because their parent exists.
pub fn propagate(parent: u64, child: u64) -> Result<()> {
    with_map(|map| {
        let Some(parent_ptr) = map.get(parent) else {
            return Ok(());
        };
        if unsafe { (*parent_ptr).labelset.is_empty() } {
            return Ok(());
        }

        unsafe { (*parent_ptr).increment() };

        let prior = match map.insert(child, parent_ptr) {
            Ok(prior) => prior,
            Err(e) => {
                unsafe { (*parent_ptr).decrement() };
                return Err(e);
            }
        };

        if let Some(old) = prior {
            unsafe { RefCountedSet::unref(old) };
            log::debug!("propagate: child {child} already had a label set; it was replaced");
            return Err(CustomLabelsError::ChildAlreadyExisted);
        }

        Ok(())
    })
}

/// Removes `async_id`'s entry, releasing the underlying label set once its refcount reaches
/// zero. A no-op if `async_id` has no entry.
///
/// The caller (the host runtime's async-hook binding) must not call this for an id that is
/// currently executing, since that id's label set may be installed as [`crate::current`].
pub fn destroy(async_id: u64) -> Result<()> {
    with_map(|map| {
        if let Some(ptr) = map.delete(async_id) {
            unsafe { RefCountedSet::unref(ptr) };
        }
        Ok(())
    })
}

/// Returns a handle to `async_id`'s label set, materializing one if none exists yet.
///
/// This is what backs the foreign-boundary `labelset.getValue`/`setValue`/`deleteValue`
/// operations (§6) for a specific async id rather than the thread's current set: the embedding
/// binding calls this once per task to obtain a handle, then operates on it directly. The
/// returned pointer is valid until the next mutating call to this module for the same
/// `async_id` (a `propagate`, `destroy`, or `with_labels` call may replace it via copy-on-write).
///
/// # Safety
///
/// The caller must not free the returned pointer — it is owned by this module's `AsyncMap` — and
/// must not retain it past the next `propagate`/`destroy`/`with_labels` call for `async_id`.
pub unsafe fn reify_handle(async_id: u64) -> Result<*mut LabelSet> {
    reify(async_id, 0)
}

fn reify(async_id: u64, capacity_hint: usize) -> Result<*mut LabelSet> {
    with_map(|map| match map.get(async_id) {
        None => {
            let rc_ptr = Box::into_raw(Box::new(RefCountedSet::new(LabelSet::new(capacity_hint))));
            if let Err(e) = map.insert(async_id, rc_ptr) {
                unsafe { RefCountedSet::unref(rc_ptr) };
                return Err(e);
            }
            Ok(unsafe { &mut (*rc_ptr).labelset as *mut LabelSet })
        }
        Some(rc_ptr) if !unsafe { (*rc_ptr).is_shared() } => {
            Ok(unsafe { &mut (*rc_ptr).labelset as *mut LabelSet })
        }
        Some(rc_ptr) => {
            let cloned = unsafe { (*rc_ptr).labelset.try_clone() }?;
            let new_rc_ptr = Box::into_raw(Box::new(RefCountedSet::new(cloned)));
            match map.insert(async_id, new_rc_ptr) {
                Ok(prior) => {
                    debug_assert_eq!(prior, Some(rc_ptr));
                    unsafe { RefCountedSet::unref(rc_ptr) };
                    Ok(unsafe { &mut (*new_rc_ptr).labelset as *mut LabelSet })
                }
                Err(e) => {
                    unsafe { RefCountedSet::unref(new_rc_ptr) };
                    Err(e)
                }
            }
        }
    })
}

/// Restores, on drop, every label this `with_labels` call overrode, to exactly its pre-call
/// value. Built as a guard rather than inline cleanup so a panic unwinding through the callable
/// still restores prior labels before the panic continues.
///
/// Restoration re-`reify`s `async_id` rather than reusing the pointer captured when the labels
/// were applied: `f` may itself have called `propagate`/`with_labels` and shared this set with a
/// child, in which case the entry the map now holds for `async_id` is a fresh copy-on-write fork,
/// not the set the labels were originally applied to. Restoring through the stale pointer would
/// mutate whatever the map entry forked *from* — stripping this scope's labels out of every task
/// that came to share it — instead of the entry `async_id` now actually owns.
struct RestoreGuard {
    async_id: u64,
    applied: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if self.applied.is_empty() {
            return;
        }
        let ls_ptr = match reify(self.async_id, 0) {
            Ok(ptr) => ptr,
            Err(e) => {
                log::error!(
                    "with_labels: failed to re-materialize the label set for {} to restore prior \
                     values: {e}",
                    self.async_id
                );
                return;
            }
        };
        let ls = unsafe { &mut *ls_ptr };
        // Order is unobservable to the reader (first-live-key-wins), so we just drain back to
        // front for locality.
        for (key, prior) in self.applied.drain(..) {
            let result = match prior {
                Some(value) => ls.set(&key, &value).map(|_| ()),
                None => {
                    ls.delete(&key);
                    Ok(())
                }
            };
            if let Err(e) = result {
                log::error!("with_labels: failed to restore a prior label value: {e}");
            }
        }
    }
}

/// Runs `f` with `labels` applied on top of `async_id`'s label set, restoring every overridden
/// value once `f` returns or panics.
///
/// Bounds on label count/size are a foreign-boundary policy (see [`crate::ffi`]), not enforced
/// here; this entry point accepts whatever the caller constructed.
pub fn with_labels<F, R>(async_id: u64, labels: &[(Vec<u8>, Vec<u8>)], f: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    let ls_ptr = reify(async_id, labels.len())?;

    let mut guard = RestoreGuard {
        async_id,
        applied: Vec::with_capacity(labels.len()),
    };

    for (key, value) in labels {
        let ls = unsafe { &mut *ls_ptr };
        match ls.set(key, value) {
            Ok(prior) => guard.applied.push((key.clone(), prior)),
            // `guard` drops here, unwinding every label applied before this one failed.
            Err(e) => return Err(e),
        }
    }

    let result = panic::catch_unwind(AssertUnwindSafe(f));
    // Restore before the panic (if any) is allowed to continue propagating.
    drop(guard);

    match result {
        Ok(value) => Ok(value),
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    fn reset() {
        ASYNC_MAP.with(|cell| *cell.borrow_mut() = None);
    }

    #[test]
    fn basic_install_and_restore() {
        reset();
        let labels = vec![kv("env", "prod")];
        let seen = with_labels(1, &labels, || {
            let ls = unsafe { &*reify(1, 0).unwrap() };
            ls.get(b"env").unwrap().value.as_slice().to_vec()
        })
        .unwrap();
        assert_eq!(seen, b"prod");

        let ls = unsafe { &*reify(1, 0).unwrap() };
        assert!(ls.get(b"env").is_none());
        destroy(1).unwrap();
    }

    #[test]
    fn override_and_restore() {
        reset();
        let ls_ptr = reify(1, 0).unwrap();
        unsafe { (*ls_ptr).set(b"k", b"a").unwrap() };

        let labels = vec![kv("k", "b")];
        let seen = with_labels(1, &labels, || {
            let ls = unsafe { &*reify(1, 0).unwrap() };
            ls.get(b"k").unwrap().value.as_slice().to_vec()
        })
        .unwrap();
        assert_eq!(seen, b"b");

        let ls = unsafe { &*reify(1, 0).unwrap() };
        assert_eq!(ls.get(b"k").unwrap().value.as_slice(), b"a");
        destroy(1).unwrap();
    }

    #[test]
    fn propagation_shares_and_with_labels_forks() {
        reset();
        let parent_labels = vec![kv("tenant", "acme")];
        with_labels(1, &parent_labels, || {
            propagate(1, 2).unwrap();
            let child_labels = vec![kv("job", "x")];
            with_labels(2, &child_labels, || {
                let ls = unsafe { &*reify(2, 0).unwrap() };
                assert_eq!(ls.get(b"tenant").unwrap().value.as_slice(), b"acme");
                assert_eq!(ls.get(b"job").unwrap().value.as_slice(), b"x");
            })
            .unwrap();

            let parent_ls = unsafe { &*reify(1, 0).unwrap() };
            assert!(parent_ls.get(b"job").is_none());
            assert_eq!(parent_ls.get(b"tenant").unwrap().value.as_slice(), b"acme");
        })
        .unwrap();

        destroy(2).unwrap();
        destroy(1).unwrap();
    }

    #[test]
    fn propagate_without_parent_entry_is_a_no_op() {
        reset();
        propagate(100, 200).unwrap();
        assert!(with_map(|map| Ok(map.get(200))).unwrap().is_none());
    }

    #[test]
    fn propagate_reports_child_already_existed() {
        reset();
        let labels = vec![kv("k", "v")];
        with_labels(1, &labels, || {}).unwrap();
        with_labels(2, &vec![kv("other", "v")], || {}).unwrap();

        match propagate(1, 2) {
            Err(CustomLabelsError::ChildAlreadyExisted) => {}
            other => panic!("expected ChildAlreadyExisted, got {other:?}"),
        }

        let ls = unsafe { &*reify(2, 0).unwrap() };
        assert_eq!(ls.get(b"k").unwrap().value.as_slice(), b"v");
        assert!(ls.get(b"other").is_none());

        destroy(1).unwrap();
        destroy(2).unwrap();
    }

    #[test]
    fn restoration_survives_a_panic_in_the_callback() {
        reset();
        let labels = vec![kv("k", "b")];
        let ls_ptr = reify(1, 0).unwrap();
        unsafe { (*ls_ptr).set(b"k", b"a").unwrap() };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            with_labels(1, &labels, || panic!("boom")).unwrap();
        }));
        assert!(result.is_err());

        let ls = unsafe { &*reify(1, 0).unwrap() };
        assert_eq!(ls.get(b"k").unwrap().value.as_slice(), b"a");
        destroy(1).unwrap();
    }

    #[test]
    fn recursive_with_labels_on_the_same_id() {
        reset();
        let outer = vec![kv("outer", "1")];
        let inner = vec![kv("inner", "2")];
        with_labels(1, &outer, || {
            with_labels(1, &inner, || {
                let ls = unsafe { &*reify(1, 0).unwrap() };
                assert_eq!(ls.get(b"outer").unwrap().value.as_slice(), b"1");
                assert_eq!(ls.get(b"inner").unwrap().value.as_slice(), b"2");
            })
            .unwrap();
            let ls = unsafe { &*reify(1, 0).unwrap() };
            assert!(ls.get(b"inner").is_none());
            assert_eq!(ls.get(b"outer").unwrap().value.as_slice(), b"1");
        })
        .unwrap();
        destroy(1).unwrap();
    }
}
