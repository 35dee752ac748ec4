//! The thread-local slot the external reader treats as the root of its sample: the pointer to
//! this thread's currently installed [`LabelSet`].

use std::cell::Cell;
use std::ptr;

use crate::abi::barrier;
use crate::labelset::LabelSet;

thread_local! {
    static CURRENT_SET: Cell<*mut LabelSet> = const { Cell::new(ptr::null_mut()) };
}

/// Installs `new` as this thread's current label set and returns the label set that was
/// previously installed (null if none).
///
/// Ownership of the returned pointer transfers to the caller: it is the caller's
/// responsibility to either reinstall it later or free it once it is no longer the current set.
///
/// # Safety
///
/// `new` must either be null or a valid, exclusively-owned `LabelSet` that the caller will not
/// mutate through any other path while it remains installed.
pub unsafe fn replace(new: *mut LabelSet) -> *mut LabelSet {
    CURRENT_SET.with(|cell| {
        // Whatever the caller did to prepare `new` must be visible before we publish it.
        barrier();
        let old = cell.replace(new);
        // The new set must be installed before the caller does anything that assumes the old
        // one is no longer being read by this thread.
        barrier();
        old
    })
}

/// Returns this thread's currently installed label set, or null if none is installed.
pub fn current() -> *mut LabelSet {
    CURRENT_SET.with(Cell::get)
}

/// True if `ls` is this thread's currently installed label set.
///
/// Every mutation on a [`LabelSet`] consults this to decide whether it must use the careful,
/// barrier-protected protocol: a label set that is not current has no asynchronous reader to
/// protect against, so its mutations may use the simpler, faster path.
pub(crate) fn is_current(ls: *const LabelSet) -> bool {
    CURRENT_SET.with(|cell| cell.get() as *const LabelSet == ls)
}

/// Returns the address of this thread's current-set slot.
///
/// This is the one-time registration hook the embedding layer calls, from the monitored
/// thread, to learn where the reader should look. The reader polls the returned address
/// directly with ordinary loads from then on; it never calls back into this function or any
/// other code in this process.
///
/// The address is stable for the remaining lifetime of the calling thread: `thread_local!`
/// storage does not move once a thread has accessed it.
pub fn current_set_addr() -> *const *mut LabelSet {
    CURRENT_SET.with(|cell| cell.as_ptr() as *const *mut LabelSet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labelset::LabelSet;

    #[test]
    fn replace_returns_previous_and_updates_current() {
        let mut a = LabelSet::new(0);
        let mut b = LabelSet::new(0);

        unsafe {
            let old = replace(&mut a);
            assert!(old.is_null());
            assert!(is_current(&a));

            let old = replace(&mut b);
            assert_eq!(old, &mut a as *mut LabelSet);
            assert!(is_current(&b));

            replace(ptr::null_mut());
            assert!(current().is_null());
        }
    }

    #[test]
    fn addr_is_stable_across_calls() {
        let a1 = current_set_addr();
        let a2 = current_set_addr();
        assert_eq!(a1, a2);
    }
}
