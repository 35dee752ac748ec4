#![allow(dead_code)]

#[cfg(loom)]
pub use loom::*;
#[cfg(not(loom))]
pub use std::{sync, thread};

pub fn maybe_loom_model<F>(test: F)
where
    F: Fn() + Send + Sync + 'static,
{
    #[cfg(loom)]
    loom::model(test);
    #[cfg(not(loom))]
    test();
}

/// Smuggles a raw pointer across a `thread::spawn` boundary.
///
/// Standing in for the real out-of-process reader, which has no `Send`/borrow-checker
/// relationship to the writer's memory at all — it just knows an address.
pub struct SendPtr<T>(pub *mut T);

unsafe impl<T> Send for SendPtr<T> {}

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        SendPtr(self.0)
    }
}

impl<T> Copy for SendPtr<T> {}
