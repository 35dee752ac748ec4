//! Swaps in `loom`'s scheduler-aware `thread`/`sync::atomic` when interleaving-checking tests are
//! built with `--cfg loom`, and plain `std` otherwise. Only `abi::barrier` and the loom test
//! harness (`tests/loom.rs`) reach through this module; everything else in the crate talks to
//! thread-locals and raw pointers directly, since those aren't loom-trackable regardless.

#[cfg(loom)]
pub use loom::*;

#[cfg(not(loom))]
pub use std::{hint, sync, thread};
