#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
#![deny(rust_2018_idioms, unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
//! Thread-local custom labels for out-of-process sampling profilers.
//!
//! A running program attaches key/value string labels to the current thread so that stack
//! samples captured by an external profiler can be tagged with business-level context (request
//! id, tenant, job name). The profiler reads this thread's memory asynchronously — at any
//! instruction boundary, using only ordinary loads, with no locks and no cooperation from this
//! crate. Every mutation in [`labelset`] and [`hashmap`] is written against that reader contract.
//!
//! # Layout
//!
//! - [`abi`] — the `#[repr(C)]` wire types ([`abi::ByteString`], [`abi::Label`]) and the
//!   [`abi::barrier`] primitive every mutation protocol below is built from.
//! - [`labelset`] — [`labelset::LabelSet`], the signal-safe label vector.
//! - [`current`] — the thread-local slot naming which `LabelSet` the reader should sample.
//! - [`refcount`] — [`refcount::RefCountedSet`], copy-on-write sharing of a label set between an
//!   async task and its children.
//! - [`hashmap`] — [`hashmap::AsyncMap`], the per-thread async-id → label-set table.
//! - [`scope`] — [`scope::propagate`], [`scope::destroy`], and [`scope::with_labels`], the
//!   operations the host runtime's async-hook binding calls into.
//! - [`ffi`] — the `extern "C"` boundary consumed by the foreign-language binding.
//! - [`error`] — [`error::CustomLabelsError`], the crate's error taxonomy.
//!
//! # Concurrency model
//!
//! Everything in this crate is thread-owned: a `LabelSet`, the `AsyncMap`, and every
//! `RefCountedSet` reachable from them belong to exactly one thread and are mutated only by it.
//! The only other party that ever looks at this memory is the out-of-process reader, which never
//! writes. There is no cross-thread sharing anywhere in this crate; a host runtime that wants
//! labels to follow work across threads must propagate them itself at the FFI boundary.

pub mod abi;
pub mod current;
pub mod error;
pub mod ffi;
pub mod hashmap;
pub mod labelset;
pub mod refcount;
pub mod scope;
mod util;

pub use error::{CustomLabelsError, Result};
pub use labelset::LabelSet;
