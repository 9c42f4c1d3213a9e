//! # Flag Caches
//!
//! * [`TtlCache`] - in-memory, fixed time-to-live, lazily evicted
//! * [`DurableStore`] - pluggable persistence collaborator
//!
//! Both are driven by [`ChangeEvent`](crate::ChangeEvent)s: a keyed event
//! drops one entry, a bulk event drops everything.

mod durable;
mod memory;

pub use durable::{DurableStore, MemoryStore, NoopStore};
pub use memory::TtlCache;
