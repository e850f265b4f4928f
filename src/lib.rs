//! thread-slot: per-thread value slots keyed by weakly-held shared handles.
//!
//! A [`Handle<T>`] addresses one logical variable with a private copy per
//! thread: reads and writes through the handle only ever touch the calling
//! thread's binding, and each thread's first read can be initialized
//! independently by the handle's producer. [`InheritableHandle<T>`]
//! additionally lets bindings flow to threads spawned through
//! [`thread::spawn`], transformed by a per-handle child hook.
//!
//! ```
//! use thread_slot::Handle;
//!
//! let request_depth = Handle::with_initial(|| 0u32);
//! request_depth.set(3);
//! assert_eq!(request_depth.get(), Some(3));
//!
//! let elsewhere = request_depth.clone();
//! std::thread::spawn(move || {
//!     // A fresh thread sees a fresh, independently initialized binding.
//!     assert_eq!(elsewhere.get(), Some(0));
//! })
//! .join()
//! .unwrap();
//! ```
//!
//! Internally each thread owns a single open-addressed table mapping handle
//! identities to values. The table references its keys weakly: dropping the
//! last clone of a handle makes its bindings stale everywhere, and stale
//! slots are reclaimed piggybacked on ordinary operations. There is no
//! background sweeper and no cross-thread coordination of any kind.

mod handle;
pub mod thread;
mod thread_map;
mod weak_key;

pub use handle::{Handle, InheritableHandle};

#[cfg(test)]
mod thread_map_proptest;
