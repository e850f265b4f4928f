//! Thread integration: the per-thread map slot, and spawning threads that
//! inherit bindings.
//!
//! Every thread owns at most one map, attached to it through a thread-local
//! slot. The map is created lazily by the first write on the thread and is
//! dropped, together with every value it still holds, when the thread exits.
//!
//! [`spawn`] and [`Builder`] mirror their `std::thread` counterparts, adding
//! one step: bindings held by the parent under [`InheritableHandle`]s are
//! snapshotted (through each handle's child hook, on the parent thread) and
//! installed in the child before its closure runs. [`InheritedBindings`]
//! exposes the same two steps for code that spawns threads by other means.
//!
//! [`InheritableHandle`]: crate::InheritableHandle

use std::cell::RefCell;
use std::io;
use std::thread::JoinHandle;

use crate::thread_map::{InheritedSeed, ThreadMap};

thread_local! {
    static ACTIVE: RefCell<Option<ThreadMap>> = const { RefCell::new(None) };
}

/// Borrow the calling thread's map slot.
///
/// The borrow is exclusive for the duration of `f`; slot operations must not
/// nest.
pub(crate) fn with_active<R>(f: impl FnOnce(&mut Option<ThreadMap>) -> R) -> R {
    ACTIVE.with(|cell| f(&mut cell.borrow_mut()))
}

/// A snapshot of the calling thread's inheritable bindings, ready to carry
/// into another thread.
///
/// [`spawn`] and [`Builder::spawn`] use this internally; it is public for
/// integrating with thread pools or other spawning mechanisms:
///
/// ```
/// use thread_slot::thread::InheritedBindings;
/// use thread_slot::InheritableHandle;
///
/// let slot = InheritableHandle::with_child(|n| n + 1);
/// slot.set(1);
///
/// let bindings = InheritedBindings::capture();
/// std::thread::spawn(move || {
///     bindings.install();
///     assert_eq!(slot.get(), Some(2));
/// })
/// .join()
/// .unwrap();
/// ```
pub struct InheritedBindings {
    seed: Option<InheritedSeed>,
}

impl InheritedBindings {
    /// Capture the parent-side snapshot: every live binding whose handle
    /// defines a child value, transformed by that hook here and now. The
    /// snapshot holds strong references to the seeded handles, so none of
    /// them can go stale before [`install`](Self::install) runs.
    pub fn capture() -> Self {
        let seed = with_active(|slot| slot.as_ref().and_then(ThreadMap::snapshot_children));
        Self { seed }
    }

    /// True when the capturing thread had nothing to pass on.
    pub fn is_empty(&self) -> bool {
        self.seed.is_none()
    }

    /// Attach the snapshot to the calling thread, intended to run before any
    /// other use of the thread's slots. If the thread already has bindings,
    /// the snapshot falls back to inserting each binding individually.
    pub fn install(self) {
        let Some(seed) = self.seed else { return };
        with_active(|slot| match slot {
            None => *slot = Some(ThreadMap::from_seed(seed)),
            Some(map) => {
                for (core, value) in seed.entries {
                    map.set(&core, value);
                }
            }
        });
    }
}

impl std::fmt::Debug for InheritedBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InheritedBindings")
            .field(
                "bindings",
                &self.seed.as_ref().map_or(0, |s| s.entries.len()),
            )
            .finish()
    }
}

/// Spawn a thread that inherits the calling thread's inheritable bindings.
/// Otherwise identical to `std::thread::spawn`.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inherited = InheritedBindings::capture();
    std::thread::spawn(move || {
        inherited.install();
        f()
    })
}

/// Thread factory mirroring `std::thread::Builder`, spawning threads that
/// inherit the parent's inheritable bindings.
#[derive(Debug)]
pub struct Builder {
    inner: std::thread::Builder,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            inner: std::thread::Builder::new(),
        }
    }

    /// Name the spawned thread.
    pub fn name(self, name: String) -> Self {
        Self {
            inner: self.inner.name(name),
        }
    }

    /// Set the spawned thread's stack size, in bytes.
    pub fn stack_size(self, size: usize) -> Self {
        Self {
            inner: self.inner.stack_size(size),
        }
    }

    /// Spawn like `std::thread::Builder::spawn`, installing the parent's
    /// inheritable bindings before the closure runs.
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let inherited = InheritedBindings::capture();
        self.inner.spawn(move || {
            inherited.install();
            f()
        })
    }
}
