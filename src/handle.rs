//! Handles: identity-keyed accessors for per-thread value slots.
//!
//! A handle carries no per-thread state of its own, only a process-unique
//! identifier, an optional initial-value producer, and (for
//! [`InheritableHandle`]) a child-value hook. Every operation fetches the
//! calling thread's map and works on the binding keyed by the handle's
//! identifier; the map holds the handle weakly, so dropping the last clone of
//! a handle releases its bindings in every thread that ever touched it.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::thread::with_active;
use crate::thread_map::ThreadMap;
use crate::weak_key::CoreRef;

/// The closest odd integer to `2^32 / phi`. Dispensing identifiers in steps
/// of this constant spreads their low bits near-uniformly, so `id & (len - 1)`
/// needs no secondary mixing.
pub(crate) const HASH_INCREMENT: u32 = 0x61C8_8647;

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

fn next_handle_id() -> u32 {
    NEXT_ID.fetch_add(HASH_INCREMENT, Ordering::Relaxed)
}

/// Reported through the type-erased layer when a handle without a child hook
/// is asked for a child value. The seeding pipeline reads it as "do not seed
/// this binding into the child thread".
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InheritError {
    NotSupported,
}

/// Type-erased handle identity, as stored (weakly) by the per-thread table.
pub(crate) trait HandleCore: Send + Sync + 'static {
    fn id(&self) -> u32;

    /// Compute the value a child thread inherits from `parent`.
    fn child_value(&self, parent: &dyn Any) -> Result<Box<dyn Any + Send>, InheritError>;
}

type InitFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type ChildFn<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

fn downcast<T: 'static>(value: &dyn Any) -> &T {
    value
        .downcast_ref::<T>()
        .expect("slot value must match the handle's value type")
}

/// Read the binding for `core`, initializing it from `initial` on a miss.
///
/// The producer runs with no table borrow held, so a producer that touches
/// other slots (or this one) is safe; the freshly produced value is stored
/// afterwards, overwriting anything the producer may have bound. `f` runs
/// under the table borrow on a hit and must not re-enter slot operations.
fn with_value<T: 'static, R>(
    core: &CoreRef,
    initial: Option<&(dyn Fn() -> T + Send + Sync)>,
    f: impl FnOnce(&T) -> R,
) -> Option<R> {
    enum Step<F, R> {
        Hit(R),
        Miss(F),
    }
    let step = with_active(|slot| match slot.as_mut().and_then(|map| map.get(core)) {
        Some(value) => Step::Hit(f(downcast(value))),
        None => Step::Miss(f),
    });
    match step {
        Step::Hit(out) => Some(out),
        Step::Miss(f) => {
            let producer = initial?;
            let value = producer();
            let out = f(&value);
            set_value(core, Box::new(value));
            Some(out)
        }
    }
}

fn set_value(core: &CoreRef, value: Box<dyn Any>) {
    with_active(|slot| match slot {
        Some(map) => map.set(core, value),
        // First write in this thread: the map is created on demand, seeded
        // with this binding.
        None => *slot = Some(ThreadMap::new(core, value)),
    })
}

fn remove_value(core: &CoreRef) {
    with_active(|slot| {
        if let Some(map) = slot {
            map.remove(core);
        }
    })
}

struct Shared<T> {
    id: u32,
    initial: Option<InitFn<T>>,
}

impl<T: 'static> HandleCore for Shared<T> {
    fn id(&self) -> u32 {
        self.id
    }

    fn child_value(&self, _parent: &dyn Any) -> Result<Box<dyn Any + Send>, InheritError> {
        Err(InheritError::NotSupported)
    }
}

/// A per-thread value slot.
///
/// Each thread that touches the handle gets its own private binding,
/// initialized independently of every other thread's. Clones share identity:
/// they address the same slot. The handle is `Send + Sync` for any `T`: only
/// values stay thread-private, the handle itself is meant to be shared.
///
/// ```
/// use thread_slot::Handle;
///
/// let slot = Handle::with_initial(|| 21u32);
/// assert_eq!(slot.get(), Some(21));
/// slot.set(42);
/// assert_eq!(slot.get(), Some(42));
/// slot.remove();
/// assert_eq!(slot.get(), Some(21));
/// ```
pub struct Handle<T: 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> Handle<T> {
    /// A handle with no initial-value producer: reads yield `None` until the
    /// calling thread binds a value with [`set`](Self::set).
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: next_handle_id(),
                initial: None,
            }),
        }
    }

    /// A handle whose first read on each thread binds `producer()`.
    ///
    /// The producer runs at most once per thread per continuous binding: a
    /// [`remove`](Self::remove) followed by a read re-invokes it, while a
    /// [`set`](Self::set) before the first read suppresses it. It may be
    /// called from any thread that uses the handle, hence `Send + Sync`.
    pub fn with_initial<F>(producer: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                id: next_handle_id(),
                initial: Some(Box::new(producer)),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_raw_id(id: u32) -> Self {
        Self {
            shared: Arc::new(Shared { id, initial: None }),
        }
    }

    #[cfg(test)]
    pub(crate) fn erased(&self) -> CoreRef {
        self.core()
    }

    fn core(&self) -> CoreRef {
        self.shared.clone()
    }

    /// Run `f` against this thread's value, initializing the binding first if
    /// the handle has a producer. Returns `None` when there is no binding and
    /// nothing to initialize it from.
    ///
    /// `f` must not itself operate on per-thread slots; doing so panics.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        with_value(&self.core(), self.shared.initial.as_deref(), f)
    }

    /// Clone this thread's value out of the slot. Equivalent to
    /// `self.with(T::clone)`.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Bind `value` for the calling thread, creating the thread's map on its
    /// first use.
    pub fn set(&self, value: T) {
        set_value(&self.core(), Box::new(value));
    }

    /// Drop the calling thread's binding. A no-op when none exists; a later
    /// read will re-run the producer, if any.
    pub fn remove(&self) {
        remove_value(&self.core());
    }
}

impl<T: 'static> Default for Handle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.shared.id).finish()
    }
}

impl<T: 'static> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl<T: 'static> Eq for Handle<T> {}

impl<T: 'static> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

struct InheritableShared<T> {
    id: u32,
    initial: Option<InitFn<T>>,
    child: ChildFn<T>,
}

impl<T: Send + 'static> HandleCore for InheritableShared<T> {
    fn id(&self) -> u32 {
        self.id
    }

    fn child_value(&self, parent: &dyn Any) -> Result<Box<dyn Any + Send>, InheritError> {
        Ok(Box::new((self.child)(downcast::<T>(parent))))
    }
}

/// A per-thread value slot whose bindings flow to child threads.
///
/// When a thread is spawned through [`crate::thread::spawn`] (or bindings are
/// moved by hand with [`crate::thread::InheritedBindings`]), each binding held
/// by the parent under an inheritable handle is passed through the handle's
/// child hook and installed in the child before it runs. Plain [`Handle`]
/// bindings never cross threads.
///
/// The hook runs on the parent thread, at spawn time; later writes in the
/// parent are not reflected in the child.
pub struct InheritableHandle<T: Send + 'static> {
    shared: Arc<InheritableShared<T>>,
}

impl<T: Send + 'static> InheritableHandle<T> {
    /// An inheritable handle with no producer; child threads inherit a clone
    /// of the parent's value.
    pub fn new() -> Self
    where
        T: Clone,
    {
        Self::build(None, Box::new(T::clone))
    }

    /// Like [`Handle::with_initial`], inheriting by clone.
    pub fn with_initial<F>(producer: F) -> Self
    where
        T: Clone,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(producer)), Box::new(T::clone))
    }

    /// An inheritable handle deriving the child's value from the parent's
    /// with `child`.
    pub fn with_child<C>(child: C) -> Self
    where
        C: Fn(&T) -> T + Send + Sync + 'static,
    {
        Self::build(None, Box::new(child))
    }

    /// Full control over both hooks.
    pub fn with_initial_and_child<F, C>(producer: F, child: C) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        C: Fn(&T) -> T + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(producer)), Box::new(child))
    }

    fn build(initial: Option<InitFn<T>>, child: ChildFn<T>) -> Self {
        Self {
            shared: Arc::new(InheritableShared {
                id: next_handle_id(),
                initial,
                child,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn erased(&self) -> CoreRef {
        self.core()
    }

    fn core(&self) -> CoreRef {
        self.shared.clone()
    }

    /// Apply the child hook directly.
    pub fn make_child_value(&self, parent: &T) -> T {
        (self.shared.child)(parent)
    }

    /// See [`Handle::with`].
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        with_value(&self.core(), self.shared.initial.as_deref(), f)
    }

    /// See [`Handle::get`].
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// See [`Handle::set`].
    pub fn set(&self, value: T) {
        set_value(&self.core(), Box::new(value));
    }

    /// See [`Handle::remove`].
    pub fn remove(&self) {
        remove_value(&self.core());
    }
}

impl<T: Send + Clone + 'static> Default for InheritableHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Clone for InheritableHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for InheritableHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InheritableHandle")
            .field("id", &self.shared.id)
            .finish()
    }
}

impl<T: Send + 'static> PartialEq for InheritableHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl<T: Send + 'static> Eq for InheritableHandle<T> {}

impl<T: Send + 'static> Hash for InheritableHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Invariant: handles never share an identifier, whatever their flavor
    /// or value type.
    #[test]
    fn identifiers_are_unique() {
        let ids = [
            Handle::<u8>::new().shared.id,
            Handle::<String>::new().shared.id,
            InheritableHandle::<u8>::new().shared.id,
            Handle::<u8>::with_initial(|| 0).shared.id,
        ];
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    /// The identifier sequence covers every home slot before repeating one:
    /// the increment is odd, so consecutive identifiers cycle through all
    /// residues of any power-of-two table length.
    #[test]
    fn identifier_sequence_disperses_over_home_slots() {
        let mut seen = std::collections::HashSet::new();
        let mut id = 0u32;
        for _ in 0..16 {
            seen.insert(id & 15);
            id = id.wrapping_add(HASH_INCREMENT);
        }
        assert_eq!(seen.len(), 16);
    }

    /// Invariant: clones alias the same slot; distinct handles never do.
    #[test]
    fn equality_follows_identity() {
        let a = Handle::<String>::new();
        let b = a.clone();
        let c = Handle::<String>::new();
        assert_eq!(a, b);
        assert_ne!(a, c);

        use std::collections::hash_map::DefaultHasher;
        let mut ha = DefaultHasher::new();
        a.hash(&mut ha);
        let mut hb = DefaultHasher::new();
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    /// A plain handle refuses to produce child values at the erased layer;
    /// an inheritable one applies its hook.
    #[test]
    fn child_values_gated_by_handle_flavor() {
        let plain = Handle::<i32>::new();
        let result = plain.erased().child_value(&5i32);
        assert_eq!(result.unwrap_err(), InheritError::NotSupported);

        let inheritable = InheritableHandle::<i32>::with_child(|v| v * 2);
        let child = inheritable
            .erased()
            .child_value(&5i32)
            .expect("hooked handle yields a child value");
        assert_eq!(child.downcast_ref::<i32>(), Some(&10));
        assert_eq!(inheritable.make_child_value(&8), 16);
    }

    /// Debug output names the slot identity without leaking the value type's
    /// contents.
    #[test]
    fn debug_formats_identity() {
        let h = Handle::<Vec<u8>>::with_raw_id(3);
        assert_eq!(format!("{:?}", h), "Handle { id: 3 }");
    }
}
