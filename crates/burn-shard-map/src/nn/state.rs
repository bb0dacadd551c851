use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;

use crate::Error;
use crate::tree::{FromTree, Tree};

static NEXT_INDEX: AtomicU64 = AtomicU64::new(0);

/// Typed key of a [`State`] entry, carrying the entry's initial value.
///
/// Every index created is distinct, clones included share the key.
pub struct StateIndex<T> {
    id: u64,
    init: T,
    _value: PhantomData<fn() -> T>,
}

impl<T> StateIndex<T> {
    /// A fresh key whose entry starts out as `init`.
    pub fn new(init: T) -> Self {
        Self {
            id: NEXT_INDEX.fetch_add(1, Ordering::Relaxed),
            init,
            _value: PhantomData,
        }
    }

    /// Process-unique id of this index.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The value a fresh [`State`] holds for this index.
    pub fn init(&self) -> &T {
        &self.init
    }
}

impl<T: Clone> Clone for StateIndex<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            init: self.init.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for StateIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        write!(f, "StateIndex<{name}>({})", self.id)
    }
}

impl<T> PartialEq for StateIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Persistent store of layer state such as running statistics.
///
/// A `State` is never modified in place: [`set`](State::set) returns a new handle and leaves
/// the old one untouched. Callers thread the latest handle from one call to the next.
#[derive(Clone, Default)]
pub struct State {
    slots: Arc<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

impl State {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// This state with `index` holding its initial value.
    pub fn with_index<T>(self, index: &StateIndex<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.set(index, index.init().clone())
    }

    /// Reads the entry of `index`.
    pub fn get<T>(&self, index: &StateIndex<T>) -> Result<T, Error>
    where
        T: Clone + 'static,
    {
        let slot = self
            .slots
            .get(&index.id())
            .ok_or(Error::MissingStateEntry { index: index.id() })?;
        slot.downcast_ref::<T>()
            .cloned()
            .ok_or(Error::StateTypeMismatch {
                index: index.id(),
                expected: core::any::type_name::<T>(),
            })
    }

    /// A new state in which `index` holds `value`.
    #[must_use]
    pub fn set<T>(&self, index: &StateIndex<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        let mut slots = HashMap::clone(&self.slots);
        slots.insert(index.id(), Arc::new(value));
        Self {
            slots: Arc::new(slots),
        }
    }

    /// Whether `index` has an entry.
    pub fn contains<T>(&self, index: &StateIndex<T>) -> bool {
        self.slots.contains_key(&index.id())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the handle has no entries.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.slots.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("State").field("entries", &ids).finish()
    }
}

impl From<State> for Tree {
    fn from(state: State) -> Self {
        Tree::opaque(state)
    }
}

impl FromTree for State {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        tree.opaque_value::<State>()
    }
}
