use std::{fmt, ops::Deref, sync::Arc};

use super::{MemoryStore, RemoteStore};

/// A cheap, clonable reference to the remote store, threaded through every tensor.
#[derive(Clone)]
pub struct StoreHandle(Arc<dyn RemoteStore>);

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreHandle")
    }
}

impl Deref for StoreHandle {
    type Target = dyn RemoteStore;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl StoreHandle {
    /// Creates a new `StoreHandle`.
    ///
    /// # Arguments
    /// * `store` - The client of the authoritative store.
    ///
    /// # Returns
    /// A new `StoreHandle` instance.
    pub fn new<S: RemoteStore + 'static>(store: S) -> Self {
        Self(Arc::new(store))
    }

    /// Creates a new `StoreHandle` over a store the caller keeps a reference to.
    pub fn shared<S: RemoteStore + 'static>(store: Arc<S>) -> Self {
        Self(store)
    }

    /// A handle to a fresh in-process store.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::default())
    }
}
