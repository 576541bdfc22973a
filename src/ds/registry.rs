// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use super::{DatasetKind, DatasetName, DatasetStats, Engine, Error, MetadataCache, check_kind};

/// Owns every open dataset handle in the process.
///
/// Handles are reference counted: each successful [`Registry::open`] must be
/// paired with a [`Registry::close`] (or a drop of the returned
/// [`HandleRef`]). The last close evicts the handle and its cached stats.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    cache: Arc<MetadataCache>,
    handles: Mutex<HashMap<DatasetName, Slot>>,
}

struct Slot {
    handle: Arc<DatasetHandle>,
    refs: usize,
}

/// One dataset known to the engine.
pub struct DatasetHandle {
    name: DatasetName,
    kind: DatasetKind,
    head_kind: DatasetKind,
    stats: RwLock<Option<Arc<DatasetStats>>>,
    state: Mutex<HandleState>,
}

// Mutable per-handle state. Each handle has its own lock, so work on one
// dataset never waits on another.
struct HandleState {
    mount_options: Option<String>,
    property_table: Vec<u8>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that shares an existing stats cache.
    pub fn with_cache(cache: Arc<MetadataCache>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                cache,
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.inner.cache
    }

    /// Open `name`, creating its handle through `engine` if it is not open
    /// already.
    pub fn open<E: Engine + ?Sized>(
        &self,
        engine: &E,
        name: &DatasetName,
    ) -> Result<HandleRef, Error> {
        if let Some(handle) = self.inner.acquire(name) {
            return Ok(self.handle_ref(handle));
        }

        // Build the handle without holding the registry lock, so that opening
        // one dataset never stalls opens of others.
        let dataset = engine
            .make_handle(name)
            .map_err(|err| err.for_dataset(name))?;
        check_kind(name, dataset.kind, &dataset.stats)?;

        let stats = self.inner.cache.prime(name, dataset.stats);
        let handle = Arc::new(DatasetHandle {
            name: name.clone(),
            kind: dataset.kind,
            head_kind: dataset.head_kind,
            stats: RwLock::new(Some(stats)),
            state: Mutex::new(HandleState {
                mount_options: None,
                property_table: dataset.property_table,
            }),
        });

        let handle = {
            let mut handles = self.inner.handles();
            match handles.entry(name.clone()) {
                MapEntry::Occupied(mut occupied) => {
                    // Another thread opened the same name while we were
                    // talking to the engine; theirs wins.
                    tracing::debug!(dataset = name.as_str(), "discarding duplicate handle");
                    let slot = occupied.get_mut();
                    slot.refs += 1;
                    Arc::clone(&slot.handle)
                }
                MapEntry::Vacant(vacant) => {
                    tracing::debug!(dataset = name.as_str(), kind = %handle.kind, "opened handle");
                    vacant.insert(Slot {
                        handle: Arc::clone(&handle),
                        refs: 1,
                    });
                    handle
                }
            }
        };
        Ok(self.handle_ref(handle))
    }

    /// Release `handle`, returning the number of references that remain.
    pub fn close(&self, mut handle: HandleRef) -> usize {
        handle.release()
    }

    /// Current reference count for `name`, zero if it is not open.
    pub fn refcount(&self, name: &DatasetName) -> usize {
        self.inner
            .handles()
            .get(name)
            .map_or(0, |slot| slot.refs)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.inner.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle_ref(&self, handle: Arc<DatasetHandle>) -> HandleRef {
        HandleRef {
            handle,
            registry: Arc::downgrade(&self.inner),
            released: false,
        }
    }
}

impl RegistryInner {
    fn handles(&self) -> MutexGuard<'_, HashMap<DatasetName, Slot>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, name: &DatasetName) -> Option<Arc<DatasetHandle>> {
        let mut handles = self.handles();
        let slot = handles.get_mut(name)?;
        slot.refs += 1;
        tracing::debug!(dataset = name.as_str(), refs = slot.refs, "reused handle");
        Some(Arc::clone(&slot.handle))
    }

    fn release(&self, name: &DatasetName) -> usize {
        let mut handles = self.handles();
        let remaining = match handles.get_mut(name) {
            Some(slot) => {
                slot.refs -= 1;
                slot.refs
            }
            None => return 0,
        };
        if remaining == 0 {
            handles.remove(name);
            self.cache.remove(name);
            tracing::debug!(dataset = name.as_str(), "evicted handle");
        }
        remaining
    }
}

/// A counted reference to an open dataset handle.
///
/// Dropping it releases the reference, exactly like passing it to
/// [`Registry::close`].
pub struct HandleRef {
    handle: Arc<DatasetHandle>,
    registry: Weak<RegistryInner>,
    released: bool,
}

impl HandleRef {
    pub fn name(&self) -> &DatasetName {
        &self.handle.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.handle.kind
    }

    /// The kind ignoring snapshot-ness.
    pub fn head_kind(&self) -> DatasetKind {
        self.handle.head_kind
    }

    /// The stats last seen by this handle, without consulting the engine.
    pub fn cached_stats(&self) -> Option<Arc<DatasetStats>> {
        self.handle
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current stats through the registry's cache, fetching them if they are
    /// missing or stale. The handle's copy is replaced wholesale.
    pub fn stats<E: Engine + ?Sized>(&self, engine: &E) -> Result<Arc<DatasetStats>, Error> {
        let stats = match self.registry.upgrade() {
            Some(registry) => registry.cache.get(engine, self.name())?,
            None => Arc::new(engine.fetch_stats(self.name())?),
        };
        self.replace_stats(stats)
    }

    /// Like [`HandleRef::stats`], but give up after `timeout`. See
    /// [`MetadataCache::get_timeout`].
    pub fn stats_timeout<E: Engine + 'static>(
        &self,
        engine: Arc<E>,
        timeout: Duration,
    ) -> Result<Arc<DatasetStats>, Error> {
        let cache = match self.registry.upgrade() {
            Some(registry) => Arc::clone(&registry.cache),
            None => Arc::new(MetadataCache::new()),
        };
        let stats = cache.get_timeout(engine, self.name(), timeout)?;
        self.replace_stats(stats)
    }

    /// Mark this dataset's cached stats stale.
    pub fn invalidate(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.cache.invalidate(self.name());
        }
    }

    /// Mount options recorded on this handle, if any.
    pub fn mount_options(&self) -> Option<String> {
        self.state().mount_options.clone()
    }

    /// Re-read this dataset's mount options from the engine's mount table.
    pub fn refresh_mount_options<E: Engine + ?Sized>(
        &self,
        engine: &E,
    ) -> Result<Option<String>, Error> {
        let mut state = self.state();
        let options = engine.mount_options(self.name())?;
        state.mount_options = options.clone();
        Ok(options)
    }

    /// Record `options` on this handle, copied through the engine allocator.
    pub fn set_mount_options<E: Engine + ?Sized>(
        &self,
        engine: &E,
        options: &str,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.mount_options = Some(engine.duplicate_string(options)?);
        Ok(())
    }

    /// Whether the recorded mount options include exactly `opt`.
    pub fn has_mount_option(&self, opt: &str) -> bool {
        match &self.state().mount_options {
            Some(options) => options.split(',').any(|o| o == opt),
            None => false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.state()
            .mount_options
            .as_ref()
            .is_some_and(|options| !options.is_empty())
    }

    /// A copy of the engine's property blob for this dataset.
    pub fn property_table(&self) -> Vec<u8> {
        self.state().property_table.clone()
    }

    /// Run `f` with exclusive access to the property blob.
    pub fn with_property_table<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Vec<u8>) -> T,
    {
        f(&mut self.state().property_table)
    }

    /// Whether two references point at the same underlying handle.
    pub fn ptr_eq(&self, other: &HandleRef) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    // Check the kind invariant, then swap in `stats` wholesale.
    fn replace_stats(&self, stats: Arc<DatasetStats>) -> Result<Arc<DatasetStats>, Error> {
        check_kind(self.name(), self.kind(), &stats)?;
        *self
            .handle
            .stats
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&stats));
        Ok(stats)
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.handle
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        match self.registry.upgrade() {
            Some(registry) => registry.release(&self.handle.name),
            None => 0,
        }
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRef")
            .field("name", &self.handle.name)
            .field("kind", &self.handle.kind)
            .finish()
    }
}
