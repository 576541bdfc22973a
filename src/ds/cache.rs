// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{DatasetName, DatasetStats, Engine, EngineError, Error};

/// Caches dataset statistics by name.
///
/// At most one fetch per name is in flight at any time. Callers arriving
/// while a fetch is running wait for it and share its result.
#[derive(Default)]
pub struct MetadataCache {
    entries: Mutex<HashMap<DatasetName, Entry>>,
}

enum Entry {
    Ready { stats: Arc<DatasetStats>, stale: bool },
    // A stale pending entry was invalidated while in flight. Its result is
    // not stored, and new callers wait for it before fetching again.
    Pending { flight: Arc<Flight>, stale: bool },
}

type FetchResult = Result<Arc<DatasetStats>, Error>;

/// A fetch in progress. The leader publishes exactly one result.
#[derive(Default)]
struct Flight {
    result: Mutex<Option<FetchResult>>,
    done: Condvar,
}

impl Flight {
    fn publish(&self, result: FetchResult) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
            self.done.notify_all();
        }
    }

    fn wait(&self) -> FetchResult {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Publishes an error to waiters if the leader unwinds before finishing.
struct FlightGuard<'a> {
    cache: &'a MetadataCache,
    name: &'a DatasetName,
    flight: Arc<Flight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.cache.detach(self.name, &self.flight);
            self.flight.publish(Err(EngineError::new(
                libc::EINTR,
                "stats fetch abandoned",
            )
            .into()));
        }
    }
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<DatasetName, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the statistics for `name`, fetching them from `engine` if nothing
    /// fresh is cached.
    pub fn get<E: Engine + ?Sized>(
        &self,
        engine: &E,
        name: &DatasetName,
    ) -> Result<Arc<DatasetStats>, Error> {
        let flight = loop {
            let mut entries = self.entries();
            match entries.get(name) {
                Some(Entry::Ready { stats, stale: false }) => return Ok(Arc::clone(stats)),
                Some(Entry::Pending { flight, stale }) => {
                    let flight = Arc::clone(flight);
                    let stale = *stale;
                    drop(entries);
                    if !stale {
                        tracing::debug!(dataset = name.as_str(), "joining in-flight stats fetch");
                        return flight.wait();
                    }
                    tracing::debug!(
                        dataset = name.as_str(),
                        "waiting for invalidated fetch before refetching"
                    );
                    let _ = flight.wait();
                }
                _ => {
                    let flight = Arc::new(Flight::default());
                    entries.insert(
                        name.clone(),
                        Entry::Pending {
                            flight: Arc::clone(&flight),
                            stale: false,
                        },
                    );
                    break flight;
                }
            }
        };

        let guard = FlightGuard {
            cache: self,
            name,
            flight,
        };

        tracing::debug!(dataset = name.as_str(), "fetching stats");
        let result = engine.fetch_stats(name).map(Arc::new);

        {
            let mut entries = self.entries();
            let ours = match entries.get(name) {
                Some(Entry::Pending { flight, stale }) if Arc::ptr_eq(flight, &guard.flight) => {
                    Some(*stale)
                }
                _ => None,
            };
            match (ours, &result) {
                (Some(false), Ok(stats)) => {
                    entries.insert(
                        name.clone(),
                        Entry::Ready {
                            stats: Arc::clone(stats),
                            stale: false,
                        },
                    );
                }
                (Some(false), Err(_)) => {
                    entries.remove(name);
                }
                (Some(true), _) => {
                    entries.remove(name);
                    tracing::debug!(
                        dataset = name.as_str(),
                        "fetch was invalidated while in flight, not caching"
                    );
                }
                (None, _) => {}
            }
        }

        guard.flight.publish(result.clone());
        result
    }

    /// Like [`MetadataCache::get`], but give up after `timeout`.
    ///
    /// The engine call runs on a worker thread and is never aborted. When the
    /// deadline passes it keeps running, and its result still lands in the
    /// cache.
    pub fn get_timeout<E: Engine + 'static>(
        self: &Arc<Self>,
        engine: Arc<E>,
        name: &DatasetName,
        timeout: Duration,
    ) -> Result<Arc<DatasetStats>, Error> {
        if let Some(stats) = self.peek(name) {
            return Ok(stats);
        }

        let (tx, rx) = mpsc::channel();
        let cache = Arc::clone(self);
        let worker_name = name.clone();
        thread::spawn(move || {
            let result = cache.get(&*engine, &worker_name);
            // The caller may have stopped listening.
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(dataset = name.as_str(), ?timeout, "stats fetch timed out");
                Err(Error::Timeout {
                    name: name.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::new(libc::EINTR, "stats fetch abandoned").into())
            }
        }
    }

    /// Mark the entry for `name` stale so that the next `get` refetches.
    ///
    /// A fetch already in flight is detached: its waiters still receive its
    /// result, but it is not cached. Later callers wait for it to finish and
    /// then fetch again, so at most one fetch per name is ever running.
    pub fn invalidate(&self, name: &DatasetName) {
        let mut entries = self.entries();
        match entries.get_mut(name) {
            Some(Entry::Ready { stale, .. }) | Some(Entry::Pending { stale, .. }) => {
                *stale = true
            }
            None => return,
        }
        tracing::debug!(dataset = name.as_str(), "invalidated cached stats");
    }

    /// Store `stats` for `name` unless fresh stats are already cached, and
    /// return whichever value is cached afterwards.
    pub fn prime(&self, name: &DatasetName, stats: DatasetStats) -> Arc<DatasetStats> {
        let mut entries = self.entries();
        match entries.entry(name.clone()) {
            MapEntry::Occupied(mut occupied) => match occupied.get() {
                Entry::Ready { stats, stale: false } => Arc::clone(stats),
                // Leave a running fetch in charge of the entry.
                Entry::Pending { .. } => Arc::new(stats),
                Entry::Ready { .. } => {
                    let stats = Arc::new(stats);
                    occupied.insert(Entry::Ready {
                        stats: Arc::clone(&stats),
                        stale: false,
                    });
                    stats
                }
            },
            MapEntry::Vacant(vacant) => {
                let stats = Arc::new(stats);
                vacant.insert(Entry::Ready {
                    stats: Arc::clone(&stats),
                    stale: false,
                });
                stats
            }
        }
    }

    /// Return fresh cached stats without touching the engine.
    pub fn peek(&self, name: &DatasetName) -> Option<Arc<DatasetStats>> {
        match self.entries().get(name) {
            Some(Entry::Ready { stats, stale: false }) => Some(Arc::clone(stats)),
            _ => None,
        }
    }

    /// Drop whatever is cached for `name`. A fetch in flight is detached
    /// instead, and its entry goes away when it finishes.
    pub fn remove(&self, name: &DatasetName) {
        let mut entries = self.entries();
        match entries.get_mut(name) {
            Some(Entry::Pending { stale, .. }) => *stale = true,
            Some(Entry::Ready { .. }) => {
                entries.remove(name);
            }
            None => {}
        }
    }

    /// Number of names with a cached or pending entry.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Remove the pending entry for `name` if it still belongs to `flight`.
    fn detach(&self, name: &DatasetName, flight: &Arc<Flight>) {
        let mut entries = self.entries();
        if let Some(Entry::Pending { flight: current, .. }) = entries.get(name) {
            if Arc::ptr_eq(current, flight) {
                entries.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::mock::EmulatorEngine;
    use crate::ds::EngineDataset;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Tracks how many stats fetches are running at once.
    struct ConcurrencyTracker {
        inner: EmulatorEngine,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ConcurrencyTracker {
        fn new(inner: EmulatorEngine) -> Self {
            Self {
                inner,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl Engine for ConcurrencyTracker {
        fn make_handle(&self, name: &DatasetName) -> Result<EngineDataset, Error> {
            self.inner.make_handle(name)
        }

        fn fetch_stats(&self, name: &DatasetName) -> Result<DatasetStats, Error> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = self.inner.fetch_stats(name);
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn duplicate_string(&self, text: &str) -> Result<String, Error> {
            self.inner.duplicate_string(text)
        }

        fn mount_options(&self, name: &DatasetName) -> Result<Option<String>, Error> {
            self.inner.mount_options(name)
        }
    }

    fn name(s: &str) -> DatasetName {
        DatasetName::new(s).unwrap()
    }

    #[test]
    fn test_get_caches() {
        let engine = EmulatorEngine::sampled();
        let cache = MetadataCache::new();
        let ds = name("zfake/data");

        let first = cache.get(&engine, &ds).unwrap();
        let second = cache.get(&engine, &ds).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.fetch_count("zfake/data"), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(&ds).is_some());
    }

    #[test]
    fn test_concurrent_get_collapses_fetches() {
        let engine = Arc::new(EmulatorEngine::sampled().with_latency(Duration::from_millis(100)));
        let cache = Arc::new(MetadataCache::new());
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = vec![];
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                cache.get(&*engine, &name("zfake/data")).unwrap()
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(engine.fetch_count("zfake/data"), 1);
        for stats in &results {
            assert!(Arc::ptr_eq(stats, &results[0]));
        }
    }

    #[test]
    fn test_distinct_names_fetch_independently() {
        let engine = Arc::new(EmulatorEngine::sampled());
        let cache = Arc::new(MetadataCache::new());

        let mut handles = vec![];
        for ds in ["zfake", "zfake/data", "zfake/vol", "zfake/clone"] {
            let engine = Arc::clone(&engine);
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                cache.get(&*engine, &name(ds)).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.total_fetches(), 4);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_invalidate_refetches() {
        let engine = EmulatorEngine::sampled();
        let cache = MetadataCache::new();
        let ds = name("zfake/data");

        let before = cache.get(&engine, &ds).unwrap();
        engine.update_stats("zfake/data", |stats| stats.num_clones = 3);

        // Still cached.
        assert_eq!(cache.get(&engine, &ds).unwrap().num_clones, 0);

        cache.invalidate(&ds);
        assert!(cache.peek(&ds).is_none());
        let after = cache.get(&engine, &ds).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.num_clones, 3);
        assert_eq!(engine.fetch_count("zfake/data"), 2);
    }

    #[test]
    fn test_invalidate_always_refetches_even_if_unchanged() {
        let engine = EmulatorEngine::sampled();
        let cache = MetadataCache::new();
        let ds = name("zfake/vol");

        let before = cache.get(&engine, &ds).unwrap();
        cache.invalidate(&ds);
        let after = cache.get(&engine, &ds).unwrap();
        assert_eq!(before, after);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(engine.fetch_count("zfake/vol"), 2);
    }

    #[test]
    fn test_invalidate_unknown_name_is_noop() {
        let cache = MetadataCache::new();
        cache.invalidate(&name("zfake/data"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_during_fetch() {
        let engine = Arc::new(EmulatorEngine::sampled().with_latency(Duration::from_millis(200)));
        let cache = Arc::new(MetadataCache::new());

        let leader = {
            let engine = Arc::clone(&engine);
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get(&*engine, &name("zfake/data")).unwrap())
        };

        // Let the leader register its fetch, then invalidate it.
        thread::sleep(Duration::from_millis(50));
        cache.invalidate(&name("zfake/data"));

        // The leader still gets its result...
        let first = leader.join().unwrap();
        assert_eq!(first.creation_txg, 100);
        // ...but it was not cached.
        assert!(cache.peek(&name("zfake/data")).is_none());

        cache.get(&*engine, &name("zfake/data")).unwrap();
        assert_eq!(engine.fetch_count("zfake/data"), 2);
    }

    #[test]
    fn test_invalidate_during_fetch_keeps_one_fetch_in_flight() {
        let engine = Arc::new(ConcurrencyTracker::new(
            EmulatorEngine::sampled().with_latency(Duration::from_millis(300)),
        ));
        let cache = Arc::new(MetadataCache::new());

        let spawn_get = || {
            let engine = Arc::clone(&engine);
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get(&*engine, &name("zfake/data")).unwrap())
        };

        let leader = spawn_get();
        thread::sleep(Duration::from_millis(50));
        engine
            .inner
            .update_stats("zfake/data", |stats| stats.num_clones = 5);
        cache.invalidate(&name("zfake/data"));
        let follower = spawn_get();

        leader.join().unwrap();
        // The follower waited for the invalidated fetch, then fetched again.
        let after = follower.join().unwrap();
        assert_eq!(after.num_clones, 5);
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
        assert_eq!(engine.inner.fetch_count("zfake/data"), 2);
        assert!(Arc::ptr_eq(&after, &cache.peek(&name("zfake/data")).unwrap()));
    }

    #[test]
    fn test_errors_are_not_cached() {
        let engine = EmulatorEngine::sampled();
        let cache = MetadataCache::new();
        let ds = name("zfake/data");

        engine.fail("zfake/data", libc::EIO, "I/O error");
        let err = cache.get(&engine, &ds).unwrap_err();
        assert_eq!(err, Error::Engine(EngineError::new(libc::EIO, "I/O error")));
        assert!(cache.is_empty());

        engine.clear_failure("zfake/data");
        assert!(cache.get(&engine, &ds).is_ok());

        let err = cache.get(&engine, &name("zfake/missing")).unwrap_err();
        assert_eq!(err, Error::not_found("zfake/missing"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_waiters_share_errors() {
        let engine = Arc::new(EmulatorEngine::sampled().with_latency(Duration::from_millis(100)));
        engine.fail("zfake/data", libc::EACCES, "permission denied");
        let cache = Arc::new(MetadataCache::new());
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = vec![];
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                cache.get(&*engine, &name("zfake/data"))
            }));
        }

        for handle in handles {
            let result = handle.join().unwrap();
            assert!(matches!(
                result,
                Err(Error::Engine(EngineError {
                    errno: libc::EACCES,
                    ..
                }))
            ));
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_timeout() {
        let engine = Arc::new(EmulatorEngine::sampled().with_latency(Duration::from_millis(300)));
        let cache = Arc::new(MetadataCache::new());
        let ds = name("zfake/data");

        let err = cache
            .get_timeout(Arc::clone(&engine), &ds, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        // The abandoned fetch still completes and is cached; a plain get joins
        // it or reads its result rather than fetching again.
        let stats = cache.get(&*engine, &ds).unwrap();
        assert_eq!(stats.creation_txg, 100);
        assert_eq!(engine.fetch_count("zfake/data"), 1);
    }

    #[test]
    fn test_get_timeout_success() {
        let engine = Arc::new(EmulatorEngine::sampled());
        let cache = Arc::new(MetadataCache::new());
        let stats = cache
            .get_timeout(engine, &name("zfake/vol"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(stats.creation_txg, 300);
    }

    #[test]
    fn test_get_timeout_uses_cached_stats() {
        let engine = Arc::new(EmulatorEngine::sampled().with_latency(Duration::from_millis(100)));
        let cache = Arc::new(MetadataCache::new());
        let ds = name("zfake/data");

        let cached = cache.get(&*engine, &ds).unwrap();
        // Fresh stats are returned without waiting on a worker.
        let stats = cache
            .get_timeout(Arc::clone(&engine), &ds, Duration::ZERO)
            .unwrap();
        assert!(Arc::ptr_eq(&cached, &stats));
        assert_eq!(engine.fetch_count("zfake/data"), 1);
    }

    #[test]
    fn test_prime() {
        let engine = EmulatorEngine::sampled();
        let cache = MetadataCache::new();
        let ds = name("zfake/data");

        let fetched = engine.fetch_stats(&ds).unwrap();
        let primed = cache.prime(&ds, fetched.clone());
        assert!(Arc::ptr_eq(&primed, &cache.get(&engine, &ds).unwrap()));

        // Fresh entries win over later primes.
        let mut newer = fetched.clone();
        newer.num_clones = 9;
        let kept = cache.prime(&ds, newer.clone());
        assert!(Arc::ptr_eq(&primed, &kept));

        // Stale entries are replaced.
        cache.invalidate(&ds);
        let replaced = cache.prime(&ds, newer);
        assert_eq!(replaced.num_clones, 9);
        assert_eq!(engine.fetch_count("zfake/data"), 1);
    }

    #[test]
    fn test_remove() {
        let engine = EmulatorEngine::sampled();
        let cache = MetadataCache::new();
        let ds = name("zfake/data");
        cache.get(&engine, &ds).unwrap();
        cache.remove(&ds);
        assert!(cache.is_empty());
        cache.get(&engine, &ds).unwrap();
        assert_eq!(engine.fetch_count("zfake/data"), 2);
    }
}
