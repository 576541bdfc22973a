// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use super::{
    DatasetKind, DatasetName, DatasetStats, Engine, EngineDataset, EngineError, Error, ObjsetType,
};

/// A dataset known to the emulator.
#[derive(Clone, Debug)]
pub struct EmulatedDataset {
    pub kind: DatasetKind,
    pub head_kind: DatasetKind,
    pub stats: DatasetStats,
    pub properties: Vec<(String, String)>,
}

/// A storage engine populated with static data that operates entirely
/// in-memory with no side effects.
pub struct EmulatorEngine {
    datasets: RwLock<BTreeMap<String, EmulatedDataset>>,
    mounts: RwLock<BTreeMap<String, String>>,
    failures: RwLock<HashMap<String, EngineError>>,
    fetches: Mutex<HashMap<String, usize>>,
    handles_made: AtomicUsize,
    latency: Duration,
}

impl EmulatorEngine {
    pub fn new(datasets: Vec<(&str, EmulatedDataset)>) -> Self {
        Self {
            datasets: RwLock::new(
                datasets
                    .into_iter()
                    .map(|(name, ds)| (name.to_string(), ds))
                    .collect(),
            ),
            mounts: RwLock::new(BTreeMap::new()),
            failures: RwLock::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            handles_made: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self::new(vec![])
    }

    pub fn sampled() -> Self {
        let engine = Self::new(sample_datasets());
        engine.mount("zfake", "rw,xattr,noatime");
        engine.mount("zfake/data", "rw,relatime,xattr,posixacl");
        engine
    }

    /// Delay every stats fetch and handle construction by `latency`, to
    /// widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Generate a fake GUID based on the dataset name.
    pub fn generate_guid(name: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        hasher.finish()
    }

    /// Add or replace a dataset.
    pub fn insert(&self, name: &str, dataset: EmulatedDataset) {
        write(&self.datasets).insert(name.to_string(), dataset);
    }

    /// Remove a dataset, as if destroyed behind our back.
    pub fn remove(&self, name: &str) {
        write(&self.datasets).remove(name);
        write(&self.mounts).remove(name);
    }

    /// Apply `f` to the engine-side stats of `name`.
    pub fn update_stats<F>(&self, name: &str, f: F)
    where
        F: FnOnce(&mut DatasetStats),
    {
        if let Some(ds) = write(&self.datasets).get_mut(name) {
            f(&mut ds.stats);
        }
    }

    /// Record `name` as mounted with the given options.
    pub fn mount(&self, name: &str, options: &str) {
        write(&self.mounts).insert(name.to_string(), options.to_string());
    }

    pub fn unmount(&self, name: &str) {
        write(&self.mounts).remove(name);
    }

    /// Make every gateway call for `name` fail with `errno`.
    pub fn fail(&self, name: &str, errno: i32, description: &str) {
        write(&self.failures).insert(name.to_string(), EngineError::new(errno, description));
    }

    pub fn clear_failure(&self, name: &str) {
        write(&self.failures).remove(name);
    }

    /// Number of stats fetches issued for `name`, including the ones made on
    /// behalf of `make_handle`.
    pub fn fetch_count(&self, name: &str) -> usize {
        lock(&self.fetches).get(name).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        lock(&self.fetches).values().sum()
    }

    pub fn handles_made(&self) -> usize {
        self.handles_made.load(Ordering::SeqCst)
    }

    fn lookup(&self, name: &DatasetName) -> Result<EmulatedDataset, Error> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if let Some(err) = read(&self.failures).get(name.as_str()) {
            return Err(err.clone().into());
        }
        *lock(&self.fetches)
            .entry(name.as_str().to_string())
            .or_insert(0) += 1;
        read(&self.datasets)
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| Error::not_found(name.as_str()))
    }
}

impl Engine for EmulatorEngine {
    fn make_handle(&self, name: &DatasetName) -> Result<EngineDataset, Error> {
        let ds = self.lookup(name)?;
        self.handles_made.fetch_add(1, Ordering::SeqCst);

        // A stand-in for a packed nvlist: nul-terminated `key=value` pairs.
        let mut property_table = Vec::new();
        for (key, value) in &ds.properties {
            property_table.extend_from_slice(key.as_bytes());
            property_table.push(b'=');
            property_table.extend_from_slice(value.as_bytes());
            property_table.push(0);
        }

        Ok(EngineDataset {
            kind: ds.kind,
            head_kind: ds.head_kind,
            stats: ds.stats,
            property_table,
        })
    }

    fn fetch_stats(&self, name: &DatasetName) -> Result<DatasetStats, Error> {
        self.lookup(name).map(|ds| ds.stats)
    }

    fn duplicate_string(&self, text: &str) -> Result<String, Error> {
        if text.contains('\0') {
            return Err(Error::allocation("string contains a nul byte"));
        }
        Ok(text.to_string())
    }

    fn mount_options(&self, name: &DatasetName) -> Result<Option<String>, Error> {
        if let Some(err) = read(&self.failures).get(name.as_str()) {
            return Err(err.clone().into());
        }
        match read(&self.mounts).get(name.as_str()) {
            Some(options) => self.duplicate_string(options).map(Some),
            None => Ok(None),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build an emulated filesystem with plausible defaults.
pub fn filesystem(name: &str, creation_txg: u64) -> EmulatedDataset {
    EmulatedDataset {
        kind: DatasetKind::Filesystem,
        head_kind: DatasetKind::Filesystem,
        stats: DatasetStats {
            num_clones: 0,
            creation_txg,
            guid: EmulatorEngine::generate_guid(name),
            objset_type: ObjsetType::Zfs,
            is_snapshot: false,
            inconsistent: false,
            redacted: false,
            origin: None,
        },
        properties: vec![
            ("name".to_string(), name.to_string()),
            ("type".to_string(), "filesystem".to_string()),
        ],
    }
}

/// Build an emulated volume.
pub fn volume(name: &str, creation_txg: u64) -> EmulatedDataset {
    let mut ds = filesystem(name, creation_txg);
    ds.kind = DatasetKind::Volume;
    ds.head_kind = DatasetKind::Volume;
    ds.stats.objset_type = ObjsetType::Zvol;
    ds.properties[1].1 = "volume".to_string();
    ds
}

/// Build an emulated snapshot of a dataset of kind `head_kind`.
pub fn snapshot(name: &str, head_kind: DatasetKind, creation_txg: u64) -> EmulatedDataset {
    let mut ds = filesystem(name, creation_txg);
    ds.kind = DatasetKind::Snapshot;
    ds.head_kind = head_kind;
    ds.stats.is_snapshot = true;
    if head_kind == DatasetKind::Volume {
        ds.stats.objset_type = ObjsetType::Zvol;
    }
    ds.properties[1].1 = "snapshot".to_string();
    ds
}

fn sample_datasets() -> Vec<(&'static str, EmulatedDataset)> {
    let mut snap = snapshot("zfake/data@snap", DatasetKind::Filesystem, 150);
    snap.stats.num_clones = 1;

    let mut clone = filesystem("zfake/clone", 200);
    clone.stats.origin = Some("zfake/data@snap".to_string());

    let mut partial = filesystem("zfake/partial", 400);
    partial.stats.inconsistent = true;

    vec![
        ("zfake", filesystem("zfake", 1)),
        ("zfake/data", filesystem("zfake/data", 100)),
        ("zfake/data@snap", snap),
        ("zfake/clone", clone),
        ("zfake/vol", volume("zfake/vol", 300)),
        ("zfake/partial", partial),
    ]
}
