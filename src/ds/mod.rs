// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

#[cfg(feature = "json")]
use serde::Serialize;
use thiserror::Error as ThisError;

pub mod cache;
pub mod mock;
pub mod name;
pub mod registry;
pub mod validation;
#[cfg(feature = "libzfs")]
pub mod zfs;

pub use cache::MetadataCache;
pub use name::DatasetName;
pub use registry::{HandleRef, Registry};

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid dataset name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Dataset '{name}' not found")]
    NotFound { name: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to duplicate string: {reason}")]
    Allocation { reason: String },

    #[error("Dataset '{name}' is a {kind} but the engine reports snapshot={is_snapshot}")]
    KindMismatch {
        name: String,
        kind: DatasetKind,
        is_snapshot: bool,
    },

    #[error("Dataset '{name}' has unsupported type {zfs_type:#x}")]
    UnsupportedType { name: String, zfs_type: i32 },

    #[error("Timed out after {timeout:?} waiting for '{name}'")]
    Timeout { name: String, timeout: Duration },
}

impl Error {
    pub fn not_found(name: &str) -> Self {
        Error::NotFound {
            name: name.to_string(),
        }
    }

    pub fn invalid_name(name: &str, reason: &str) -> Self {
        Error::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn allocation(reason: &str) -> Self {
        Error::Allocation {
            reason: reason.to_string(),
        }
    }

    /// Attach the dataset name to an engine error that does not carry one.
    /// Other errors pass through untouched.
    pub fn for_dataset(self, name: &DatasetName) -> Self {
        match self {
            Error::Engine(err) if err.dataset.is_none() => Error::Engine(EngineError {
                dataset: Some(name.to_string()),
                ..err
            }),
            other => other,
        }
    }
}

/// Surfaces errors from the underlying storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub errno: i32,
    pub description: String,
    pub dataset: Option<String>,
}

impl EngineError {
    pub fn new(errno: i32, description: &str) -> Self {
        EngineError {
            errno,
            description: description.to_string(),
            dataset: None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.dataset {
            Some(name) => write!(f, "{}: {}", name, self.description),
            None => write!(f, "{}", self.description),
        }
    }
}

impl std::error::Error for EngineError {}

/// What kind of dataset a handle refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "json", derive(Serialize))]
#[cfg_attr(feature = "json", serde(rename_all = "lowercase"))]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
}

impl DatasetKind {
    // zfs_type_t values from sys/fs/zfs.h.
    const ZFS_TYPE_FILESYSTEM: i32 = 1 << 0;
    const ZFS_TYPE_SNAPSHOT: i32 = 1 << 1;
    const ZFS_TYPE_VOLUME: i32 = 1 << 2;

    /// Convert an engine `zfs_type_t`. Pools and bookmarks are rejected.
    pub fn from_zfs_type(name: &DatasetName, zfs_type: i32) -> Result<Self, Error> {
        match zfs_type {
            Self::ZFS_TYPE_FILESYSTEM => Ok(DatasetKind::Filesystem),
            Self::ZFS_TYPE_SNAPSHOT => Ok(DatasetKind::Snapshot),
            Self::ZFS_TYPE_VOLUME => Ok(DatasetKind::Volume),
            _ => Err(Error::UnsupportedType {
                name: name.to_string(),
                zfs_type,
            }),
        }
    }

    pub fn is_snapshot(self) -> bool {
        self == DatasetKind::Snapshot
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Volume => "volume",
            DatasetKind::Snapshot => "snapshot",
        };
        write!(f, "{}", s)
    }
}

/// The objset type recorded in a dataset's statistics block
/// (`dmu_objset_type_t`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(Serialize))]
#[cfg_attr(feature = "json", serde(rename_all = "lowercase"))]
pub enum ObjsetType {
    None,
    Meta,
    Zfs,
    Zvol,
    Other,
    Any,
    Unknown(i32),
}

impl From<i32> for ObjsetType {
    fn from(raw: i32) -> Self {
        match raw {
            0 => ObjsetType::None,
            1 => ObjsetType::Meta,
            2 => ObjsetType::Zfs,
            3 => ObjsetType::Zvol,
            4 => ObjsetType::Other,
            5 => ObjsetType::Any,
            other => ObjsetType::Unknown(other),
        }
    }
}

impl std::fmt::Display for ObjsetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjsetType::None => write!(f, "none"),
            ObjsetType::Meta => write!(f, "meta"),
            ObjsetType::Zfs => write!(f, "zfs"),
            ObjsetType::Zvol => write!(f, "zvol"),
            ObjsetType::Other => write!(f, "other"),
            ObjsetType::Any => write!(f, "any"),
            ObjsetType::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// Engine-reported counters for one dataset. Never mutated in place; a
/// refresh replaces the whole value.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(Serialize))]
pub struct DatasetStats {
    /// Number of clones of this dataset.
    pub num_clones: u64,
    /// Transaction group the dataset was created in.
    pub creation_txg: u64,
    /// Globally unique id.
    pub guid: u64,
    pub objset_type: ObjsetType,
    pub is_snapshot: bool,
    /// Set while a receive into the dataset is incomplete.
    pub inconsistent: bool,
    pub redacted: bool,
    /// The snapshot this dataset was cloned from, if any.
    pub origin: Option<String>,
}

/// Everything the engine hands back when constructing a dataset handle.
/// The native handle itself never leaves the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineDataset {
    pub kind: DatasetKind,
    /// The kind ignoring snapshot-ness, e.g. `Filesystem` for `pool/fs@snap`.
    pub head_kind: DatasetKind,
    pub stats: DatasetStats,
    /// Opaque property blob; for libzfs the native-packed property nvlist.
    pub property_table: Vec<u8>,
}

/// The sole call boundary into a storage engine. Implementations perform
/// no caching and no retries.
pub trait Engine: Send + Sync {
    /// Construct a handle for `name` and return its contents.
    fn make_handle(&self, name: &DatasetName) -> Result<EngineDataset, Error>;

    /// Read the current statistics block for `name`.
    fn fetch_stats(&self, name: &DatasetName) -> Result<DatasetStats, Error>;

    /// Copy `text` through the engine's allocator.
    fn duplicate_string(&self, text: &str) -> Result<String, Error>;

    /// Look `name` up in the engine's mount table. Returns `None` when the
    /// dataset is not mounted.
    fn mount_options(&self, name: &DatasetName) -> Result<Option<String>, Error>;
}

impl<E: Engine + ?Sized> Engine for std::sync::Arc<E> {
    fn make_handle(&self, name: &DatasetName) -> Result<EngineDataset, Error> {
        (**self).make_handle(name)
    }

    fn fetch_stats(&self, name: &DatasetName) -> Result<DatasetStats, Error> {
        (**self).fetch_stats(name)
    }

    fn duplicate_string(&self, text: &str) -> Result<String, Error> {
        (**self).duplicate_string(text)
    }

    fn mount_options(&self, name: &DatasetName) -> Result<Option<String>, Error> {
        (**self).mount_options(name)
    }
}

/// Check that a handle kind agrees with the snapshot flag in its stats.
pub(crate) fn check_kind(
    name: &DatasetName,
    kind: DatasetKind,
    stats: &DatasetStats,
) -> Result<(), Error> {
    if kind.is_snapshot() != stats.is_snapshot {
        tracing::warn!(
            dataset = name.as_str(),
            %kind,
            is_snapshot = stats.is_snapshot,
            "engine stats disagree with dataset kind"
        );
        return Err(Error::KindMismatch {
            name: name.to_string(),
            kind,
            is_snapshot: stats.is_snapshot,
        });
    }
    Ok(())
}
