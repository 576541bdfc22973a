// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::{CString, c_char};

use super::Error;
use super::validation::{validate_component, validate_name};

/// An already-validated dataset or snapshot name that can be passed
/// directly to the FFI layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetName {
    inner: CString,
}

impl DatasetName {
    pub fn new(name: &str) -> Result<Self, Error> {
        validate_name(name)?;
        // Validation rejects anything but ASCII alphanumerics and a handful
        // of punctuation, so there can be no nul byte.
        let inner = CString::new(name).map_err(|_| Error::invalid_name(name, "contains nul"))?;
        Ok(Self { inner })
    }

    pub fn append(&self, child: &str) -> Result<Self, Error> {
        if self.is_snapshot() {
            return Err(Error::invalid_name(
                self.as_str(),
                "cannot append to a snapshot",
            ));
        }
        validate_component(child, true)?;
        Self::new(&format!("{}/{}", self.as_str(), child))
    }

    pub fn snapshot(&self, name: &str) -> Result<Self, Error> {
        if self.is_snapshot() {
            return Err(Error::invalid_name(
                self.as_str(),
                "cannot snapshot a snapshot",
            ));
        }
        validate_component(name, false)?;
        Self::new(&format!("{}@{}", self.as_str(), name))
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.inner.as_ptr()
    }

    pub fn as_str(&self) -> &str {
        // Validated names are ASCII.
        self.inner.to_str().unwrap_or_default()
    }

    pub fn is_snapshot(&self) -> bool {
        self.as_str().contains('@')
    }

    /// The dataset part of the name, e.g. `tank/data` for `tank/data@snap`.
    pub fn head(&self) -> Self {
        match self.as_str().split_once('@') {
            Some((head, _)) => Self::from_validated(head),
            None => self.clone(),
        }
    }

    /// Get the pool name (the first component) for the dataset.
    pub fn pool(&self) -> Self {
        let head = self.head();
        match head.as_str().split_once('/') {
            Some((pool, _)) => Self::from_validated(pool),
            None => head,
        }
    }

    /// Get the "basename" for the dataset, e.g. for `tank/data/fs@snapshot`
    /// this is `fs@snapshot`.
    pub fn basename(&self) -> &str {
        let name = self.as_str();
        match name.rfind('/') {
            Some(slash_pos) => &name[slash_pos + 1..],
            None => name,
        }
    }

    /// Get the parent of this dataset. The parent of a snapshot is the
    /// parent of the dataset it belongs to.
    pub fn parent(&self) -> Option<DatasetName> {
        let head = self.head();
        head.as_str()
            .rfind('/')
            .map(|index| Self::from_validated(&head.as_str()[..index]))
    }

    // Build a name from a prefix of an already-validated name. Any prefix
    // ending on a component boundary is itself valid.
    fn from_validated(name: &str) -> Self {
        Self {
            inner: CString::new(name).unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for DatasetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetName::new(s)
    }
}
