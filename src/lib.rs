// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A process-wide cache of ZFS dataset handles.
//!
//! [`ds::Registry`] hands out reference-counted handles keyed by validated
//! dataset name, and [`ds::MetadataCache`] collapses concurrent statistics
//! fetches for the same dataset into a single engine call. All engine access
//! goes through the [`ds::Engine`] trait; `ds::zfs` implements it on top of
//! libzfs (behind the `libzfs` feature) and [`ds::mock`] in memory.

pub mod ds;
