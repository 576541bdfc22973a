// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::{CStr, CString, c_char};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    DatasetKind, DatasetName, DatasetStats, Engine, EngineDataset, EngineError, Error, ObjsetType,
};

/// A storage engine backed by libzfs.
pub struct LibZfsEngine {
    lzh: Mutex<LibHandle>,
}

impl LibZfsEngine {
    /// Initialize libzfs. The handle is released when the engine is dropped.
    pub fn new() -> Result<Self, Error> {
        let handle = unsafe { ffi::libzfs_init() };
        let handle = ptr::NonNull::new(handle).ok_or_else(|| {
            let err = std::io::Error::last_os_error();
            EngineError::new(
                err.raw_os_error().unwrap_or(libc::EIO),
                &format!("failed to initialize libzfs: {}", err),
            )
        })?;
        tracing::debug!("libzfs initialized");
        Ok(Self {
            lzh: Mutex::new(LibHandle { handle }),
        })
    }

    /// Get a guarded reference to the underlying `libzfs` handle.
    ///
    /// Calls and the error lookups that follow them must happen under the
    /// same guard, or `libzfs_errno` may describe another thread's failure.
    fn lock(&self) -> MutexGuard<'_, LibHandle> {
        self.lzh.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Engine for LibZfsEngine {
    fn make_handle(&self, name: &DatasetName) -> Result<EngineDataset, Error> {
        let lzh = self.lock();
        let dataset = RawDataset::make(&lzh, name)?;
        Ok(EngineDataset {
            kind: DatasetKind::from_zfs_type(name, dataset.zfs_type())?,
            head_kind: DatasetKind::from_zfs_type(name, dataset.head_type())?,
            stats: dataset.stats(),
            property_table: dataset.packed_properties()?,
        })
    }

    fn fetch_stats(&self, name: &DatasetName) -> Result<DatasetStats, Error> {
        let lzh = self.lock();
        let dataset = RawDataset::make(&lzh, name)?;
        Ok(dataset.stats())
    }

    fn duplicate_string(&self, text: &str) -> Result<String, Error> {
        let text = CString::new(text).map_err(|_| Error::allocation("string contains a nul byte"))?;
        let lzh = self.lock();
        lzh.strdup(text.as_ptr())
    }

    fn mount_options(&self, name: &DatasetName) -> Result<Option<String>, Error> {
        let lzh = self.lock();
        let mut entry = MaybeUninit::<ffi::Mnttab>::zeroed();
        let result =
            unsafe { ffi::libzfs_mnttab_find(lzh.as_ptr(), name.as_ptr(), entry.as_mut_ptr()) };
        if result != 0 {
            // ENOENT is the only failure mode: the dataset is not mounted.
            return Ok(None);
        }
        let entry = unsafe { entry.assume_init() };
        if entry.mnt_mntopts.is_null() {
            return Ok(Some(String::new()));
        }
        lzh.strdup(entry.mnt_mntopts).map(Some)
    }
}

/// Decode the fixed-size origin buffer of a stats block. An empty origin
/// means the dataset is not a clone. A buffer with no terminating nul is
/// taken whole.
fn origin_from_raw(raw: &[c_char; ffi::ZFS_MAX_DATASET_NAME_LEN]) -> Option<String> {
    let bytes: Vec<u8> = raw.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A native dataset handle, closed on drop. Never leaves this module.
struct RawDataset {
    handle: ptr::NonNull<ffi::ZfsHandle>,
}

impl RawDataset {
    /// Construct a handle with `make_dataset_handle`, which reads the
    /// dataset's stats block as part of construction.
    fn make(lzh: &LibHandle, name: &DatasetName) -> Result<Self, Error> {
        let handle = unsafe { ffi::make_dataset_handle(lzh.as_ptr(), name.as_ptr()) };
        match ptr::NonNull::new(handle) {
            Some(handle) => Ok(RawDataset { handle }),
            None => {
                // make_dataset_handle() reports through errno rather than the
                // libzfs error state.
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ENOENT) => Err(Error::not_found(name.as_str())),
                    Some(errno) => Err(EngineError::new(errno, &err.to_string()).into()),
                    None => Err(lzh.libzfs_error().into()),
                }
            }
        }
    }

    fn zfs_type(&self) -> i32 {
        unsafe { ffi::zfs_get_type(self.handle.as_ptr()) }
    }

    fn head_type(&self) -> i32 {
        unsafe { ffi::zfs_get_underlying_type(self.handle.as_ptr()) }
    }

    fn stats(&self) -> DatasetStats {
        // SAFETY: the handle came from make_dataset_handle() and stays valid
        // until we close it; we only read the leading fields it filled in.
        let raw = unsafe { &(*(self.handle.as_ptr() as *const ffi::ZfsHandleHead)).zfs_dmustats };
        DatasetStats {
            num_clones: raw.dds_num_clones,
            creation_txg: raw.dds_creation_txg,
            guid: raw.dds_guid,
            objset_type: ObjsetType::from(raw.dds_type),
            is_snapshot: raw.dds_is_snapshot != 0,
            inconsistent: raw.dds_inconsistent != 0,
            redacted: raw.dds_redacted != 0,
            origin: origin_from_raw(&raw.dds_origin),
        }
    }

    /// Pack the dataset's property nvlist in native encoding.
    fn packed_properties(&self) -> Result<Vec<u8>, Error> {
        let nvl = unsafe { ffi::zfs_get_all_props(self.handle.as_ptr()) };
        if nvl.is_null() {
            return Ok(Vec::new());
        }

        let mut size: usize = 0;
        let result = unsafe { ffi::nvlist_size(nvl, &mut size, ffi::NV_ENCODE_NATIVE) };
        if result != 0 {
            return Err(EngineError::new(result, "failed to size property nvlist").into());
        }

        let mut buf = vec![0u8; size];
        let mut buf_ptr = buf.as_mut_ptr() as *mut c_char;
        let mut len = size;
        let result =
            unsafe { ffi::nvlist_pack(nvl, &mut buf_ptr, &mut len, ffi::NV_ENCODE_NATIVE, 0) };
        if result != 0 {
            return Err(EngineError::new(result, "failed to pack property nvlist").into());
        }
        buf.truncate(len);
        Ok(buf)
    }
}

impl Drop for RawDataset {
    fn drop(&mut self) {
        unsafe {
            ffi::zfs_close(self.handle.as_ptr());
        }
    }
}

// Wraps the libzfs handle to manage its lifetime.
struct LibHandle {
    handle: ptr::NonNull<ffi::LibzfsHandle>,
}

impl LibHandle {
    /// Get the current libzfs error.
    fn libzfs_error(&self) -> EngineError {
        let errno = unsafe { ffi::libzfs_errno(self.handle.as_ptr()) };
        let desc_ptr = unsafe { ffi::libzfs_error_description(self.handle.as_ptr()) };
        let description = if desc_ptr.is_null() {
            // This should never happen (tm).
            "unknown".to_string()
        } else {
            let cstr = unsafe { CStr::from_ptr(desc_ptr) };
            cstr.to_string_lossy().to_string()
        };
        EngineError {
            errno,
            description,
            dataset: None,
        }
    }

    /// Copy a C string through `zfs_strdup` and take ownership of the copy.
    fn strdup(&self, text: *const c_char) -> Result<String, Error> {
        let copy = unsafe { ffi::zfs_strdup(self.handle.as_ptr(), text) };
        if copy.is_null() {
            return Err(Error::allocation("zfs_strdup returned NULL"));
        }
        let value = unsafe { CStr::from_ptr(copy) }
            .to_string_lossy()
            .into_owned();
        unsafe { libc::free(copy as *mut libc::c_void) };
        Ok(value)
    }

    // Get the underlying libzfs handle as a raw pointer.
    fn as_ptr(&self) -> *mut ffi::LibzfsHandle {
        self.handle.as_ptr()
    }
}

impl Drop for LibHandle {
    fn drop(&mut self) {
        unsafe {
            ffi::libzfs_fini(self.handle.as_ptr());
        }
    }
}

// SAFETY: We have complete control over the lifetime of the underlying libzfs
// handle and serialize access to it through LibZfsEngine's mutex.
unsafe impl Send for LibHandle {}

// libzfs FFI bindings
mod ffi {
    use std::os::raw::{c_char, c_int};

    // Opaque handle types matching libzfs
    #[repr(C)]
    pub struct LibzfsHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct ZfsHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct ZpoolHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct NvList {
        _opaque: [u8; 0],
    }

    pub const ZFS_MAX_DATASET_NAME_LEN: usize = 256;

    // nvpair encodings from sys/nvpair.h
    pub const NV_ENCODE_NATIVE: c_int = 0;

    // dmu_objset_stats_t from libzfs_impl.h.
    #[repr(C)]
    pub struct DmuObjsetStats {
        pub dds_num_clones: u64,
        pub dds_creation_txg: u64,
        pub dds_guid: u64,
        pub dds_type: c_int,
        pub dds_is_snapshot: u8,
        pub dds_inconsistent: u8,
        pub dds_redacted: u8,
        pub dds_origin: [c_char; ZFS_MAX_DATASET_NAME_LEN],
    }

    // The leading fields of struct zfs_handle, up to and including the stats
    // block. Only ever read through a pointer from make_dataset_handle().
    #[repr(C)]
    pub struct ZfsHandleHead {
        pub zfs_hdl: *mut LibzfsHandle,
        pub zpool_hdl: *mut ZpoolHandle,
        pub zfs_name: [c_char; ZFS_MAX_DATASET_NAME_LEN],
        pub zfs_type: c_int,
        pub zfs_head_type: c_int,
        pub zfs_dmustats: DmuObjsetStats,
    }

    // struct mnttab as provided by libspl on Linux.
    #[repr(C)]
    pub struct Mnttab {
        pub mnt_special: *mut c_char,
        pub mnt_mountp: *mut c_char,
        pub mnt_fstype: *mut c_char,
        pub mnt_mntopts: *mut c_char,
    }

    #[link(name = "zfs")]
    unsafe extern "C" {
        // Library initialization
        pub fn libzfs_init() -> *mut LibzfsHandle;
        pub fn libzfs_fini(hdl: *mut LibzfsHandle);

        // Error handling
        pub fn libzfs_errno(hdl: *mut LibzfsHandle) -> c_int;
        pub fn libzfs_error_description(hdl: *mut LibzfsHandle) -> *const c_char;

        // Dataset handle management
        pub fn make_dataset_handle(hdl: *mut LibzfsHandle, path: *const c_char)
        -> *mut ZfsHandle;
        pub fn zfs_close(zhp: *mut ZfsHandle);
        pub fn zfs_get_type(zhp: *const ZfsHandle) -> c_int;
        pub fn zfs_get_underlying_type(zhp: *const ZfsHandle) -> c_int;
        pub fn zfs_get_all_props(zhp: *mut ZfsHandle) -> *mut NvList;

        // Allocation
        pub fn zfs_strdup(hdl: *mut LibzfsHandle, text: *const c_char) -> *mut c_char;

        // Mount table cache
        pub fn libzfs_mnttab_find(
            hdl: *mut LibzfsHandle,
            fsname: *const c_char,
            entry: *mut Mnttab,
        ) -> c_int;
    }

    #[link(name = "nvpair")]
    unsafe extern "C" {
        pub fn nvlist_size(nvl: *mut NvList, size: *mut usize, encoding: c_int) -> c_int;
        pub fn nvlist_pack(
            nvl: *mut NvList,
            bufp: *mut *mut c_char,
            buflen: *mut usize,
            encoding: c_int,
            kmflag: c_int,
        ) -> c_int;
    }
}
