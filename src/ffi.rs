//! C ABI shim exposing the FTL's mount/read/write/unmount surface to
//! callers outside the Rust world (`init`/`read`/`write`/`deinit`
//! entry points over opaque handles and plain C types).
//!
//! Every entry point takes/returns plain C types and never panics
//! across the boundary: errors are mapped to a negative `errno`-style
//! code instead of unwinding.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::sync::Arc;

use crate::device::{FileBackedDevice, Geometry, ZoneDevice};
use crate::error::Error;
use crate::ftl::{Ftl, FtlParams};

/// Opaque handle returned by [`zns_ftl_init`].
pub struct ZnsFtlHandle {
    ftl: Ftl,
}

fn error_code(err: &Error) -> c_int {
    match err {
        Error::NoSpace => -1,
        Error::NotFound => -2,
        Error::InvalidArgument(_) => -3,
        Error::IoError(_) => -4,
        Error::Corruption { .. } => -5,
    }
}

/// Mounts a file-backed ZNS device at `path` and returns an opaque
/// handle, or a null pointer on error.
///
/// # Safety
/// `path` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn zns_ftl_init(
    path: *const c_char,
    zones: u32,
    blocks_per_zone: u32,
    lba_size: u32,
    mdts: u32,
    log_zones: u32,
    force_reset: c_int,
) -> *mut ZnsFtlHandle {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    let path = match CStr::from_ptr(path).to_str() {
        Ok(p) => p,
        Err(_) => return std::ptr::null_mut(),
    };

    let geometry = Geometry {
        zones,
        blocks_per_zone,
        lba_size,
        mdts,
    };
    let force_reset = force_reset != 0;

    let device = match FileBackedDevice::open(Path::new(path), geometry, force_reset) {
        Ok(d) => Arc::new(d) as Arc<dyn ZoneDevice>,
        Err(_) => return std::ptr::null_mut(),
    };

    let params = FtlParams {
        log_zones,
        gc_watermark: 0.1,
        force_reset,
    };

    match Ftl::init(device, params) {
        Ok(ftl) => Box::into_raw(Box::new(ZnsFtlHandle { ftl })),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Reads `n` bytes starting at logical block address `a` into `buf`.
/// Returns 0 on success, a negative error code otherwise.
///
/// # Safety
/// `handle` must be a live pointer from [`zns_ftl_init`]; `buf` must be
/// valid for `n` bytes.
#[no_mangle]
pub unsafe extern "C" fn zns_ftl_read(
    handle: *mut ZnsFtlHandle,
    a: u64,
    buf: *mut u8,
    n: usize,
) -> c_int {
    if handle.is_null() || buf.is_null() {
        return -3;
    }
    let handle = &*handle;
    let slice = std::slice::from_raw_parts_mut(buf, n);
    match handle.ftl.read(a, slice, n) {
        Ok(()) => 0,
        Err(e) => error_code(&e),
    }
}

/// Writes `n` bytes from `buf` starting at logical block address `a`.
/// Returns 0 on success, a negative error code otherwise.
///
/// # Safety
/// `handle` must be a live pointer from [`zns_ftl_init`]; `buf` must be
/// valid for `n` bytes.
#[no_mangle]
pub unsafe extern "C" fn zns_ftl_write(
    handle: *mut ZnsFtlHandle,
    a: u64,
    buf: *const u8,
    n: usize,
) -> c_int {
    if handle.is_null() || buf.is_null() {
        return -3;
    }
    let handle = &*handle;
    let slice = std::slice::from_raw_parts(buf, n);
    match handle.ftl.write(a, slice, n) {
        Ok(()) => 0,
        Err(e) => error_code(&e),
    }
}

/// Returns the FTL's addressable capacity in bytes.
///
/// # Safety
/// `handle` must be a live pointer from [`zns_ftl_init`].
#[no_mangle]
pub unsafe extern "C" fn zns_ftl_capacity(handle: *mut ZnsFtlHandle) -> u64 {
    if handle.is_null() {
        return 0;
    }
    (*handle).ftl.capacity_bytes()
}

/// Unmounts the FTL and frees the handle.
///
/// # Safety
/// `handle` must be a live pointer from [`zns_ftl_init`], not
/// previously freed.
#[no_mangle]
pub unsafe extern "C" fn zns_ftl_deinit(handle: *mut ZnsFtlHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    handle.ftl.deinit();
}
