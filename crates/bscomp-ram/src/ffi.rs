//! Artifact entry points exported from the `cdylib` build.
//!
//! See [`bscomp_device::abi`] for the contract.

use core::ffi::c_void;
use std::ptr;

use bscomp_device::abi::{RawDevice, ABI_VERSION};
use bscomp_device::{ConfigBlob, Device, DeviceError};

use crate::{RamDevice, RAM_ARTIFACT};

const OK: i32 = 0;
const ERR_NULL: i32 = -1;
const ERR_START: i32 = -5;

fn error_code(err: &DeviceError) -> i32 {
    match err {
        DeviceError::NotRunning => -2,
        DeviceError::AddressOutOfRange { .. } => -3,
        _ => -4,
    }
}

/// Constructs a RAM device from `config_len` bytes at `config`.
///
/// Returns null when the configuration is rejected.
///
/// # Safety
///
/// `config` must be valid for reads of `config_len` bytes, or null with `config_len == 0`.
#[no_mangle]
pub unsafe extern "C" fn bscomp_device_new(config: *const u8, config_len: usize) -> *mut RawDevice {
    let bytes = if config.is_null() || config_len == 0 {
        Vec::new()
    } else {
        // SAFETY: guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(config, config_len) }.to_vec()
    };

    let ram = match RamDevice::new(RAM_ARTIFACT, ConfigBlob::new(bytes)) {
        Ok(ram) => ram,
        Err(err) => {
            tracing::warn!("rejecting RAM artifact configuration: {err}");
            return ptr::null_mut();
        }
    };

    let export_memory_size = ram.size() as u32;
    let device_type = ram.info().device_type.0;
    let device = Box::into_raw(Box::new(ram)) as *mut c_void;

    Box::into_raw(Box::new(RawDevice {
        abi_version: ABI_VERSION,
        export_memory_size,
        device_type,
        device,
        start: Some(start),
        stop: Some(stop),
        load_bytes: Some(load_bytes),
        write_bytes: Some(write_bytes),
        interrupt: None,
    }))
}

/// Releases a device returned by [`bscomp_device_new`].
///
/// # Safety
///
/// `dev` must be null or a pointer returned by [`bscomp_device_new`] that has not been destroyed.
#[no_mangle]
pub unsafe extern "C" fn bscomp_device_destroy(dev: *mut RawDevice) {
    if dev.is_null() {
        return;
    }
    // SAFETY: `dev` and its `device` field were produced by `Box::into_raw` in
    // `bscomp_device_new`.
    unsafe {
        let raw = Box::from_raw(dev);
        if !raw.device.is_null() {
            let ram = Box::from_raw(raw.device as *mut RamDevice);
            ram.stop();
        }
    }
}

/// # Safety
///
/// `device` must be the `device` field of a live [`RawDevice`] built by this artifact.
unsafe fn ram<'a>(device: *mut c_void) -> Option<&'a RamDevice> {
    // SAFETY: guaranteed by the caller.
    unsafe { (device as *const RamDevice).as_ref() }
}

unsafe extern "C" fn start(device: *mut c_void) -> i32 {
    let Some(ram) = (unsafe { ram(device) }) else {
        return ERR_NULL;
    };
    match ram.start() {
        Ok(()) => OK,
        Err(_) => ERR_START,
    }
}

unsafe extern "C" fn stop(device: *mut c_void) -> i32 {
    let Some(ram) = (unsafe { ram(device) }) else {
        return ERR_NULL;
    };
    ram.stop();
    OK
}

unsafe extern "C" fn load_bytes(device: *mut c_void, offset: u32, len: u32, dst: *mut u8) -> i32 {
    let Some(ram) = (unsafe { ram(device) }) else {
        return ERR_NULL;
    };
    if dst.is_null() && len != 0 {
        return ERR_NULL;
    }
    match ram.read(u64::from(offset), len as usize) {
        Ok(bytes) => {
            // SAFETY: the host guarantees `dst` holds at least `len` bytes.
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
            OK
        }
        Err(err) => error_code(&err),
    }
}

unsafe extern "C" fn write_bytes(
    device: *mut c_void,
    offset: u32,
    len: u32,
    src: *const u8,
) -> i32 {
    let Some(ram) = (unsafe { ram(device) }) else {
        return ERR_NULL;
    };
    if src.is_null() && len != 0 {
        return ERR_NULL;
    }
    let data = if len == 0 {
        &[][..]
    } else {
        // SAFETY: the host guarantees `src` holds at least `len` bytes.
        unsafe { std::slice::from_raw_parts(src, len as usize) }
    };
    match ram.write(u64::from(offset), data) {
        Ok(()) => OK,
        Err(err) => error_code(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_points_round_trip_through_the_abi() {
        let config = 32u32.to_ne_bytes();
        let raw = unsafe { bscomp_device_new(config.as_ptr(), config.len()) };
        assert!(!raw.is_null());

        let dev = unsafe { &*raw };
        assert_eq!(dev.abi_version, ABI_VERSION);
        assert_eq!(dev.export_memory_size, 32);

        unsafe {
            assert_eq!((dev.start.unwrap())(dev.device), OK);
            let data = *b"ram!";
            assert_eq!((dev.write_bytes.unwrap())(dev.device, 8, 4, data.as_ptr()), OK);
            let mut out = [0u8; 4];
            assert_eq!((dev.load_bytes.unwrap())(dev.device, 8, 4, out.as_mut_ptr()), OK);
            assert_eq!(&out, b"ram!");
            assert_eq!((dev.load_bytes.unwrap())(dev.device, 30, 4, out.as_mut_ptr()), -3);
            assert_eq!((dev.stop.unwrap())(dev.device), OK);
            bscomp_device_destroy(raw);
        }
    }

    #[test]
    fn zero_size_is_rejected_with_null() {
        let config = 0u32.to_ne_bytes();
        let raw = unsafe { bscomp_device_new(config.as_ptr(), config.len()) };
        assert!(raw.is_null());
        unsafe { bscomp_device_destroy(raw) };
    }
}
