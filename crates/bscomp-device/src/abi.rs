//! C ABI shared between the host and native device artifacts.
//!
//! An artifact is a dynamic library exporting two functions:
//!
//! ```c
//! struct RawDevice* bscomp_device_new(const uint8_t* config, size_t config_len);
//! void bscomp_device_destroy(struct RawDevice* dev);
//! ```
//!
//! `bscomp_device_new` returns null when the artifact rejects its configuration. Every function
//! pointer in [`RawDevice`] returns `0` on success and a negative code on failure. The host copies
//! nothing out of the device except through `load_bytes`; the `dst`/`src` pointers handed to
//! `load_bytes`/`write_bytes` are only valid for the duration of the call.

use core::ffi::c_void;

pub const ABI_VERSION: u32 = 1;

pub const DEVICE_NEW_SYMBOL: &str = "bscomp_device_new";
pub const DEVICE_DESTROY_SYMBOL: &str = "bscomp_device_destroy";

pub type DeviceFn = unsafe extern "C" fn(device: *mut c_void) -> i32;
pub type LoadBytesFn =
    unsafe extern "C" fn(device: *mut c_void, offset: u32, len: u32, dst: *mut u8) -> i32;
pub type WriteBytesFn =
    unsafe extern "C" fn(device: *mut c_void, offset: u32, len: u32, src: *const u8) -> i32;
pub type InterruptFn = unsafe extern "C" fn(device: *mut c_void, code: u32) -> i32;

pub type DeviceNewFn = unsafe extern "C" fn(config: *const u8, config_len: usize) -> *mut RawDevice;
pub type DeviceDestroyFn = unsafe extern "C" fn(device: *mut RawDevice);

/// Device handle returned by an artifact.
#[repr(C)]
#[derive(Debug)]
pub struct RawDevice {
    pub abi_version: u32,
    /// Size of the memory window exported onto the bus.
    pub export_memory_size: u32,
    pub device_type: u64,
    /// Artifact-private state passed back into every function below.
    pub device: *mut c_void,

    pub start: Option<DeviceFn>,
    pub stop: Option<DeviceFn>,
    pub load_bytes: Option<LoadBytesFn>,
    pub write_bytes: Option<WriteBytesFn>,
    pub interrupt: Option<InterruptFn>,
}
