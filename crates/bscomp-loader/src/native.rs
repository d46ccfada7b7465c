use std::path::Path;
use std::sync::Mutex;

use bscomp_device::abi::{
    DeviceDestroyFn, DeviceNewFn, RawDevice, ABI_VERSION, DEVICE_DESTROY_SYMBOL, DEVICE_NEW_SYMBOL,
};
use bscomp_device::{
    check_range, lock, ConfigBlob, ConstructionError, Device, DeviceError, DeviceInfo, DeviceType,
    LifecycleState, StartError,
};
use libloading::Library;

/// Artifact error codes with a fixed meaning; anything else is passed through as
/// [`DeviceError::Failed`].
const ERR_NOT_RUNNING: i32 = -2;
const ERR_OUT_OF_RANGE: i32 = -3;

/// Device backed by a handle obtained from a native artifact.
pub struct NativeDevice {
    info: DeviceInfo,
    config: ConfigBlob,
    size: u64,
    destroy: DeviceDestroyFn,
    inner: Mutex<NativeInner>,
    // Dropped after `inner`; the handle's code lives in the library.
    _library: Option<Library>,
}

struct NativeInner {
    state: LifecycleState,
    raw: RawHandle,
}

struct RawHandle(*mut RawDevice);

// SAFETY: the handle is only dereferenced while holding `NativeDevice::inner`, and the artifact
// contract requires its entry points to tolerate being called from any thread.
unsafe impl Send for RawHandle {}

impl NativeDevice {
    /// Loads the artifact at `path` and constructs a device from it.
    pub fn load(path: &Path, config: ConfigBlob) -> Result<Self, ConstructionError> {
        let display = path.display().to_string();

        // SAFETY: loading runs the artifact's initializers; artifacts are trusted host plugins.
        let library = unsafe { Library::new(path) }.map_err(|err| {
            ConstructionError::ArtifactNotFound {
                path: display.clone(),
                reason: err.to_string(),
            }
        })?;

        let symbol = |name: &str| ConstructionError::SymbolMissing {
            path: display.clone(),
            symbol: name.to_string(),
        };
        // SAFETY: the exported symbols are declared with exactly these signatures by the ABI.
        let (new_fn, destroy_fn) = unsafe {
            let new_fn = *library
                .get::<DeviceNewFn>(DEVICE_NEW_SYMBOL.as_bytes())
                .map_err(|_| symbol(DEVICE_NEW_SYMBOL))?;
            let destroy_fn = *library
                .get::<DeviceDestroyFn>(DEVICE_DESTROY_SYMBOL.as_bytes())
                .map_err(|_| symbol(DEVICE_DESTROY_SYMBOL))?;
            (new_fn, destroy_fn)
        };

        tracing::debug!(artifact = %path.display(), "loaded native artifact");

        // SAFETY: both entry points come from `library`, which the device keeps alive.
        unsafe { Self::from_entry_points(display, new_fn, destroy_fn, config, Some(library)) }
    }

    /// Constructs a device through an artifact's entry points.
    ///
    /// # Safety
    ///
    /// `new_fn` and `destroy_fn` must implement the artifact ABI and stay callable for as long as
    /// the returned device lives (`library`, if given, is kept alive for that purpose).
    pub unsafe fn from_entry_points(
        identity: impl Into<String>,
        new_fn: DeviceNewFn,
        destroy_fn: DeviceDestroyFn,
        config: ConfigBlob,
        library: Option<Library>,
    ) -> Result<Self, ConstructionError> {
        let identity = identity.into();
        let bytes = config.as_bytes();

        // SAFETY: `bytes` is valid for `bytes.len()` reads for the duration of the call.
        let raw = unsafe { new_fn(bytes.as_ptr(), bytes.len()) };
        if raw.is_null() {
            return Err(ConstructionError::ConstructionRejected(format!(
                "{identity} rejected a {}-byte configuration",
                bytes.len()
            )));
        }

        // SAFETY: non-null handles returned by `new_fn` point to a valid `RawDevice`.
        let header = unsafe { &*raw };
        if header.abi_version != ABI_VERSION {
            let version = header.abi_version;
            // SAFETY: `raw` came from this artifact's `new_fn` and is destroyed exactly once.
            unsafe { destroy_fn(raw) };
            return Err(ConstructionError::ConstructionRejected(format!(
                "{identity} speaks device ABI v{version}, host expects v{ABI_VERSION}"
            )));
        }

        let size = u64::from(header.export_memory_size);
        let info = DeviceInfo::new(identity, DeviceType(header.device_type));
        tracing::debug!(device = %info, size, "constructed native device");

        Ok(Self {
            info,
            config,
            size,
            destroy: destroy_fn,
            inner: Mutex::new(NativeInner {
                state: LifecycleState::Constructed,
                raw: RawHandle(raw),
            }),
            _library: library,
        })
    }
}

fn device_error(code: i32, offset: u64, len: usize) -> DeviceError {
    match code {
        ERR_NOT_RUNNING => DeviceError::NotRunning,
        ERR_OUT_OF_RANGE => DeviceError::AddressOutOfRange { offset, len },
        code => DeviceError::Failed(code),
    }
}

impl Device for NativeDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn config(&self) -> &ConfigBlob {
        &self.config
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn state(&self) -> LifecycleState {
        lock(&self.inner).state
    }

    fn start(&self) -> Result<(), StartError> {
        let mut inner = lock(&self.inner);
        inner.state.check_start()?;

        // SAFETY: the handle stays valid until `Drop`; access is serialized by `inner`.
        let raw = unsafe { &*inner.raw.0 };
        if let Some(start) = raw.start {
            // SAFETY: as above.
            let code = unsafe { start(raw.device) };
            if code != 0 {
                return Err(StartError::Device(format!(
                    "{} start returned {code}",
                    self.info.identity
                )));
            }
        }

        inner.state = LifecycleState::Running;
        tracing::debug!(device = %self.info, "native device running");
        Ok(())
    }

    fn stop(&self) {
        let mut inner = lock(&self.inner);
        if inner.state.is_halted() {
            return;
        }

        // SAFETY: the handle stays valid until `Drop`; access is serialized by `inner`.
        let raw = unsafe { &*inner.raw.0 };
        if let Some(stop) = raw.stop {
            // SAFETY: as above.
            let code = unsafe { stop(raw.device) };
            if code != 0 {
                tracing::warn!(device = %self.info, code, "native device stop reported failure");
            }
        }

        inner.state = LifecycleState::Halted;
        tracing::debug!(device = %self.info, "native device halted");
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        let inner = lock(&self.inner);
        inner.state.ensure_running()?;
        check_range(offset, len, self.size)?;

        // SAFETY: the handle stays valid until `Drop`; access is serialized by `inner`.
        let raw = unsafe { &*inner.raw.0 };
        let load_bytes = raw.load_bytes.ok_or(DeviceError::Unsupported)?;

        // `size` is a u32, so an in-range request fits the ABI's u32 fields.
        let mut buf = vec![0u8; len];
        // SAFETY: `buf` holds `len` writable bytes for the duration of the call.
        let code = unsafe { load_bytes(raw.device, offset as u32, len as u32, buf.as_mut_ptr()) };
        if code != 0 {
            return Err(device_error(code, offset, len));
        }
        Ok(buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let inner = lock(&self.inner);
        inner.state.ensure_running()?;
        check_range(offset, data.len(), self.size)?;

        // SAFETY: the handle stays valid until `Drop`; access is serialized by `inner`.
        let raw = unsafe { &*inner.raw.0 };
        let write_bytes = raw.write_bytes.ok_or(DeviceError::Unsupported)?;

        // SAFETY: `data` is readable for `data.len()` bytes for the duration of the call.
        let code =
            unsafe { write_bytes(raw.device, offset as u32, data.len() as u32, data.as_ptr()) };
        if code != 0 {
            return Err(device_error(code, offset, data.len()));
        }
        Ok(())
    }

    fn interrupt(&self, code: u32) -> Result<(), DeviceError> {
        let inner = lock(&self.inner);
        inner.state.ensure_running()?;

        // SAFETY: the handle stays valid until `Drop`; access is serialized by `inner`.
        let raw = unsafe { &*inner.raw.0 };
        let interrupt = raw.interrupt.ok_or(DeviceError::Unsupported)?;
        // SAFETY: as above.
        match unsafe { interrupt(raw.device, code) } {
            0 => Ok(()),
            err => Err(device_error(err, 0, 0)),
        }
    }
}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        self.stop();
        let raw = lock(&self.inner).raw.0;
        // SAFETY: `raw` came from the paired `new_fn` and is destroyed exactly once, here.
        unsafe { (self.destroy)(raw) };
    }
}
