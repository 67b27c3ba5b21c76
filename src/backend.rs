//! Backend interface (component C) and the two concrete backends
//! normatively described by spec.md §4.C: a host-only null backend and a
//! device-object-backed one built on a small [`DeviceContext`] capability
//! trait that stands in for the "generic device context" spec.md §1
//! externalizes.
//!
//! `prepare`/`unload` are the two operations spec.md §4.C describes as
//! the buffer's ops table. Host memory itself is owned directly by
//! [`crate::buffer::Buffer`] (spec.md §3 "Owns: host_mem"), so a
//! backend's `prepare(SYSMEM)` only answers "may I allocate" — the byte
//! movement primitives below (`upload`/`download`/`map`/`unmap`) exist
//! only to move bytes into and out of the `BUFFER` location, which the
//! `Buffer` cannot do itself since the device object is opaque to it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::location::Locations;

/// An opaque backend handle to a device-resident allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BoHandle(pub u64);

/// Errors a [`DeviceContext`] can report back through [`Backend`] methods.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// The context could not satisfy the allocation.
    #[error("device buffer allocation failed")]
    OutOfMemory,
    /// The requested feature (e.g. stream-output) is unsupported.
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
}

/// The minimal capability a device context must expose for the
/// device-object backend to drive migrations, grounded in the
/// `Device`/`Queue` split of `gfx_hal::device::Device`.
pub trait DeviceContext: Send + Sync {
    /// Allocate a device-resident buffer object of `size` bytes usable for
    /// `bind_flags`.
    fn create_bo(&self, size: u64, bind_flags: u32) -> Result<BoHandle, DeviceError>;

    /// Destroy a previously created buffer object. Must tolerate being
    /// asked to destroy a handle it does not recognize.
    fn destroy_bo(&self, bo: BoHandle);

    /// Copy `data` into the device buffer object at `offset`. `discard`
    /// requests storage renaming semantics (the whole BO may be reused
    /// under a fresh address) rather than an in-place partial write.
    fn upload(&self, bo: BoHandle, offset: u64, data: &[u8], discard: bool);

    /// Copy `out.len()` bytes starting at `offset` out of the device
    /// buffer object into `out`.
    fn download(&self, bo: BoHandle, offset: u64, out: &mut [u8]);

    /// End transform feedback on the pipeline stage currently bound to
    /// `bo`, if any. Called before destroying a BO that is bound for
    /// stream-output while that stage is dirty (spec.md §4.C).
    fn end_transform_feedback(&self, bo: BoHandle);

    /// Map the whole buffer object for host access.
    fn map_bo(&self, bo: BoHandle) -> Result<NonNull<u8>, DeviceError>;

    /// Unmap a buffer object previously mapped with [`Self::map_bo`].
    fn unmap_bo(&self, bo: BoHandle);
}

/// The buffer's ops table (spec.md §4.C): ensure/destroy storage for a
/// location, plus the byte-movement primitives a real backend needs to
/// actually migrate data into and out of `BUFFER`.
pub trait Backend: Send + Sync {
    /// Ensure a storage site for `location` exists. Idempotent.
    fn prepare(&self, location: Locations) -> bool;

    /// Destroy the storage site for `location`. Must tolerate being
    /// called when storage does not exist.
    fn unload(&self, location: Locations);

    /// Copy `data` into the device buffer object at `offset`.
    fn upload(&self, offset: u64, data: &[u8], discard: bool);

    /// Copy bytes out of the device buffer object into `out`.
    fn download(&self, offset: u64, out: &mut [u8]);

    /// Map the device buffer object for host access.
    fn map(&self) -> Result<NonNull<u8>, DeviceError>;

    /// Unmap the device buffer object.
    fn unmap(&self);

    /// Register a new weak back-reference into this backend's BO-user
    /// list (spec.md §5, §9 "Weak BO-user link"), returning the shared
    /// validity flag the caller should consult.
    fn register_user(&self) -> Arc<AtomicBool>;
}

/// Host-only backend: `prepare(SYSMEM)` always succeeds, every other
/// location is refused. Used by buffers created with `USE_BO = false` and
/// by the test suite.
#[derive(Debug, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn prepare(&self, location: Locations) -> bool {
        location == Locations::SYSMEM
    }

    fn unload(&self, _location: Locations) {}

    fn upload(&self, _offset: u64, _data: &[u8], _discard: bool) {
        unreachable!("NullBackend never validates the BUFFER location");
    }

    fn download(&self, _offset: u64, _out: &mut [u8]) {
        unreachable!("NullBackend never validates the BUFFER location");
    }

    fn map(&self) -> Result<NonNull<u8>, DeviceError> {
        Err(DeviceError::Unsupported("device mapping on NullBackend"))
    }

    fn unmap(&self) {}

    fn register_user(&self) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }
}

/// A registered back-reference into a [`BoRegistry`]: the concrete
/// realization of the "weak BO-user link" design note (spec.md §9). The
/// registry owns a list of these; users never own the BO, only a `Weak`
/// handle to a shared validity flag that the registry flips on
/// destruction.
#[derive(Debug, Default)]
pub struct BoRegistry {
    users: Mutex<Vec<Weak<AtomicBool>>>,
}

impl BoRegistry {
    /// Register a new user, returning the `valid` flag it should consult.
    pub fn register(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(true));
        self.users.lock().unwrap().push(Arc::downgrade(&flag));
        flag
    }

    /// Invalidate every currently-registered user and drop dead entries.
    pub fn invalidate_all(&self) {
        let mut users = self.users.lock().unwrap();
        for weak in users.iter() {
            if let Some(flag) = weak.upgrade() {
                flag.store(false, Ordering::SeqCst);
            }
        }
        users.retain(|w| w.strong_count() > 0);
    }
}

/// Device-object-backed backend: `prepare(BUFFER)` creates or reuses a
/// device BO (refusing when device residency is disabled), `unload(BUFFER)`
/// destroys it.
pub struct DeviceBackend<C: DeviceContext> {
    context: Arc<C>,
    size: u64,
    bind_flags: u32,
    use_bo: bool,
    stream_output: bool,
    bo: Mutex<Option<BoHandle>>,
    registry: Arc<BoRegistry>,
}

impl<C: DeviceContext> DeviceBackend<C> {
    /// Create a device-object backend. `use_bo` mirrors the buffer's
    /// `USE_BO` flag (spec.md §3 invariant 3): when false, `prepare(BUFFER)`
    /// always fails. `stream_output` marks the BO as bound for transform
    /// feedback, so `unload` ends that pipeline stage before destruction.
    pub fn new(context: Arc<C>, size: u64, bind_flags: u32, use_bo: bool, stream_output: bool) -> Self {
        DeviceBackend {
            context,
            size,
            bind_flags,
            use_bo,
            stream_output,
            bo: Mutex::new(None),
            registry: Arc::new(BoRegistry::default()),
        }
    }

    /// The live device buffer object, if any.
    pub fn bo(&self) -> Option<BoHandle> {
        *self.bo.lock().unwrap()
    }

    fn ensure_bo(&self) -> bool {
        if !self.use_bo {
            return false;
        }
        let mut guard = self.bo.lock().unwrap();
        if guard.is_some() {
            return true;
        }
        match self.context.create_bo(self.size, self.bind_flags) {
            Ok(handle) => {
                *guard = Some(handle);
                true
            }
            Err(err) => {
                log::debug!("device buffer allocation failed: {}", err);
                false
            }
        }
    }
}

impl<C: DeviceContext> Backend for DeviceBackend<C> {
    fn prepare(&self, location: Locations) -> bool {
        match location {
            Locations::SYSMEM => true,
            Locations::BUFFER => self.ensure_bo(),
            _ => false,
        }
    }

    fn unload(&self, location: Locations) {
        if location == Locations::BUFFER {
            let mut guard = self.bo.lock().unwrap();
            if let Some(handle) = guard.take() {
                if self.stream_output {
                    self.context.end_transform_feedback(handle);
                }
                self.registry.invalidate_all();
                self.context.destroy_bo(handle);
            }
        }
    }

    fn upload(&self, offset: u64, data: &[u8], discard: bool) {
        let bo = self.bo().expect("upload requires a live device buffer object");
        self.context.upload(bo, offset, data, discard);
    }

    fn download(&self, offset: u64, out: &mut [u8]) {
        let bo = self.bo().expect("download requires a live device buffer object");
        self.context.download(bo, offset, out);
    }

    fn map(&self) -> Result<NonNull<u8>, DeviceError> {
        let bo = self.bo().ok_or(DeviceError::Unsupported("map without a live BO"))?;
        self.context.map_bo(bo)
    }

    fn unmap(&self) {
        if let Some(bo) = self.bo() {
            self.context.unmap_bo(bo);
        }
    }

    fn register_user(&self) -> Arc<AtomicBool> {
        self.registry.register()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct FakeDevice {
        next: AtomicU64,
        destroyed: Mutex<Vec<BoHandle>>,
        memory: Mutex<std::collections::HashMap<u64, Vec<u8>>>,
    }

    impl DeviceContext for FakeDevice {
        fn create_bo(&self, size: u64, _bind_flags: u32) -> Result<BoHandle, DeviceError> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            self.memory.lock().unwrap().insert(id, vec![0u8; size as usize]);
            Ok(BoHandle(id))
        }
        fn destroy_bo(&self, bo: BoHandle) {
            self.destroyed.lock().unwrap().push(bo);
            self.memory.lock().unwrap().remove(&bo.0);
        }
        fn upload(&self, bo: BoHandle, offset: u64, data: &[u8], _discard: bool) {
            let mut mem = self.memory.lock().unwrap();
            let buf = mem.get_mut(&bo.0).unwrap();
            buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        fn download(&self, bo: BoHandle, offset: u64, out: &mut [u8]) {
            let mem = self.memory.lock().unwrap();
            let buf = &mem[&bo.0];
            out.copy_from_slice(&buf[offset as usize..offset as usize + out.len()]);
        }
        fn end_transform_feedback(&self, _bo: BoHandle) {}
        fn map_bo(&self, _bo: BoHandle) -> Result<NonNull<u8>, DeviceError> {
            Err(DeviceError::Unsupported("map_bo in test fake"))
        }
        fn unmap_bo(&self, _bo: BoHandle) {}
    }

    #[test]
    fn null_backend_refuses_buffer_location() {
        let backend = NullBackend;
        assert!(backend.prepare(Locations::SYSMEM));
        assert!(!backend.prepare(Locations::BUFFER));
    }

    #[test]
    fn device_backend_refuses_buffer_when_use_bo_false() {
        let device = Arc::new(FakeDevice::default());
        let backend = DeviceBackend::new(device, 64, 0, false, false);
        assert!(!backend.prepare(Locations::BUFFER));
    }

    #[test]
    fn device_backend_prepare_is_idempotent() {
        let device = Arc::new(FakeDevice::default());
        let backend = DeviceBackend::new(device.clone(), 64, 0, true, false);
        assert!(backend.prepare(Locations::BUFFER));
        let first = backend.bo();
        assert!(backend.prepare(Locations::BUFFER));
        assert_eq!(first, backend.bo());
    }

    #[test]
    fn unload_invalidates_registered_users() {
        let device = Arc::new(FakeDevice::default());
        let backend = DeviceBackend::new(device, 64, 0, true, false);
        backend.prepare(Locations::BUFFER);
        let flag = backend.register_user();
        backend.unload(Locations::BUFFER);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn unload_tolerates_missing_storage() {
        let device = Arc::new(FakeDevice::default());
        let backend = DeviceBackend::new(device, 64, 0, true, false);
        backend.unload(Locations::BUFFER);
        backend.unload(Locations::SYSMEM);
    }

    #[test]
    fn upload_and_download_round_trip() {
        let device = Arc::new(FakeDevice::default());
        let backend = DeviceBackend::new(device, 64, 0, true, false);
        backend.prepare(Locations::BUFFER);
        backend.upload(0, &[1, 2, 3, 4], true);
        let mut out = [0u8; 4];
        backend.download(0, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
