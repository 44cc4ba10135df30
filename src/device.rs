//! Owned reference to one registry entry

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::registry::{RawHandle, RegistryBackend};

/// Shared owning reference to one device-registry entry
///
/// Construction retains the raw handle and resolves its stable registry
/// identifier best-effort; the last clone's drop releases the handle exactly
/// once. The type is immutable after construction and safe to share across
/// concurrent readers. Two references compare equal iff their raw handles
/// are equal.
#[derive(Clone)]
pub struct DeviceRef {
    inner: Arc<OwnedHandle>,
}

struct OwnedHandle {
    backend: Arc<dyn RegistryBackend>,
    handle: RawHandle,
    registry_id: Option<u64>,
}

impl DeviceRef {
    /// Wrap a raw handle, taking an owned reference of our own.
    pub(crate) fn new(backend: Arc<dyn RegistryBackend>, handle: RawHandle) -> Self {
        backend.retain(handle);
        let registry_id = backend.registry_entry_id(handle);
        Self {
            inner: Arc::new(OwnedHandle {
                backend,
                handle,
                registry_id,
            }),
        }
    }

    /// The raw registry handle, for advanced platform interop.
    pub fn raw_handle(&self) -> RawHandle {
        self.inner.handle
    }

    /// Stable registry identifier, when the entry exposed one.
    pub fn registry_id(&self) -> Option<u64> {
        self.inner.registry_id
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.backend.release(self.handle);
    }
}

impl PartialEq for DeviceRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for DeviceRef {}

impl Hash for DeviceRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.handle.hash(state);
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("handle", &self.inner.handle)
            .field("registry_id", &self.inner.registry_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::DeviceProperties;
    use crate::sim::SimulatedRegistry;

    #[test]
    fn wrap_retains_and_drop_releases() {
        let sim = Arc::new(SimulatedRegistry::new());
        let handle = sim.attach_device(DeviceProperties::default());

        let retained_before = sim.retain_count();
        let released_before = sim.release_count();
        let device = DeviceRef::new(sim.clone(), handle);
        assert_eq!(sim.retain_count(), retained_before + 1);

        let clone = device.clone();
        drop(device);
        // Clone still owns the reference
        assert_eq!(sim.release_count(), released_before);

        drop(clone);
        assert_eq!(sim.release_count(), released_before + 1);
    }

    #[test]
    fn equality_is_by_raw_handle() {
        let sim = Arc::new(SimulatedRegistry::new());
        let a = sim.attach_device(DeviceProperties::default());
        let b = sim.attach_device(DeviceProperties::default());

        let ref_a1 = DeviceRef::new(sim.clone(), a);
        let ref_a2 = DeviceRef::new(sim.clone(), a);
        let ref_b = DeviceRef::new(sim.clone(), b);

        assert_eq!(ref_a1, ref_a2);
        assert_ne!(ref_a1, ref_b);
    }

    #[test]
    fn registry_id_resolved_at_construction() {
        let sim = Arc::new(SimulatedRegistry::new());
        let handle = sim.attach_device(DeviceProperties::default());
        let device = DeviceRef::new(sim.clone(), handle);
        assert_eq!(device.registry_id(), sim.registry_entry_id(handle));
    }
}
