//! Registry entry bookkeeping shared by the in-process backends
//!
//! Tracks device entries with kernel-style reference counts, query
//! registrations with their pending-handle queues, and global
//! retain/release counters so resource discipline is observable.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::criteria::{DeviceProperties, MatchingQuery};
use crate::registry::{IterToken, PortHandle, RawCallback, RawHandle};

pub(crate) struct Entry {
    pub props: DeviceProperties,
    pub entry_id: u64,
    pub refcount: u64,
    pub attached: bool,
}

pub(crate) struct Registration {
    pub port: PortHandle,
    /// `true` for a matched-query registration, `false` for terminated.
    pub matched: bool,
    pub query: MatchingQuery,
    pub callback: RawCallback,
    pub context: u64,
    pub pending: VecDeque<RawHandle>,
}

/// Callback invocation collected while the table lock was held; the owner
/// invokes these after unlocking.
pub(crate) type PendingCallback = (RawCallback, u64, IterToken);

#[derive(Default)]
pub(crate) struct EntryTable {
    devices: BTreeMap<RawHandle, Entry>,
    registrations: BTreeMap<u64, Registration>,
    retains: u64,
    releases: u64,
}

impl EntryTable {
    /// Insert a newly attached device with the registry's own reference.
    pub(crate) fn insert_device(&mut self, handle: RawHandle, entry_id: u64, props: DeviceProperties) {
        self.retains += 1;
        self.devices.insert(
            handle,
            Entry {
                props,
                entry_id,
                refcount: 1,
                attached: true,
            },
        );
    }

    pub(crate) fn entry(&self, handle: RawHandle) -> Option<&Entry> {
        self.devices.get(&handle)
    }

    /// Mark a device detached and drop the registry's own reference.
    /// Returns `false` for an unknown or already-detached handle.
    pub(crate) fn mark_detached(&mut self, handle: RawHandle) -> bool {
        match self.devices.get_mut(&handle) {
            Some(entry) if entry.attached => {
                entry.attached = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn retain(&mut self, handle: RawHandle) {
        let entry = self
            .devices
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("retain of unknown handle {handle:?}"));
        entry.refcount += 1;
        self.retains += 1;
    }

    pub(crate) fn release(&mut self, handle: RawHandle) {
        let entry = self
            .devices
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("release of unknown handle {handle:?}"));
        assert!(
            entry.refcount > 0,
            "release without matching retain for {handle:?}"
        );
        entry.refcount -= 1;
        self.releases += 1;
        if entry.refcount == 0 {
            self.devices.remove(&handle);
        }
    }

    pub(crate) fn add_registration(&mut self, iter: IterToken, registration: Registration) {
        self.registrations.insert(iter.0, registration);
        // Matched registrations start with every already-attached matching
        // device pending, to be picked up by the caller's initial drain.
        let reg = &self.registrations[&iter.0];
        if reg.matched {
            let preexisting: Vec<RawHandle> = self
                .devices
                .iter()
                .filter(|(_, e)| e.attached && reg.query.matches(&e.props))
                .map(|(h, _)| *h)
                .collect();
            for handle in preexisting {
                self.enqueue_on(iter.0, handle);
            }
        }
    }

    /// Queue a device transition on every registration of the given kind
    /// whose query matches, returning the callbacks to invoke.
    pub(crate) fn enqueue_matching(
        &mut self,
        handle: RawHandle,
        matched: bool,
    ) -> Vec<PendingCallback> {
        let Some(entry) = self.devices.get(&handle) else {
            return Vec::new();
        };
        let props = entry.props.clone();
        let targets: Vec<u64> = self
            .registrations
            .iter()
            .filter(|(_, r)| r.matched == matched && r.query.matches(&props))
            .map(|(id, _)| *id)
            .collect();

        let mut callbacks = Vec::with_capacity(targets.len());
        for id in targets {
            self.enqueue_on(id, handle);
            let reg = &self.registrations[&id];
            callbacks.push((reg.callback, reg.context, IterToken(id)));
        }
        callbacks
    }

    /// Retain the handle on behalf of the iterator and queue it.
    fn enqueue_on(&mut self, reg_id: u64, handle: RawHandle) {
        self.retain(handle);
        if let Some(reg) = self.registrations.get_mut(&reg_id) {
            reg.pending.push_back(handle);
        }
    }

    /// Pop the next pending handle; ownership moves to the caller.
    pub(crate) fn pop_pending(&mut self, iter: IterToken) -> Option<RawHandle> {
        self.registrations
            .get_mut(&iter.0)
            .and_then(|r| r.pending.pop_front())
    }

    /// Drop a registration, releasing any handles still pending on it.
    pub(crate) fn remove_registration(&mut self, iter: IterToken) {
        if let Some(reg) = self.registrations.remove(&iter.0) {
            for handle in reg.pending {
                self.release(handle);
            }
        } else {
            debug!(?iter, "release of unknown iterator ignored");
        }
    }

    /// Drop every registration still attached to a port.
    pub(crate) fn remove_port_registrations(&mut self, port: PortHandle) {
        let stale: Vec<u64> = self
            .registrations
            .iter()
            .filter(|(_, r)| r.port == port)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.remove_registration(IterToken(id));
        }
    }

    pub(crate) fn retain_count(&self) -> u64 {
        self.retains
    }

    pub(crate) fn release_count(&self) -> u64 {
        self.releases
    }

    /// Sum of all live reference counts.
    pub(crate) fn live_references(&self) -> u64 {
        self.devices.values().map(|e| e.refcount).sum()
    }

    pub(crate) fn device_count(&self) -> usize {
        self.devices.len()
    }
}
