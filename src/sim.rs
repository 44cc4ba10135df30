//! In-process simulated device registry
//!
//! Drives the monitoring engine without an operating system: devices are
//! attached and detached programmatically, queries are evaluated with the
//! same exact-match semantics a platform registry would apply, and every
//! retain/release is counted so resource discipline is assertable from
//! tests. Releasing a handle that was never retained panics — in this
//! backend a reference-count underflow is a bug, not a recoverable error.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::criteria::DeviceProperties;
use crate::entries::{EntryTable, PendingCallback, Registration};
use crate::registry::{
    IterToken, PortHandle, RawCallback, RawHandle, RegistryBackend, MATCHED_EVENT,
    STATUS_BAD_EVENT_NAME, STATUS_BAD_PORT, TERMINATED_EVENT,
};

#[derive(Default)]
struct SimState {
    table: EntryTable,
    open_ports: Vec<PortHandle>,
    /// One-shot failure injections for setup-path tests
    fail_next_port: bool,
    /// Remaining `add_notification` calls to let through, then the status
    fail_add: Option<(u32, i32)>,
}

/// Simulated device-registry notification service
#[derive(Default)]
pub struct SimulatedRegistry {
    state: Mutex<SimState>,
    // Handles, ports, iterators, and entry ids share one id space
    next_id: AtomicU64,
}

impl SimulatedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Attach a device, delivering it to matching "matched" registrations.
    /// Returns the raw handle for later [`detach_device`](Self::detach_device).
    pub fn attach_device(&self, props: DeviceProperties) -> RawHandle {
        let handle = RawHandle(self.next_id());
        let entry_id = self.next_id();
        let callbacks = {
            let mut state = self.state.lock();
            state.table.insert_device(handle, entry_id, props);
            state.table.enqueue_matching(handle, true)
        };
        debug!(?handle, entry_id, "device attached");
        self.fire(callbacks);
        handle
    }

    /// Detach a device, delivering it to matching "terminated"
    /// registrations. Unknown or already-detached handles are ignored.
    pub fn detach_device(&self, handle: RawHandle) {
        let callbacks = {
            let mut state = self.state.lock();
            if !state.table.mark_detached(handle) {
                debug!(?handle, "detach of unknown device ignored");
                return;
            }
            let callbacks = state.table.enqueue_matching(handle, false);
            // The registry's own reference goes away with the detach
            state.table.release(handle);
            callbacks
        };
        debug!(?handle, "device detached");
        self.fire(callbacks);
    }

    /// Make the next `open_notification_port` call fail.
    pub fn inject_port_failure(&self) {
        self.state.lock().fail_next_port = true;
    }

    /// Make the next `add_notification` call fail with `status`.
    pub fn inject_add_failure(&self, status: i32) {
        self.inject_add_failure_at(1, status);
    }

    /// Make the `nth` (1-based) `add_notification` call from now fail with
    /// `status`. Calls before it succeed normally.
    pub fn inject_add_failure_at(&self, nth: u32, status: i32) {
        assert!(nth > 0, "nth is 1-based");
        self.state.lock().fail_add = Some((nth - 1, status));
    }

    /// Total retain operations observed (including the registry's own
    /// reference taken per attach).
    pub fn retain_count(&self) -> u64 {
        self.state.lock().table.retain_count()
    }

    /// Total release operations observed.
    pub fn release_count(&self) -> u64 {
        self.state.lock().table.release_count()
    }

    /// Sum of all outstanding references across live entries.
    pub fn live_references(&self) -> u64 {
        self.state.lock().table.live_references()
    }

    /// Number of entries still referenced by someone.
    pub fn device_count(&self) -> usize {
        self.state.lock().table.device_count()
    }

    // Callbacks run outside the state lock so they may call back into the
    // registry without deadlocking.
    fn fire(&self, callbacks: Vec<PendingCallback>) {
        for (callback, context, iterator) in callbacks {
            callback(context, iterator);
        }
    }
}

impl RegistryBackend for SimulatedRegistry {
    fn open_notification_port(&self) -> Option<PortHandle> {
        let mut state = self.state.lock();
        if state.fail_next_port {
            state.fail_next_port = false;
            return None;
        }
        drop(state);
        let port = PortHandle(self.next_id());
        self.state.lock().open_ports.push(port);
        Some(port)
    }

    fn add_notification(
        &self,
        port: PortHandle,
        event_name: &str,
        query: &crate::criteria::MatchingQuery,
        callback: RawCallback,
        context: u64,
    ) -> Result<IterToken, i32> {
        let matched = match event_name {
            MATCHED_EVENT => true,
            TERMINATED_EVENT => false,
            _ => return Err(STATUS_BAD_EVENT_NAME),
        };
        let iter = IterToken(self.next_id());
        let mut state = self.state.lock();
        if let Some((remaining, status)) = state.fail_add {
            if remaining == 0 {
                state.fail_add = None;
                return Err(status);
            }
            state.fail_add = Some((remaining - 1, status));
        }
        if !state.open_ports.contains(&port) {
            return Err(STATUS_BAD_PORT);
        }
        state.table.add_registration(
            iter,
            Registration {
                port,
                matched,
                query: query.clone(),
                callback,
                context,
                pending: Default::default(),
            },
        );
        Ok(iter)
    }

    fn iterator_next(&self, iterator: IterToken) -> Option<RawHandle> {
        self.state.lock().table.pop_pending(iterator)
    }

    fn release_iterator(&self, iterator: IterToken) {
        self.state.lock().table.remove_registration(iterator);
    }

    fn destroy_port(&self, port: PortHandle) {
        let mut state = self.state.lock();
        state.open_ports.retain(|p| *p != port);
        state.table.remove_port_registrations(port);
    }

    fn retain(&self, handle: RawHandle) {
        self.state.lock().table.retain(handle);
    }

    fn release(&self, handle: RawHandle) {
        self.state.lock().table.release(handle);
    }

    fn registry_entry_id(&self, handle: RawHandle) -> Option<u64> {
        self.state.lock().table.entry(handle).map(|e| e.entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{MatchingQuery, USB_DEVICE_CLASS};

    fn noop_callback(_context: u64, _iterator: IterToken) {}

    fn class_query() -> MatchingQuery {
        MatchingQuery::for_class(USB_DEVICE_CLASS).unwrap()
    }

    #[test]
    fn preexisting_devices_are_queued_at_registration() {
        let sim = SimulatedRegistry::new();
        let handle = sim.attach_device(DeviceProperties::default());

        let port = sim.open_notification_port().unwrap();
        let iter = sim
            .add_notification(port, MATCHED_EVENT, &class_query(), noop_callback, 0)
            .unwrap();

        assert_eq!(sim.iterator_next(iter), Some(handle));
        assert_eq!(sim.iterator_next(iter), None);

        sim.release(handle); // iterator_next handed us an owned reference
        sim.release_iterator(iter);
        sim.destroy_port(port);
    }

    #[test]
    fn releasing_iterator_releases_pending_handles() {
        let sim = SimulatedRegistry::new();
        let port = sim.open_notification_port().unwrap();
        let iter = sim
            .add_notification(port, MATCHED_EVENT, &class_query(), noop_callback, 0)
            .unwrap();

        let handle = sim.attach_device(DeviceProperties::default());
        sim.release_iterator(iter);
        sim.detach_device(handle);

        assert_eq!(sim.live_references(), 0);
        assert_eq!(sim.retain_count(), sim.release_count());
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let sim = SimulatedRegistry::new();
        let port = sim.open_notification_port().unwrap();
        assert_eq!(
            sim.add_notification(port, "published", &class_query(), noop_callback, 0),
            Err(STATUS_BAD_EVENT_NAME)
        );
    }

    #[test]
    #[should_panic(expected = "release of unknown handle")]
    fn double_release_panics() {
        let sim = SimulatedRegistry::new();
        let handle = sim.attach_device(DeviceProperties::default());
        sim.detach_device(handle); // drops the registry's own reference
        sim.release(handle); // nothing left to release
    }
}
