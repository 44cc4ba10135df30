//! udev-backed registry (Linux, feature `udev`)
//!
//! Adapts kernel uevents for the `usb`/`usb_device` subsystem onto the
//! [`RegistryBackend`] seam. Opening the notification port starts a
//! listener task on the udev monitor socket; add/remove uevents feed the
//! same entry table the simulated registry uses, so handle ownership rules
//! are identical across backends.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::criteria::{DeviceProperties, MatchingQuery};
use crate::entries::{EntryTable, PendingCallback, Registration};
use crate::registry::{
    IterToken, PortHandle, RawCallback, RawHandle, RegistryBackend, MATCHED_EVENT,
    STATUS_BAD_EVENT_NAME, STATUS_BAD_PORT, TERMINATED_EVENT,
};

#[derive(Default)]
struct UdevState {
    table: EntryTable,
    /// Kernel syspath → our handle, for resolving remove events
    by_syspath: BTreeMap<String, RawHandle>,
    open_ports: Vec<PortHandle>,
    listeners: BTreeMap<u64, JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<UdevState>,
    next_id: AtomicU64,
}

/// Device registry fed by udev hot-plug events
///
/// Cheap to clone; all clones share one entry table, so a handle taken
/// through one clone may be released through another.
#[derive(Default, Clone)]
pub struct UdevRegistry {
    shared: Arc<Shared>,
}

impl UdevRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Opens a port with no monitor socket behind it, so the table contract
    // is testable without udev access.
    #[cfg(test)]
    fn open_port_without_listener(&self) -> PortHandle {
        let port = PortHandle(self.shared.next_id());
        self.shared.state.lock().open_ports.push(port);
        port
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn device_arrived(&self, syspath: String, props: DeviceProperties) {
        let handle = RawHandle(self.next_id());
        let entry_id = self.next_id();
        let callbacks = {
            let mut state = self.state.lock();
            // A monitor event can race the initial enumeration scan; the
            // first sighting of a syspath wins.
            if state.by_syspath.contains_key(&syspath) {
                debug!(syspath, "device already known, add ignored");
                return;
            }
            state.by_syspath.insert(syspath, handle);
            state.table.insert_device(handle, entry_id, props);
            state.table.enqueue_matching(handle, true)
        };
        fire(callbacks);
    }

    fn device_left(&self, syspath: &str) {
        let callbacks = {
            let mut state = self.state.lock();
            let Some(handle) = state.by_syspath.remove(syspath) else {
                debug!(syspath, "remove event for unknown device ignored");
                return;
            };
            if !state.table.mark_detached(handle) {
                return;
            }
            let callbacks = state.table.enqueue_matching(handle, false);
            state.table.release(handle);
            callbacks
        };
        fire(callbacks);
    }
}

fn fire(callbacks: Vec<PendingCallback>) {
    for (callback, context, iterator) in callbacks {
        callback(context, iterator);
    }
}

fn attr(device: &tokio_udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .map(|v| v.to_string_lossy().trim().to_owned())
}

fn hex_attr(device: &tokio_udev::Device, name: &str) -> Option<u16> {
    attr(device, name).and_then(|s| u16::from_str_radix(&s, 16).ok())
}

fn properties_of(device: &tokio_udev::Device) -> Option<DeviceProperties> {
    Some(DeviceProperties {
        vendor_id: hex_attr(device, "idVendor")?,
        product_id: hex_attr(device, "idProduct")?,
        product_name: attr(device, "product"),
        manufacturer_name: attr(device, "manufacturer"),
        serial_number: attr(device, "serial"),
    })
}

fn syspath_of(device: &tokio_udev::Device) -> String {
    device.syspath().to_string_lossy().into_owned()
}

// Entries already attached when the port opens still have to land in the
// table, so registrations can pre-queue them the way the seam promises.
fn scan_existing(shared: &Shared) {
    let mut enumerator = match tokio_udev::Enumerator::new() {
        Ok(enumerator) => enumerator,
        Err(err) => {
            warn!("Failed to create udev enumerator: {err}");
            return;
        }
    };
    if let Err(err) = enumerator.match_subsystem("usb") {
        warn!("Failed to filter udev enumeration: {err}");
        return;
    }
    let devices = match enumerator.scan_devices() {
        Ok(devices) => devices,
        Err(err) => {
            warn!("udev enumeration failed: {err}");
            return;
        }
    };
    for device in devices {
        if device.devtype() != Some(OsStr::new("usb_device")) {
            continue;
        }
        if let Some(props) = properties_of(&device) {
            shared.device_arrived(syspath_of(&device), props);
        }
    }
}

async fn listen(shared: Arc<Shared>, mut socket: tokio_udev::AsyncMonitorSocket) {
    while let Some(event) = socket.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!("udev monitor socket error: {err}");
                continue;
            }
        };
        let device = event.device();
        match event.event_type() {
            tokio_udev::EventType::Add => {
                if let Some(props) = properties_of(&device) {
                    shared.device_arrived(syspath_of(&device), props);
                }
            }
            tokio_udev::EventType::Remove => {
                shared.device_left(&syspath_of(&device));
            }
            other => debug!(?other, "uevent ignored"),
        }
    }
    debug!("udev listener stopped");
}

impl RegistryBackend for UdevRegistry {
    fn open_notification_port(&self) -> Option<PortHandle> {
        let socket = tokio_udev::MonitorBuilder::new()
            .ok()?
            .match_subsystem_devtype("usb", "usb_device")
            .ok()?
            .listen()
            .ok()?;
        let socket: tokio_udev::AsyncMonitorSocket = match socket.try_into() {
            Ok(socket) => socket,
            Err(err) => {
                warn!("Failed to bind udev monitor socket: {err}");
                return None;
            }
        };

        // The socket is already live, so devices arriving during the scan
        // show up either here or as an add event; device_arrived dedupes.
        scan_existing(&self.shared);

        let port = PortHandle(self.shared.next_id());
        let listener = tokio::spawn(listen(Arc::clone(&self.shared), socket));
        let mut state = self.shared.state.lock();
        state.open_ports.push(port);
        state.listeners.insert(port.0, listener);
        debug!(?port, "udev notification port opened");
        Some(port)
    }

    fn add_notification(
        &self,
        port: PortHandle,
        event_name: &str,
        query: &MatchingQuery,
        callback: RawCallback,
        context: u64,
    ) -> Result<IterToken, i32> {
        let matched = match event_name {
            MATCHED_EVENT => true,
            TERMINATED_EVENT => false,
            _ => return Err(STATUS_BAD_EVENT_NAME),
        };
        let iter = IterToken(self.shared.next_id());
        let mut state = self.shared.state.lock();
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
        self.shared.state.lock().table.pop_pending(iterator)
    }

    fn release_iterator(&self, iterator: IterToken) {
        self.shared.state.lock().table.remove_registration(iterator);
    }

    fn destroy_port(&self, port: PortHandle) {
        let mut state = self.shared.state.lock();
        state.open_ports.retain(|p| *p != port);
        if let Some(listener) = state.listeners.remove(&port.0) {
            listener.abort();
        }
        state.table.remove_port_registrations(port);
    }

    fn retain(&self, handle: RawHandle) {
        self.shared.state.lock().table.retain(handle);
    }

    fn release(&self, handle: RawHandle) {
        self.shared.state.lock().table.release(handle);
    }

    fn registry_entry_id(&self, handle: RawHandle) -> Option<u64> {
        self.shared
            .state
            .lock()
            .table
            .entry(handle)
            .map(|e| e.entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::USB_DEVICE_CLASS;

    fn noop_callback(_context: u64, _iterator: IterToken) {}

    fn class_query() -> MatchingQuery {
        MatchingQuery::for_class(USB_DEVICE_CLASS).unwrap()
    }

    #[test]
    fn seeded_devices_are_queued_at_registration() {
        let registry = UdevRegistry::new();
        registry.shared.device_arrived(
            "/sys/devices/pci0000:00/usb1/1-1".into(),
            DeviceProperties::default(),
        );

        let port = registry.open_port_without_listener();
        let iter = registry
            .add_notification(port, MATCHED_EVENT, &class_query(), noop_callback, 0)
            .unwrap();

        let handle = registry.iterator_next(iter).expect("seeded device pending");
        assert_eq!(registry.iterator_next(iter), None);

        registry.release(handle); // iterator_next handed us an owned reference
        registry.release_iterator(iter);
        registry.destroy_port(port);
    }

    #[test]
    fn duplicate_syspath_is_ignored() {
        let registry = UdevRegistry::new();
        let syspath = "/sys/devices/pci0000:00/usb1/1-2";
        registry
            .shared
            .device_arrived(syspath.into(), DeviceProperties::default());
        registry
            .shared
            .device_arrived(syspath.into(), DeviceProperties::default());

        let state = registry.shared.state.lock();
        assert_eq!(state.by_syspath.len(), 1);
        assert_eq!(state.table.device_count(), 1);
    }

    #[test]
    fn unknown_port_is_rejected() {
        let registry = UdevRegistry::new();
        assert_eq!(
            registry.add_notification(PortHandle(7), MATCHED_EVENT, &class_query(), noop_callback, 0),
            Err(STATUS_BAD_PORT)
        );
    }
}
