//! Asynchronous USB attach/detach monitoring
//!
//! This crate watches the operating system's device registry for USB
//! devices appearing and disappearing and republishes those transitions as
//! a typed, cancellable async stream, optionally filtered by device
//! identity:
//!
//! - [`DeviceMonitor`] — the engine: one session at a time, start/stop,
//!   guaranteed balanced acquire/release of every kernel handle
//! - [`MatchingCriteria`] — vendor/product ids plus optional product,
//!   manufacturer, and serial strings, all exact-match
//! - [`Notification`] — `DeviceConnected` / `DeviceDisconnected`, each
//!   carrying a shared owning [`DeviceRef`]
//! - [`RegistryBackend`] — the platform seam; the crate ships an
//!   in-process [`SimulatedRegistry`](sim::SimulatedRegistry) and, behind
//!   the `udev` feature on Linux, a udev-backed implementation
//!
//! Device metadata beyond identity (display names and friends) is left to
//! the caller via the raw handle accessor.

pub mod criteria;
pub mod device;
pub mod error;
pub mod registry;
pub mod sim;

mod channel;
mod context;
mod entries;
mod monitor;

#[cfg(all(target_os = "linux", feature = "udev"))]
pub mod udev;

pub use channel::NotificationStream;
pub use criteria::{
    DeviceProperties, MatchingCriteria, MatchingQuery, PropertyKey, PropertyValue,
    USB_DEVICE_CLASS,
};
pub use device::DeviceRef;
pub use error::MonitorError;
pub use monitor::{DeviceMonitor, Notification, NOTIFICATION_BUFFER};
pub use registry::{
    IterToken, PortHandle, RawCallback, RawHandle, RegistryBackend, MATCHED_EVENT,
    STATUS_BAD_EVENT_NAME, STATUS_BAD_PORT, TERMINATED_EVENT,
};
pub use sim::SimulatedRegistry;
