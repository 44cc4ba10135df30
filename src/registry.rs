//! Registry backend seam
//!
//! [`RegistryBackend`] abstracts the operating system's device-registry
//! notification service: a notification port delivers events for registered
//! matching queries, each registration owns an iterator of pending raw
//! handles, and handles carry kernel-style reference counts that must be
//! balanced by the caller.
//!
//! The crate ships [`SimulatedRegistry`](crate::sim::SimulatedRegistry) for
//! tests and demos, and a udev-backed implementation behind the `udev`
//! feature on Linux.

use crate::criteria::MatchingQuery;

/// Event name registered for "device appeared" queries
pub const MATCHED_EVENT: &str = "matched";

/// Event name registered for "device terminated" queries
pub const TERMINATED_EVENT: &str = "terminated";

/// Status code returned for registrations with an unknown event name
pub const STATUS_BAD_EVENT_NAME: i32 = -22;

/// Status code returned for registrations against a closed port
pub const STATUS_BAD_PORT: i32 = -6;

/// Opaque kernel token identifying one registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

/// Opaque handle to one notification port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(pub u64);

/// Opaque token for one registered query's iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IterToken(pub u64);

/// Bare callback invoked by the registry when a registered query fires.
///
/// Carries no closure capture: only the opaque context the registration was
/// made with and the iterator holding the pending handles. Resolution back
/// to a live session goes through the process-wide context table.
pub type RawCallback = fn(context: u64, iterator: IterToken);

/// The device-registry notification service
///
/// Reference discipline: every handle returned by [`iterator_next`] arrives
/// already owned by the caller (one reference), and every [`retain`] must be
/// balanced by exactly one [`release`].
///
/// [`iterator_next`]: RegistryBackend::iterator_next
/// [`retain`]: RegistryBackend::retain
/// [`release`]: RegistryBackend::release
pub trait RegistryBackend: Send + Sync + 'static {
    /// Open a notification port, or `None` if the service is unavailable.
    fn open_notification_port(&self) -> Option<PortHandle>;

    /// Register a matching query on a port.
    ///
    /// `event_name` is one of [`MATCHED_EVENT`] / [`TERMINATED_EVENT`].
    /// On success returns the query's iterator; on failure returns the
    /// platform status code. Entries already matching at registration time
    /// are queued on the iterator but produce no callback — the caller is
    /// expected to drain once immediately.
    fn add_notification(
        &self,
        port: PortHandle,
        event_name: &str,
        query: &MatchingQuery,
        callback: RawCallback,
        context: u64,
    ) -> Result<IterToken, i32>;

    /// Pull the next pending handle, or `None` when the iterator is
    /// exhausted or already released.
    fn iterator_next(&self, iterator: IterToken) -> Option<RawHandle>;

    /// Release a registration and any handles still pending on it.
    fn release_iterator(&self, iterator: IterToken);

    /// Destroy a port. Registrations still attached to it are dropped.
    fn destroy_port(&self, port: PortHandle);

    /// Add one reference to a handle.
    fn retain(&self, handle: RawHandle);

    /// Drop one reference from a handle.
    fn release(&self, handle: RawHandle);

    /// Best-effort stable identifier for a registry entry.
    fn registry_entry_id(&self, handle: RawHandle) -> Option<u64>;
}
