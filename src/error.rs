//! Monitor error types

use thiserror::Error;

/// Errors that can occur while starting a monitoring session
///
/// Every variant is returned synchronously from
/// [`DeviceMonitor::start_monitoring`](crate::DeviceMonitor::start_monitoring).
/// Once a session is active the notification stream only completes or is
/// cancelled; it never carries an error value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Monitoring is already started")]
    AlreadyStarted,

    #[error("Output stream producer could not be obtained")]
    InvalidContinuation,

    #[error("Notification event name is empty")]
    InvalidNotificationName,

    #[error("Device registry notification port is unavailable")]
    NotificationPortUnavailable,

    #[error("Matching dictionary could not be constructed")]
    MatchingDictionaryUnavailable,

    #[error("Adding notification failed with platform status {0}")]
    AddNotificationFailed(i32),
}
