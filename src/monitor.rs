//! Monitoring engine
//!
//! `DeviceMonitor` owns all session state: the notification port, the two
//! query iterators, the output channel producer, and the callback context
//! token. Registry callbacks are never handled inline — they are
//! re-dispatched as messages onto one session worker task, so a single
//! serialized context performs every drain.
//!
//! ```text
//! [RegistryBackend] --callback--> [context table] --msg--> [session worker]
//!                                                               |  drain
//!                                                               v
//!                                                    [NotificationStream]
//! ```
//!
//! Teardown is one shared procedure reached from three places: an explicit
//! `stop_monitoring`, the consumer dropping the stream, and a failure while
//! starting. Each resource is released at most once.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{notification_channel, NotificationSender, NotificationStream};
use crate::context;
use crate::criteria::{MatchingCriteria, MatchingQuery, USB_DEVICE_CLASS};
use crate::device::DeviceRef;
use crate::error::MonitorError;
use crate::registry::{
    IterToken, PortHandle, RegistryBackend, MATCHED_EVENT, TERMINATED_EVENT,
};

/// Output channel capacity; the oldest buffered notification is dropped on
/// overflow.
pub const NOTIFICATION_BUFFER: usize = 64;

/// A device transition observed by an active session
#[derive(Debug, Clone)]
pub enum Notification {
    DeviceConnected(DeviceRef),
    DeviceDisconnected(DeviceRef),
}

/// Which of the two registered queries fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Matched,
    Terminated,
}

struct DrainMsg {
    kind: EventKind,
    iterator: IterToken,
}

/// Bridge from bare registry callbacks to the session worker
pub(crate) struct SessionDispatcher {
    tx: mpsc::UnboundedSender<DrainMsg>,
}

impl SessionDispatcher {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

fn matched_callback(context_token: u64, iterator: IterToken) {
    dispatch(context_token, EventKind::Matched, iterator);
}

fn terminated_callback(context_token: u64, iterator: IterToken) {
    dispatch(context_token, EventKind::Terminated, iterator);
}

fn dispatch(context_token: u64, kind: EventKind, iterator: IterToken) {
    match context::resolve(context_token) {
        Some(dispatcher) => {
            // Send only fails when the worker already shut down; the
            // iterator's pending handles are then released by teardown.
            let _ = dispatcher.tx.send(DrainMsg { kind, iterator });
        }
        None => {
            debug!(
                context_token,
                ?iterator,
                "callback for torn-down session dropped"
            );
        }
    }
}

/// One active session's resources. Fields are cleared individually during
/// teardown so a partially-built session from a failed start unwinds
/// through the same code.
#[derive(Default)]
struct Session {
    port: Option<PortHandle>,
    match_iter: Option<IterToken>,
    term_iter: Option<IterToken>,
    producer: Option<NotificationSender>,
    context_token: Option<u64>,
    dispatcher: Option<Arc<SessionDispatcher>>,
}

/// Watches the device registry for attach/detach transitions and
/// republishes them as a typed notification stream
///
/// One monitor runs at most one session at a time; starting while a session
/// is active fails with [`MonitorError::AlreadyStarted`]. The monitor is
/// cheap to clone and all clones share the same session.
#[derive(Clone)]
pub struct DeviceMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    backend: Arc<dyn RegistryBackend>,
    session: Mutex<Option<Session>>,
}

impl DeviceMonitor {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                backend,
                session: Mutex::new(None),
            }),
        }
    }

    /// Whether a session is currently active.
    pub fn is_monitoring(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Begin observing attach/detach transitions, optionally narrowed by
    /// `criteria`. Devices already present and matching when the session
    /// starts are reported as connected.
    ///
    /// The returned stream completes after [`stop_monitoring`]; dropping it
    /// ends the session the same way. Any setup failure unwinds everything
    /// acquired so far before the error is returned.
    ///
    /// [`stop_monitoring`]: DeviceMonitor::stop_monitoring
    pub async fn start_monitoring(
        &self,
        criteria: Option<MatchingCriteria>,
    ) -> Result<NotificationStream, MonitorError> {
        // The session lock is held across the whole sequence so the
        // already-started check cannot interleave with another start.
        let mut guard = self.inner.session.lock();
        if guard.is_some() {
            warn!("start_monitoring called while a session is active");
            return Err(MonitorError::AlreadyStarted);
        }

        match MonitorInner::establish_session(&self.inner, criteria) {
            Ok((session, stream)) => {
                *guard = Some(session);
                Ok(stream)
            }
            Err(err) => {
                warn!(%err, "start_monitoring failed");
                Err(err)
            }
        }
    }

    /// End the active session. A no-op when nothing is running; never
    /// fails. The notification stream completes once its buffer drains.
    pub fn stop_monitoring(&self) {
        self.inner.teardown(false);
    }
}

impl MonitorInner {
    /// Steps 1..9 of session setup. On any failure the partially-built
    /// [`Session`] is fed through the common teardown before the error
    /// propagates, so unwind order matches stop order.
    fn establish_session(
        inner: &Arc<Self>,
        criteria: Option<MatchingCriteria>,
    ) -> Result<(Session, NotificationStream), MonitorError> {
        let mut session = Session::default();

        // 1. Output channel
        let (producer, stream) =
            notification_channel(NOTIFICATION_BUFFER).ok_or(MonitorError::InvalidContinuation)?;
        session.producer = Some(producer.clone());

        // 2. Notification port
        let Some(port) = inner.backend.open_notification_port() else {
            inner.unwind(session);
            return Err(MonitorError::NotificationPortUnavailable);
        };
        session.port = Some(port);

        // 3 + 4. Serialized worker context and its callback-reachable
        // dispatcher, published in the process-wide context table.
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(SessionDispatcher { tx: msg_tx });
        let token = context::publish(&dispatcher);
        session.dispatcher = Some(dispatcher);
        session.context_token = Some(token);

        // 5. Matching queries, narrowed by the criteria when present
        let Some(base) = MatchingQuery::for_class(USB_DEVICE_CLASS) else {
            inner.unwind(session);
            return Err(MonitorError::MatchingDictionaryUnavailable);
        };
        let query = match &criteria {
            Some(c) => base.narrowed(c),
            None => base,
        };

        // 6. Register both queries
        let match_iter = match inner.register(port, MATCHED_EVENT, &query, matched_callback, token)
        {
            Ok(iter) => iter,
            Err(err) => {
                inner.unwind(session);
                return Err(err);
            }
        };
        session.match_iter = Some(match_iter);

        let term_iter =
            match inner.register(port, TERMINATED_EVENT, &query, terminated_callback, token) {
                Ok(iter) => iter,
                Err(err) => {
                    // The matched iterator is already in the session, so the
                    // unwind releases it before the error propagates.
                    inner.unwind(session);
                    return Err(err);
                }
            };
        session.term_iter = Some(term_iter);

        // 7. Initial drain covers devices already present at registration
        // time; the platform only reports future transitions.
        drain(&inner.backend, &producer, EventKind::Matched, match_iter);
        drain(&inner.backend, &producer, EventKind::Terminated, term_iter);

        // Session worker: the single serialized context for callback work
        let worker_backend = Arc::clone(&inner.backend);
        let worker_producer = producer.clone();
        tokio::spawn(async move {
            let mut rx = msg_rx;
            while let Some(msg) = rx.recv().await {
                drain(&worker_backend, &worker_producer, msg.kind, msg.iterator);
            }
            debug!("session worker stopped");
        });

        // 8. Consumer cancellation runs the same teardown as stop
        let weak = Arc::downgrade(inner);
        producer.on_termination(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.teardown(true);
            }
        }));

        // 9. The caller stores the session, marking it active
        match &criteria {
            Some(c) => info!(
                "Monitoring started: VID={:04X} PID={:04X}",
                c.vendor_id, c.product_id
            ),
            None => info!("Monitoring started for all devices of the class"),
        }
        Ok((session, stream))
    }

    fn register(
        &self,
        port: PortHandle,
        event_name: &str,
        query: &MatchingQuery,
        callback: crate::registry::RawCallback,
        token: u64,
    ) -> Result<IterToken, MonitorError> {
        if event_name.is_empty() {
            return Err(MonitorError::InvalidNotificationName);
        }
        self.backend
            .add_notification(port, event_name, query, callback, token)
            .map_err(MonitorError::AddNotificationFailed)
    }

    /// Release whatever a failed start had acquired, in teardown order.
    fn unwind(&self, session: Session) {
        self.release_session(session);
    }

    /// Shared teardown for explicit stop, consumer cancellation, and start
    /// failure. Runs at most once per session; later calls are no-ops.
    fn teardown(&self, cancelled_by_consumer: bool) {
        let mut guard = self.session.lock();
        let Some(session) = guard.take() else {
            debug!("stop with no active session is a no-op");
            return;
        };
        if cancelled_by_consumer {
            debug!("consumer cancelled the notification stream");
        }
        self.release_session(session);
        drop(guard);
        info!("Monitoring stopped");
    }

    /// The one place session resources are released. Every step tolerates
    /// an already-cleared field.
    fn release_session(&self, mut session: Session) {
        if let Some(producer) = session.producer.take() {
            producer.close();
        }
        if let Some(iter) = session.match_iter.take() {
            self.backend.release_iterator(iter);
        }
        if let Some(iter) = session.term_iter.take() {
            self.backend.release_iterator(iter);
        }
        if let Some(port) = session.port.take() {
            self.backend.destroy_port(port);
        }
        if let Some(token) = session.context_token.take() {
            context::unpublish(token);
        }
        // Dropping the dispatcher closes the worker's message channel
        session.dispatcher.take();
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            self.release_session(session);
        }
    }
}

/// Pull every pending handle off `iterator`. Each handle arrives owned by
/// us; wrapping takes its own reference, so the drain-local release below
/// never destroys the consumer's copy. With no live producer the handle is
/// still released and simply not emitted.
fn drain(
    backend: &Arc<dyn RegistryBackend>,
    producer: &NotificationSender,
    kind: EventKind,
    iterator: IterToken,
) {
    while let Some(handle) = backend.iterator_next(iterator) {
        let notification = if producer.is_open() {
            let device = DeviceRef::new(Arc::clone(backend), handle);
            Some(match kind {
                EventKind::Matched => Notification::DeviceConnected(device),
                EventKind::Terminated => Notification::DeviceDisconnected(device),
            })
        } else {
            None
        };
        // The iterator's reference goes away as soon as the wrap (if any)
        // holds its own.
        backend.release(handle);
        if let Some(notification) = notification {
            if producer.send(notification) {
                debug!(?handle, ?kind, "notification emitted");
            }
        }
    }
}
