//! Bounded notification channel with drop-oldest overflow
//!
//! The producer side is held by the monitoring engine, the consumer side is
//! the stream handed back from `start_monitoring`. The buffer is bounded;
//! when it is full the oldest buffered notification is evicted so a slow
//! consumer never stalls the engine and the buffer never grows without
//! bound. Dropping the stream fires a termination hook exactly once, which
//! the engine uses to run the same teardown as an explicit stop.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::Stream;
use parking_lot::Mutex;
use tracing::debug;

use crate::monitor::Notification;

/// Hook fired when the consumer cancels its iteration
pub(crate) type TerminationHook = Box<dyn FnOnce() + Send>;

struct Shared {
    state: Mutex<ChannelState>,
}

struct ChannelState {
    buffer: VecDeque<Notification>,
    capacity: usize,
    /// Producer signalled end-of-stream; buffered items still drain.
    closed: bool,
    /// Consumer dropped the stream.
    receiver_gone: bool,
    waker: Option<Waker>,
    on_termination: Option<TerminationHook>,
    dropped_oldest: u64,
}

/// Create a bounded channel pair. `None` if the capacity is zero — a
/// zero-capacity buffer cannot hold a notification long enough to deliver.
pub(crate) fn notification_channel(
    capacity: usize,
) -> Option<(NotificationSender, NotificationStream)> {
    if capacity == 0 {
        return None;
    }
    let shared = Arc::new(Shared {
        state: Mutex::new(ChannelState {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            receiver_gone: false,
            waker: None,
            on_termination: None,
            dropped_oldest: 0,
        }),
    });
    let sender = NotificationSender {
        shared: Arc::clone(&shared),
    };
    let stream = NotificationStream { shared };
    Some((sender, stream))
}

/// Producer half, cheap to clone
#[derive(Clone)]
pub(crate) struct NotificationSender {
    shared: Arc<Shared>,
}

impl NotificationSender {
    /// Push one notification, evicting the oldest buffered item when full.
    /// Returns `false` if the stream is closed or the consumer is gone.
    pub(crate) fn send(&self, item: Notification) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed || state.receiver_gone {
            return false;
        }
        if state.buffer.len() == state.capacity {
            state.buffer.pop_front();
            state.dropped_oldest += 1;
            debug!(
                total_dropped = state.dropped_oldest,
                "notification buffer full, dropped oldest"
            );
        }
        state.buffer.push_back(item);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    /// Whether the consumer can still observe notifications.
    pub(crate) fn is_open(&self) -> bool {
        let state = self.shared.state.lock();
        !state.closed && !state.receiver_gone
    }

    /// Signal end-of-stream. Buffered notifications still drain; the stream
    /// then yields `None`.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Register the hook fired when the consumer drops the stream. Fires
    /// immediately if the consumer is already gone.
    pub(crate) fn on_termination(&self, hook: TerminationHook) {
        {
            let mut state = self.shared.state.lock();
            if !state.receiver_gone {
                state.on_termination = Some(hook);
                return;
            }
        }
        // Consumer already gone; fire outside the lock.
        hook();
    }
}

/// Consumer half: an async pull-based sequence of notifications
///
/// Yields `None` once the engine has stopped and the buffer is drained.
/// Dropping the stream cancels the session.
pub struct NotificationStream {
    shared: Arc<Shared>,
}

impl Stream for NotificationStream {
    type Item = Notification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        let mut state = self.shared.state.lock();
        if let Some(item) = state.buffer.pop_front() {
            return Poll::Ready(Some(item));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl fmt::Debug for NotificationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("NotificationStream")
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        let hook = {
            let mut state = self.shared.state.lock();
            state.receiver_gone = true;
            state.buffer.clear();
            state.on_termination.take()
        };
        // Invoked outside the lock: the hook tears the session down and
        // closes this very channel.
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::criteria::DeviceProperties;
    use crate::device::DeviceRef;
    use crate::sim::SimulatedRegistry;

    fn connected(sim: &Arc<SimulatedRegistry>) -> Notification {
        let handle = sim.attach_device(DeviceProperties::default());
        Notification::DeviceConnected(DeviceRef::new(sim.clone(), handle))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(notification_channel(0).is_none());
    }

    // unwrap_err on Result<NotificationStream, _> needs the stream to be
    // Debug, so tests can assert on failed starts.
    #[test]
    fn stream_is_debug() {
        let (_tx, stream) = notification_channel(4).unwrap();
        let result: Result<NotificationStream, i32> = Err(-1);
        assert_eq!(result.unwrap_err(), -1);
        assert!(format!("{stream:?}").contains("NotificationStream"));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let sim = Arc::new(SimulatedRegistry::new());
        let (tx, mut stream) = notification_channel(2).unwrap();

        let first = connected(&sim);
        let first_handle = match &first {
            Notification::DeviceConnected(d) => d.raw_handle(),
            Notification::DeviceDisconnected(d) => d.raw_handle(),
        };
        assert!(tx.send(first));
        assert!(tx.send(connected(&sim)));
        assert!(tx.send(connected(&sim))); // evicts the first
        tx.close();

        let mut seen = Vec::new();
        while let Some(n) = stream.next().await {
            let Notification::DeviceConnected(d) = n else {
                panic!("unexpected disconnect");
            };
            seen.push(d.raw_handle());
        }
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&first_handle));
    }

    #[tokio::test]
    async fn close_drains_buffer_then_ends() {
        let sim = Arc::new(SimulatedRegistry::new());
        let (tx, mut stream) = notification_channel(4).unwrap();
        assert!(tx.send(connected(&sim)));
        tx.close();
        assert!(!tx.send(connected(&sim)));

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn termination_hook_fires_once_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, stream) = notification_channel(4).unwrap();
        let counter = Arc::clone(&fired);
        tx.on_termination(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        drop(stream);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!tx.is_open());
    }

    #[test]
    fn late_hook_fires_immediately_when_receiver_gone() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, stream) = notification_channel(4).unwrap();
        drop(stream);

        let counter = Arc::clone(&fired);
        tx.on_termination(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
