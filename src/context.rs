//! Process-wide callback context table
//!
//! Registry callbacks are bare function pointers carrying only an opaque
//! integer context. This table maps that integer back to the live session
//! dispatcher. Entries are published on session start and removed on
//! teardown; a lookup miss means the session is already gone and the event
//! is dropped. Tokens come from a monotonic counter and are never reused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::monitor::SessionDispatcher;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static CONTEXTS: Mutex<BTreeMap<u64, Weak<SessionDispatcher>>> = Mutex::new(BTreeMap::new());

/// Publish a dispatcher, returning its context token.
pub(crate) fn publish(dispatcher: &Arc<SessionDispatcher>) -> u64 {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    CONTEXTS.lock().insert(token, Arc::downgrade(dispatcher));
    token
}

/// Remove a token. Safe to call for a token already removed.
pub(crate) fn unpublish(token: u64) {
    CONTEXTS.lock().remove(&token);
}

/// Resolve a token to its dispatcher, if the session is still alive.
pub(crate) fn resolve(token: u64) -> Option<Arc<SessionDispatcher>> {
    CONTEXTS.lock().get(&token).and_then(Weak::upgrade)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpublished_token_stops_resolving() {
        let dispatcher = Arc::new(SessionDispatcher::for_tests());
        let token = publish(&dispatcher);
        assert!(resolve(token).is_some());

        unpublish(token);
        assert!(resolve(token).is_none());
        // Double-unpublish is harmless
        unpublish(token);
    }

    #[test]
    fn dropped_dispatcher_stops_resolving() {
        let dispatcher = Arc::new(SessionDispatcher::for_tests());
        let token = publish(&dispatcher);
        drop(dispatcher);
        assert!(resolve(token).is_none());
    }

    #[test]
    fn tokens_are_never_reused() {
        let a = publish(&Arc::new(SessionDispatcher::for_tests()));
        let b = publish(&Arc::new(SessionDispatcher::for_tests()));
        assert_ne!(a, b);
        unpublish(a);
        unpublish(b);
    }
}
