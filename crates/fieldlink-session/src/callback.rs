//! Receive-event callback chain.
//!
//! Inbound datagrams are demultiplexed to registered subscribers through an
//! ordered, short-circuiting chain: the most recently registered subscriber
//! gets the first look at each event, and a subscriber returning
//! [`CallbackResult::Handled`] stops dispatch.
//!
//! Dispatch always iterates an immutable snapshot of the subscriber list
//! ([`arc_swap`] copy-on-write), so a subscriber may unregister itself from
//! inside its own callback, and any thread may mutate the registration,
//! without disturbing an in-flight dispatch. Registration itself is
//! serialized by a narrow lock separate from the session's exclusion
//! domain, so long-running subscriber logic never stalls connection
//! bookkeeping.

use arc_swap::ArcSwap;
use quanta::Instant;
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::command::Command;
use crate::datagram::Datagram;

// ─── Dispatch Result ─────────────────────────────────────────────────────────

/// Tri-state outcome of offering an event to a subscriber.
///
/// Two independent facets: whether the event was handled, and whether
/// dispatch should stop here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    /// Not interested; offer the event to the next subscriber.
    NotHandled,
    /// Handled, but later subscribers should still see the event.
    HandledContinue,
    /// Handled; stop dispatch.
    Handled,
}

impl CallbackResult {
    pub fn is_handled(self) -> bool {
        !matches!(self, CallbackResult::NotHandled)
    }

    pub fn stop_dispatch(self) -> bool {
        matches!(self, CallbackResult::Handled)
    }
}

// ─── Subscriber Trait ────────────────────────────────────────────────────────

/// A subscriber to receive-loop events.
///
/// Every method defaults to [`CallbackResult::NotHandled`]; implement only
/// the events you care about. `name()` identifies the subscriber in
/// diagnostics.
pub trait RecvCallback: Send + Sync {
    fn name(&self) -> &str;

    fn packet_received(&self, _datagram: &Datagram) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn peer_discovery_event(&self, _datagram: &Datagram) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn heartbeat_event(&self, _datagram: &Datagram, _received: Instant) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn command_event(&self, _command: &mut Command) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn telemetry_event(&self, _datagram: &Datagram) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn gamepad_event(&self, _datagram: &Datagram) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn empty_event(&self, _datagram: &Datagram) -> CallbackResult {
        CallbackResult::NotHandled
    }

    fn report_global_error(&self, _error: &str, _recoverable: bool) -> CallbackResult {
        CallbackResult::NotHandled
    }
}

fn same_subscriber(a: &Arc<dyn RecvCallback>, b: &Arc<dyn RecvCallback>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ─── Chain ───────────────────────────────────────────────────────────────────

/// Ordered, short-circuiting collection of [`RecvCallback`] subscribers.
pub struct CallbackChain {
    subscribers: ArcSwap<Vec<Arc<dyn RecvCallback>>>,
    // Serializes push/remove; dispatch never takes it.
    write_lock: Mutex<()>,
}

impl CallbackChain {
    pub fn new() -> Self {
        CallbackChain {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Register a subscriber at the front of the dispatch order.
    ///
    /// Idempotent: a subscriber already present is first removed, then
    /// re-inserted at the front.
    pub fn push(&self, subscriber: Arc<dyn RecvCallback>) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.subscribers.load();
        let mut next: Vec<Arc<dyn RecvCallback>> = current
            .iter()
            .filter(|existing| !same_subscriber(existing, &subscriber))
            .cloned()
            .collect();
        next.insert(0, subscriber);
        self.subscribers.store(Arc::new(next));
    }

    /// Unregister a subscriber; no-op if absent.
    pub fn remove(&self, subscriber: &Arc<dyn RecvCallback>) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.subscribers.load();
        let next: Vec<Arc<dyn RecvCallback>> = current
            .iter()
            .filter(|existing| !same_subscriber(existing, subscriber))
            .cloned()
            .collect();
        self.subscribers.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.subscribers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.load().is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn RecvCallback>>> {
        self.subscribers.load_full()
    }

    /// Offer an event to every subscriber in order. Stops at the first
    /// `Handled`; otherwise aggregates whether anyone handled it.
    fn dispatch<F>(&self, mut offer: F) -> CallbackResult
    where
        F: FnMut(&dyn RecvCallback) -> CallbackResult,
    {
        let mut handled = false;
        for subscriber in self.snapshot().iter() {
            let result = offer(subscriber.as_ref());
            handled = handled || result.is_handled();
            if result.stop_dispatch() {
                return CallbackResult::Handled;
            }
        }
        if handled {
            CallbackResult::Handled
        } else {
            CallbackResult::NotHandled
        }
    }

    pub fn packet_received(&self, datagram: &Datagram) -> CallbackResult {
        self.dispatch(|cb| cb.packet_received(datagram))
    }

    pub fn peer_discovery_event(&self, datagram: &Datagram) -> CallbackResult {
        self.dispatch(|cb| cb.peer_discovery_event(datagram))
    }

    pub fn heartbeat_event(&self, datagram: &Datagram, received: Instant) -> CallbackResult {
        self.dispatch(|cb| cb.heartbeat_event(datagram, received))
    }

    /// Command dispatch additionally logs a diagnostic naming every
    /// subscriber consulted when none of them claims the command.
    pub fn command_event(&self, command: &mut Command) -> CallbackResult {
        let chain = self.snapshot();
        let mut handled = false;
        for subscriber in chain.iter() {
            let result = subscriber.command_event(command);
            handled = handled || result.is_handled();
            if result.stop_dispatch() {
                return CallbackResult::Handled;
            }
        }

        if handled {
            CallbackResult::Handled
        } else {
            let consulted = chain
                .iter()
                .map(|cb| cb.name())
                .collect::<Vec<_>>()
                .join(",");
            trace!(
                command = %command.name(),
                callbacks = %consulted,
                "unable to process command"
            );
            CallbackResult::NotHandled
        }
    }

    pub fn telemetry_event(&self, datagram: &Datagram) -> CallbackResult {
        self.dispatch(|cb| cb.telemetry_event(datagram))
    }

    pub fn gamepad_event(&self, datagram: &Datagram) -> CallbackResult {
        self.dispatch(|cb| cb.gamepad_event(datagram))
    }

    pub fn empty_event(&self, datagram: &Datagram) -> CallbackResult {
        self.dispatch(|cb| cb.empty_event(datagram))
    }

    pub fn report_global_error(&self, error: &str, recoverable: bool) -> CallbackResult {
        self.dispatch(|cb| cb.report_global_error(error, recoverable))
    }
}

impl Default for CallbackChain {
    fn default() -> Self {
        Self::new()
    }
}
