//! Handler registry for decoded inbound messages.
//!
//! Every message a connection decodes is handed to the currently active
//! handler set. The set is replaced wholesale by [`Dispatcher::set_handler`]:
//! installing a handler drops whatever was installed before, so there is
//! only ever one subscriber set. Callers that need fan-out should compose it
//! inside their own handler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

/// Callback invoked with each decoded message.
pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Result of delivering one message to the handler set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned `Err` or panicked.
    pub failed: usize,
}

/// Ordered set of message handlers shared by all connections.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<Vec<Handler>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` as the only active handler.
    ///
    /// This replaces the entire set rather than appending to it.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        *handlers = vec![Arc::new(handler)];
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of active handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `message` to every active handler in order.
    ///
    /// The set is snapshotted first, so a handler may call
    /// [`set_handler`](Self::set_handler) without deadlocking; the change
    /// applies from the next message. A handler that errors or panics is
    /// logged and skipped; the rest still run.
    pub fn dispatch(&self, message: &Value) -> DispatchOutcome {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut outcome = DispatchOutcome::default();
        for (position, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(e)) => {
                    log::error!("[Server] Handler {position} failed: {e:#}");
                    outcome.failed += 1;
                }
                Err(_) => {
                    log::error!("[Server] Handler {position} panicked");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_without_handlers_is_noop() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(&json!({"x": 1})), DispatchOutcome::default());
    }

    #[test]
    fn test_handler_receives_message() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.set_handler(move |msg| {
            sink.lock().unwrap().push(msg.clone());
            Ok(())
        });

        let outcome = dispatcher.dispatch(&json!({"x": 1}));
        assert_eq!(outcome, DispatchOutcome { delivered: 1, failed: 0 });
        assert_eq!(*seen.lock().unwrap(), vec![json!({"x": 1})]);
    }

    #[test]
    fn test_set_handler_replaces_previous_set() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        dispatcher.set_handler(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let s = Arc::clone(&second);
        dispatcher.set_handler(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(dispatcher.handler_count(), 1);
        dispatcher.dispatch(&json!(null));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_error_is_contained() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_handler(|_| anyhow::bail!("boom"));

        let outcome = dispatcher.dispatch(&json!({}));
        assert_eq!(outcome, DispatchOutcome { delivered: 0, failed: 1 });
        // Still usable afterwards.
        assert_eq!(dispatcher.dispatch(&json!({})).failed, 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let dispatcher = Dispatcher::new();
        dispatcher.set_handler(|_| panic!("handler blew up"));

        let outcome = dispatcher.dispatch(&json!({}));
        assert_eq!(outcome.failed, 1);
        assert_eq!(dispatcher.handler_count(), 1);
    }

    #[test]
    fn test_handler_may_replace_itself_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&dispatcher);
        let counter = Arc::clone(&calls);
        dispatcher.set_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner.clear();
            Ok(())
        });

        dispatcher.dispatch(&json!(1));
        dispatcher.dispatch(&json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(), 0);
    }
}
