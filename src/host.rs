//! Lifecycle entry points for the embedding application.
//!
//! `ServerHost` ties a [`Server`] to a [`SettingsSource`] and exposes the
//! small, synchronous surface a host's command layer needs: start, stop,
//! a running query, and the predicates that decide whether the start and
//! stop commands are currently enabled.
//!
//! Misuse never panics or propagates: starting a running server or stopping
//! a stopped one is logged and reported as `false`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gulp_server::{Server, ServerHost, Settings};
//!
//! let host = ServerHost::new(Arc::new(Server::new()), Arc::new(Settings::default()));
//! host.server().set_handler(|msg| {
//!     log::info!("received {msg}");
//!     Ok(())
//! });
//! host.on_load(); // starts after the configured delay
//! // ...
//! host.on_unload();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::DEFAULT_START_DELAY;
use crate::server::{LifecycleError, Server};
use crate::settings::{ServerAddr, SettingsSource, START_DELAY_KEY};

/// Host-facing lifecycle handle around a [`Server`].
pub struct ServerHost {
    server: Arc<Server>,
    settings: Arc<dyn SettingsSource>,
    /// Set while a delayed start is waiting to fire.
    start_scheduled: Arc<AtomicBool>,
    scheduled: Mutex<Option<ScheduledStart>>,
}

/// A delayed start waiting on the `gulp-start` thread.
struct ScheduledStart {
    handle: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for ServerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHost")
            .field("server", &self.server)
            .field("start_scheduled", &self.start_scheduled.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ServerHost {
    /// Create a host handle. Nothing starts until asked.
    pub fn new(server: Arc<Server>, settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            server,
            settings,
            start_scheduled: Arc::new(AtomicBool::new(false)),
            scheduled: Mutex::new(None),
        }
    }

    /// The managed server.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Address the server will bind, as currently configured.
    pub fn configured_addr(&self) -> ServerAddr {
        ServerAddr::from_settings(self.settings.as_ref())
    }

    /// Start the server on the configured address.
    ///
    /// Returns `false` if it was already running or could not bind.
    pub fn start(&self) -> bool {
        start_server(&self.server, &self.configured_addr())
    }

    /// Stop the server. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.server.stop() {
            Ok(()) => true,
            Err(LifecycleError::NotRunning) => false,
            Err(e) => {
                log::error!("[Server] Stop failed: {e}");
                false
            }
        }
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    /// Whether a start command makes sense right now.
    pub fn can_start(&self) -> bool {
        self.server.state().can_start() && !self.start_scheduled.load(Ordering::Acquire)
    }

    /// Whether a stop command makes sense right now.
    pub fn can_stop(&self) -> bool {
        self.server.state().can_stop()
    }

    /// Start the server after `delay` on a background thread.
    ///
    /// Returns `false` (and schedules nothing) if a start is already
    /// scheduled.
    pub fn schedule_start(&self, delay: Duration) -> bool {
        if self.start_scheduled.swap(true, Ordering::AcqRel) {
            log::debug!("[Server] Start already scheduled");
            return false;
        }

        let server = Arc::clone(&self.server);
        let addr = self.configured_addr();
        let flag = Arc::clone(&self.start_scheduled);
        let cancelled = Arc::new(AtomicBool::new(false));
        let spawned = {
            let cancelled = Arc::clone(&cancelled);
            thread::Builder::new()
                .name("gulp-start".to_string())
                .spawn(move || {
                    let deadline = Instant::now() + delay;
                    loop {
                        if cancelled.load(Ordering::Acquire) {
                            log::debug!("[Server] Scheduled start cancelled");
                            break;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            start_server(&server, &addr);
                            break;
                        }
                        thread::park_timeout(deadline - now);
                    }
                    flag.store(false, Ordering::Release);
                })
        };

        match spawned {
            Ok(handle) => {
                *self.scheduled.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(ScheduledStart { handle, cancelled });
                true
            }
            Err(e) => {
                log::error!("[Server] Failed to schedule start: {e}");
                self.start_scheduled.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Block until a scheduled start (if any) has run.
    pub fn wait_for_scheduled_start(&self) {
        let scheduled = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduled) = scheduled {
            join_scheduled(scheduled);
        }
    }

    /// Cancel a scheduled start that has not fired yet.
    ///
    /// Returns once the `gulp-start` thread has exited. Returns `false` if
    /// nothing was scheduled.
    pub fn cancel_scheduled_start(&self) -> bool {
        let scheduled = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(scheduled) = scheduled else {
            return false;
        };
        scheduled.cancelled.store(true, Ordering::Release);
        scheduled.handle.thread().unpark();
        join_scheduled(scheduled);
        true
    }

    /// Host finished loading: start after the configured delay.
    pub fn on_load(&self) {
        let delay = self
            .settings
            .get_u64(START_DELAY_KEY)
            .map_or(DEFAULT_START_DELAY, Duration::from_millis);
        self.schedule_start(delay);
    }

    /// Host is unloading: cancel any pending start, then stop.
    pub fn on_unload(&self) {
        self.cancel_scheduled_start();
        self.stop();
    }
}

fn join_scheduled(scheduled: ScheduledStart) {
    if scheduled.handle.join().is_err() {
        log::error!("[Server] Scheduled start panicked");
    }
}

fn start_server(server: &Server, addr: &ServerAddr) -> bool {
    match server.start(addr) {
        Ok(_) => true,
        Err(LifecycleError::AlreadyRunning) => false,
        Err(e) => {
            log::error!("[Server] Start failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Settings, HOST_KEY, PORT_KEY};
    use serde_json::json;

    fn host_on_free_port() -> ServerHost {
        let mut settings = Settings::default();
        settings.set(HOST_KEY, json!("127.0.0.1"));
        settings.set(PORT_KEY, json!(0));
        settings.set(START_DELAY_KEY, json!(10));
        ServerHost::new(Arc::new(Server::new()), Arc::new(settings))
    }

    #[test]
    fn test_start_stop_and_predicates() {
        let host = host_on_free_port();
        assert!(host.can_start());
        assert!(!host.can_stop());

        assert!(host.start());
        assert!(host.is_running());
        assert!(!host.can_start());
        assert!(host.can_stop());

        assert!(host.stop());
        assert!(!host.is_running());
        assert!(host.can_start());
    }

    #[test]
    fn test_misuse_returns_false() {
        let host = host_on_free_port();
        assert!(!host.stop());
        assert!(host.start());
        assert!(!host.start());
        assert!(host.stop());
        assert!(!host.stop());
    }

    #[test]
    fn test_on_load_starts_after_delay() {
        let host = host_on_free_port();
        host.on_load();
        assert!(!host.can_start(), "start is pending");
        assert!(!host.schedule_start(Duration::ZERO), "only one pending start");

        host.wait_for_scheduled_start();
        assert!(host.is_running());

        host.on_unload();
        assert!(!host.is_running());
        assert!(host.can_start());
    }

    #[test]
    fn test_unload_cancels_pending_start() {
        let mut settings = Settings::default();
        settings.set(HOST_KEY, json!("127.0.0.1"));
        settings.set(PORT_KEY, json!(0));
        settings.set(START_DELAY_KEY, json!(60_000));
        let host = ServerHost::new(Arc::new(Server::new()), Arc::new(settings));

        host.on_load();
        assert!(!host.can_start());

        let began = Instant::now();
        host.on_unload();
        assert!(began.elapsed() < Duration::from_secs(5), "unload waited out the delay");
        assert!(!host.is_running());
        assert!(host.can_start());
        assert!(!host.cancel_scheduled_start(), "nothing left to cancel");

        // A fresh schedule still works after a cancel.
        assert!(host.schedule_start(Duration::ZERO));
        host.wait_for_scheduled_start();
        assert!(host.is_running());
        assert!(host.stop());
    }

    #[test]
    fn test_start_failure_on_bad_host() {
        let mut settings = Settings::default();
        settings.set(HOST_KEY, json!("host.invalid"));
        settings.set(PORT_KEY, json!(0));
        let host = ServerHost::new(Arc::new(Server::new()), Arc::new(settings));
        assert!(!host.start());
        assert!(host.can_start());
    }
}
