// src/lifecycle.rs

//! Lifecycle manager
//!
//! Owns orderly teardown: registered resources are cleaned up in phased
//! order (stop accepting work, drain, release locks and connections,
//! flush the log, exit). Exactly one manager per process may be active,
//! because it is the only component allowed to install signal handlers.
//! A second signal during shutdown exits immediately with `128 + signo`.

use crate::error::{Error, Result};
use crate::events::EventBus;
use serde_json::json;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Shutdown phases, executed in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Accept no new work
    Stopping,
    /// Drain running operations
    Completing,
    /// Release locks, close connections
    Releasing,
    /// Flush the project log
    Flushing,
    /// Process exit
    Exiting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stopping => "stopping",
            Phase::Completing => "completing",
            Phase::Releasing => "releasing",
            Phase::Flushing => "flushing",
            Phase::Exiting => "exiting",
        }
    }

    fn all() -> [Phase; 5] {
        [
            Phase::Stopping,
            Phase::Completing,
            Phase::Releasing,
            Phase::Flushing,
            Phase::Exiting,
        ]
    }

    /// Per-phase time budget. Overruns are reported, not preempted: the
    /// engine is cooperative and a cleanup cannot be cancelled mid-flight.
    fn timeout(&self) -> Duration {
        match self {
            Phase::Stopping => Duration::from_secs(1),
            Phase::Completing => Duration::from_secs(30),
            Phase::Releasing => Duration::from_secs(10),
            Phase::Flushing => Duration::from_secs(5),
            Phase::Exiting => Duration::from_secs(1),
        }
    }
}

/// Manager state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

type Cleanup = Box<dyn FnOnce() -> Result<()> + Send>;

struct Resource {
    name: String,
    phase: Phase,
    priority: i32,
    cleanup: Cleanup,
}

/// Per-phase outcome of a shutdown pass
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    pub duration: Duration,
    pub timed_out: bool,
    pub errors: Vec<String>,
}

/// The lifecycle manager
pub struct LifecycleManager {
    bus: EventBus,
    state: Mutex<LifecycleState>,
    resources: Mutex<Vec<Resource>>,
    shutdown_requested: Arc<AtomicBool>,
}

impl LifecycleManager {
    /// Create the process's lifecycle manager. Fails if one is already
    /// active.
    pub fn new(bus: EventBus) -> Result<Arc<Self>> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(Error::LifecycleActive);
        }
        Ok(Arc::new(Self {
            bus,
            state: Mutex::new(LifecycleState::Idle),
            resources: Mutex::new(Vec::new()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap() = state;
    }

    /// Mark startup complete; work may begin
    pub fn start(&self) {
        self.set_state(LifecycleState::Starting);
        debug!("Lifecycle starting");
        self.set_state(LifecycleState::Running);
    }

    /// Whether a signal asked us to stop accepting work
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Register a cleanup under a phase. Lower priority runs first.
    pub fn register<F>(&self, name: &str, phase: Phase, priority: i32, cleanup: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.resources.lock().unwrap().push(Resource {
            name: name.to_string(),
            phase,
            priority,
            cleanup: Box::new(cleanup),
        });
    }

    /// Install SIGINT/SIGTERM/SIGHUP handling on a watcher thread. The
    /// first signal requests shutdown; a second one exits immediately
    /// with `128 + signo`.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
            .map_err(Error::Io)?;
        let requested = Arc::clone(&self.shutdown_requested);
        let bus = self.bus.clone();

        std::thread::Builder::new()
            .name("noorm-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if requested.swap(true, Ordering::SeqCst) {
                        // Second signal: no more draining
                        eprintln!("noorm: forced exit on repeated signal");
                        std::process::exit(128 + signal);
                    }
                    warn!("Received signal {}, shutting down", signal);
                    bus.warn(
                        "app:shutdown:signal",
                        format!("signal {} received", signal),
                        Some(json!({ "signal": signal })),
                    );
                }
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    /// Run all shutdown phases in order. Resource errors are surfaced in
    /// the report and the log but never abort remaining cleanup.
    pub fn shutdown(&self) -> Vec<PhaseReport> {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, LifecycleState::ShuttingDown | LifecycleState::Stopped) {
                return Vec::new();
            }
            *state = LifecycleState::ShuttingDown;
        }
        info!("Shutting down");

        let mut resources: Vec<Resource> = self.resources.lock().unwrap().drain(..).collect();
        resources.sort_by_key(|r| (r.phase, r.priority));

        let mut reports = Vec::new();
        for phase in Phase::all() {
            let started = Instant::now();
            let mut errors = Vec::new();

            self.bus.info(
                "app:shutdown:phase",
                format!("phase {}", phase.as_str()),
                Some(json!({ "phase": phase.as_str() })),
            );

            let in_phase: Vec<Resource> = {
                let mut kept = Vec::new();
                let mut rest = Vec::new();
                for resource in resources.drain(..) {
                    if resource.phase == phase {
                        kept.push(resource);
                    } else {
                        rest.push(resource);
                    }
                }
                resources = rest;
                kept
            };

            for resource in in_phase {
                debug!("Cleanup '{}' in phase {}", resource.name, phase.as_str());
                if let Err(err) = (resource.cleanup)() {
                    error!("Cleanup '{}' failed: {}", resource.name, err);
                    errors.push(format!("{}: {}", resource.name, err));
                }
            }

            let duration = started.elapsed();
            let timed_out = duration > phase.timeout();
            if timed_out {
                warn!(
                    "Phase {} overran its {}s budget",
                    phase.as_str(),
                    phase.timeout().as_secs()
                );
            }
            reports.push(PhaseReport {
                phase,
                duration,
                timed_out,
                errors,
            });
        }

        self.set_state(LifecycleState::Stopped);
        reports
    }

    /// Fatal-error path: minimal cleanup, then the caller exits 1.
    pub fn fail(&self, message: &str) -> Vec<PhaseReport> {
        error!("Fatal: {}", message);
        self.bus.error(
            "error",
            message.to_string(),
            Some(json!({ "fatal": true })),
        );
        let reports = self.shutdown();
        self.set_state(LifecycleState::Failed);
        reports
    }

    /// Release the process-wide slot. Tests only.
    #[doc(hidden)]
    pub fn reset_for_tests() {
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // The ACTIVE guard is process-global, so lifecycle tests share one
    // lock to avoid clashing when the harness runs them in parallel.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_single_active_manager() {
        let _guard = TEST_LOCK.lock().unwrap();
        let first = LifecycleManager::new(EventBus::new()).unwrap();
        assert!(matches!(
            LifecycleManager::new(EventBus::new()),
            Err(Error::LifecycleActive)
        ));
        drop(first);
        let second = LifecycleManager::new(EventBus::new()).unwrap();
        drop(second);
    }

    #[test]
    fn test_phases_run_in_order_with_priorities() {
        let _guard = TEST_LOCK.lock().unwrap();
        let manager = LifecycleManager::new(EventBus::new()).unwrap();
        manager.start();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, phase, priority) in [
            ("flush-log", Phase::Flushing, 0),
            ("close-db", Phase::Releasing, 10),
            ("release-lock", Phase::Releasing, 0),
            ("drain", Phase::Completing, 0),
        ] {
            let order = Arc::clone(&order);
            manager.register(name, phase, priority, move || {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        let reports = manager.shutdown();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["drain", "release-lock", "close-db", "flush-log"]
        );
        assert_eq!(reports.len(), 5);
        assert_eq!(manager.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_cleanup_errors_do_not_abort_the_phase() {
        let _guard = TEST_LOCK.lock().unwrap();
        let manager = LifecycleManager::new(EventBus::new()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        manager.register("broken", Phase::Releasing, 0, || {
            Err(Error::ChangeNotFound("x".to_string()))
        });
        let ran_clone = Arc::clone(&ran);
        manager.register("after-broken", Phase::Releasing, 1, move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let reports = manager.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let releasing = reports
            .iter()
            .find(|r| r.phase == Phase::Releasing)
            .unwrap();
        assert_eq!(releasing.errors.len(), 1);
    }

    #[test]
    fn test_second_shutdown_is_noop() {
        let _guard = TEST_LOCK.lock().unwrap();
        let manager = LifecycleManager::new(EventBus::new()).unwrap();
        manager.shutdown();
        assert!(manager.shutdown().is_empty());
    }
}
