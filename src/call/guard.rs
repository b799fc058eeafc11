//! Hangup guard
//!
//! Engaged for exactly the duration of an active call, so mid-call
//! termination is deliberate rather than accidental. The process analog of a
//! browser before-unload warning.

use parking_lot::Mutex;
use tracing::warn;

/// Guard against accidental mid-call termination
pub trait HangupGuard: Send + Sync {
    /// Arm the guard. `hangup` asks the orchestrator for a clean hangup.
    fn engage(&self, hangup: Box<dyn Fn() + Send + Sync>);
    /// Disarm the guard. Idempotent.
    fn disengage(&self);
}

/// No-op guard for tests and embedded use
pub struct NullGuard;

impl HangupGuard for NullGuard {
    fn engage(&self, _hangup: Box<dyn Fn() + Send + Sync>) {}
    fn disengage(&self) {}
}

/// Intercepts Ctrl-C while a call is active and converts it into a clean
/// hangup instead of an abrupt exit
#[derive(Default)]
pub struct CtrlCGuard {
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HangupGuard for CtrlCGuard {
    fn engage(&self, hangup: Box<dyn Fn() + Send + Sync>) {
        let task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received mid-call; hanging up cleanly");
                hangup();
            }
        });
        if let Some(old) = self.watcher.lock().replace(task) {
            old.abort();
        }
    }

    fn disengage(&self) {
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }
}
