//! Lifecycle controller: `Running -> Terminating -> Stopped`.
//!
//! The first trigger starts the graceful path; any further trigger while terminating
//! escalates straight to a forced kill.

use crate::agents::AgentId;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    Terminating = 1,
    Stopped = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Running,
            1 => LifecycleState::Terminating,
            _ => LifecycleState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// `Terminate` message addressed to the supervisor.
    Requested(AgentId),
    Signal(&'static str),
    Watchdog,
    Fatal,
}

/// What a trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    BeginGraceful,
    EscalateToKill,
    AlreadyStopped,
}

#[derive(Debug)]
struct Inner {
    state: AtomicU8,
    cause: OnceLock<TerminationCause>,
    terminate: CancellationToken,
    force: CancellationToken,
}

/// Cloneable handle; all clones share one state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(LifecycleState::Running as u8),
                cause: OnceLock::new(),
                terminate: CancellationToken::new(),
                force: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.inner.cause.get().copied()
    }

    pub fn trigger(&self, cause: TerminationCause) -> TriggerOutcome {
        match self.inner.state.compare_exchange(
            LifecycleState::Running as u8,
            LifecycleState::Terminating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let _ = self.inner.cause.set(cause);
                info!(?cause, "termination requested, starting graceful shutdown");
                self.inner.terminate.cancel();
                TriggerOutcome::BeginGraceful
            }
            Err(current) if current == LifecycleState::Terminating as u8 => {
                warn!(?cause, "second termination trigger, escalating to forced kill");
                self.inner.force.cancel();
                TriggerOutcome::EscalateToKill
            }
            Err(_) => TriggerOutcome::AlreadyStopped,
        }
    }

    pub fn mark_stopped(&self) {
        self.inner
            .state
            .store(LifecycleState::Stopped as u8, Ordering::Release);
        // Anyone still waiting on the graceful path must not block forever
        self.inner.terminate.cancel();
    }

    /// Cancelled once termination begins.
    pub fn terminate_token(&self) -> CancellationToken {
        self.inner.terminate.clone()
    }

    /// Cancelled when graceful shutdown must be skipped.
    pub fn force_token(&self) -> CancellationToken {
        self.inner.force.clone()
    }

    pub fn is_forced(&self) -> bool {
        self.inner.force.is_cancelled()
    }
}

/// Route SIGINT and SIGTERM into the lifecycle. Every signal is a trigger, so a second
/// Ctrl-C escalates.
pub fn spawn_signal_listener(lifecycle: Lifecycle) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(term) => Some(term),
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                None
            }
        };

        loop {
            #[cfg(unix)]
            let cause = tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => TerminationCause::Signal("SIGINT"),
                    Err(e) => {
                        warn!(error = %e, "cannot listen for interrupts");
                        return;
                    }
                },
                Some(()) = recv_term(&mut term) => TerminationCause::Signal("SIGTERM"),
            };
            #[cfg(not(unix))]
            let cause = match tokio::signal::ctrl_c().await {
                Ok(()) => TerminationCause::Signal("SIGINT"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for interrupts");
                    return;
                }
            };

            if lifecycle.trigger(cause) == TriggerOutcome::AlreadyStopped {
                return;
            }
        }
    })
}

#[cfg(unix)]
async fn recv_term(term: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match term {
        Some(term) => term.recv().await,
        None => std::future::pending().await,
    }
}

/// Force the shutdown path after `max_runtime` even with no explicit trigger.
pub fn spawn_watchdog(lifecycle: Lifecycle, max_runtime: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let terminate = lifecycle.terminate_token();
        tokio::select! {
            _ = tokio::time::sleep(max_runtime) => {
                warn!(?max_runtime, "maximum runtime reached");
                lifecycle.trigger(TerminationCause::Watchdog);
            }
            _ = terminate.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_trigger_begins_graceful() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_running());
        assert_eq!(
            lifecycle.trigger(TerminationCause::Requested(AgentId::Comm)),
            TriggerOutcome::BeginGraceful
        );
        assert_eq!(lifecycle.state(), LifecycleState::Terminating);
        assert!(lifecycle.terminate_token().is_cancelled());
        assert!(!lifecycle.is_forced());
    }

    #[test]
    fn test_second_trigger_escalates_and_keeps_first_cause() {
        let lifecycle = Lifecycle::new();
        lifecycle.trigger(TerminationCause::Signal("SIGINT"));
        assert_eq!(
            lifecycle.trigger(TerminationCause::Watchdog),
            TriggerOutcome::EscalateToKill
        );
        assert!(lifecycle.is_forced());
        assert_eq!(lifecycle.cause(), Some(TerminationCause::Signal("SIGINT")));
    }

    #[test]
    fn test_trigger_after_stop_is_noop() {
        let lifecycle = Lifecycle::new();
        lifecycle.trigger(TerminationCause::Fatal);
        lifecycle.mark_stopped();
        assert_eq!(
            lifecycle.trigger(TerminationCause::Fatal),
            TriggerOutcome::AlreadyStopped
        );
        assert!(!lifecycle.is_forced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires() {
        let lifecycle = Lifecycle::new();
        let handle = spawn_watchdog(lifecycle.clone(), Duration::from_secs(5));
        handle.await.unwrap();
        assert_eq!(lifecycle.cause(), Some(TerminationCause::Watchdog));
    }
}
