//! Lifecycle controller - a single shutdown flag observed by every loop.
//!
//! Signal handlers, transports and fatal errors all go through
//! [`Lifecycle::request_shutdown`]; only the first request wins, so repeated
//! signals are harmless.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Server state, in the only order it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Booting,
    Ready,
    ShuttingDown,
    Stopped,
}

/// Why the server is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS signal arrived (`SIGINT`, `SIGTERM`).
    Signal(&'static str),
    /// Orderly stop, e.g. the pipe client closed its end.
    Requested,
    /// Startup or serving failed.
    Fatal(String),
}

/// Process exit status derived from the shutdown reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    /// Numeric exit code (0 or 1).
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

impl ShutdownReason {
    /// Exit status for this reason: failure only for `Fatal`.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Fatal(_) => ExitStatus::Failure,
            Self::Signal(_) | Self::Requested => ExitStatus::Success,
        }
    }
}

/// Owns the server state and the shutdown reason.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<ServerState>,
    reason: Mutex<Option<ShutdownReason>>,
    signals_installed: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Create a controller in `Booting`.
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Booting);
        Self {
            state,
            reason: Mutex::new(None),
            signals_installed: AtomicBool::new(false),
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Move `Booting -> Ready`. No effect in any other state.
    pub fn mark_ready(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ServerState::Booting {
                *state = ServerState::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("Server ready");
        }
    }

    /// Request shutdown. Returns true only for the first request.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                tracing::debug!(?reason, "Shutdown already requested");
                return false;
            }
            match &reason {
                ShutdownReason::Fatal(error) => tracing::error!(%error, "Fatal error, shutting down"),
                other => tracing::info!(reason = ?other, "Shutdown requested"),
            }
            *slot = Some(reason);
        }
        self.state.send_if_modified(|state| {
            if matches!(state, ServerState::Booting | ServerState::Ready) {
                *state = ServerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        true
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            ServerState::ShuttingDown | ServerState::Stopped
        )
    }

    /// Shutdown reason, once requested.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx
            .wait_for(|state| matches!(state, ServerState::ShuttingDown | ServerState::Stopped))
            .await;
    }

    /// Mark the server stopped and return the exit status.
    ///
    /// Finishing without a recorded reason counts as a requested stop.
    pub fn finish(&self) -> ExitStatus {
        let reason = {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert(ShutdownReason::Requested).clone()
        };
        self.state.send_replace(ServerState::Stopped);
        let status = reason.exit_status();
        tracing::info!(?reason, exit_code = status.code(), "Server stopped");
        status
    }

    /// Spawn the process signal listeners. Only the first call installs
    /// them; later calls return false.
    pub fn install_signal_handlers(self: &Arc<Self>) -> bool {
        if self.signals_installed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::warn!("Could not listen for SIGINT");
                    return;
                }
                lifecycle.request_shutdown(ShutdownReason::Signal("SIGINT"));
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let lifecycle = Arc::clone(self);
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::spawn(async move {
                        while sigterm.recv().await.is_some() {
                            lifecycle.request_shutdown(ShutdownReason::Signal("SIGTERM"));
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Could not listen for SIGTERM"),
            }
        }

        true
    }
}
