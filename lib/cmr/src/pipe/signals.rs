//! Cancellation of a running pipeline, by hand or by termination signal.

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Signals that cancel a pipeline watched through [`CancelToken::from_signals`].
pub const TERMINATION_SIGNALS: [i32; 3] = [SIGINT, SIGQUIT, SIGTERM];

/// Clonable cancellation flag polled by the supervisor loop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips on SIGINT, SIGQUIT or SIGTERM. Registering
    /// replaces the default action of those signals for the whole process.
    pub fn from_signals() -> Result<Self> {
        let token = Self::new();
        for signal in TERMINATION_SIGNALS {
            signal_hook::flag::register(signal, Arc::clone(&token.cancelled))
                .with_context(|| format!("register handler for signal {}", signal))?;
        }
        Ok(token)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
