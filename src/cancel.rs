// src/cancel.rs

//! Build cancellation
//!
//! A [`CancelToken`] is checked by the orchestrator between phases and by the
//! process runner while a child is alive. Tokens created with
//! [`CancelToken::with_signals`] also trip on SIGINT/SIGTERM.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    watch_signals: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is also cancelled by SIGINT or SIGTERM
    ///
    /// Installs process-wide handlers; the first signal requests cancellation
    /// and the build unwinds through its normal cleanup path.
    pub fn with_signals() -> std::io::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only stores to an atomic
            unsafe { sigaction(signal, &action) }.map_err(std::io::Error::from)?;
        }
        debug!("Installed SIGINT/SIGTERM cancellation handlers");
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.watch_signals && SIGNAL_RECEIVED.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_plain_token_ignores_signal_flag() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }
}
