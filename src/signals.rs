/// Signal handling for graceful shutdown.
///
/// First Ctrl-C: set the shutdown flag. `replay` stops before its next line
/// and `follow` drains what is already written; either way the pipeline then
/// detaches and exits. Second Ctrl-C: exit immediately, for a read that is
/// stuck waiting on input. No guard runs then, but the registry it would
/// clean up goes away with the process.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exit code used when a second Ctrl-C forces an immediate exit.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Shared flag checked by long-running loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wait for Ctrl-C and trip `flag`; a second Ctrl-C exits the process.
pub async fn watch_ctrl_c(flag: ShutdownFlag) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("interrupt received, finishing current input then detaching");
    flag.trigger();

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("second interrupt, exiting immediately");
        std::process::exit(FORCED_EXIT_CODE);
    }
}
