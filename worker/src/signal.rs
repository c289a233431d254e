use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{WorkerError, WorkerResult};

/// Latched by the process's interrupt/termination handler. Workers poll
/// this between checkouts and at the end of each in-flight task rather than
/// reacting to the signal itself, so the handler only ever touches a flag
/// it owns a clone of — no process-global mutable state, and multiple
/// `Interrupt` handles can exist side by side in tests.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Interrupt(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Install this handle as the process's SIGINT/SIGTERM handler.
    /// `ctrlc` only allows one handler to be active per process; a caller
    /// running several workers in one process should share a single
    /// `Interrupt` across them instead of installing more than once.
    pub fn install(&self) -> WorkerResult<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || flag.set()).map_err(|e| {
            WorkerError::InvalidArgument(format!("failed to install signal handler: {e}"))
        })
    }
}
