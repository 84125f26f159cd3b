//! Inline execution for platforms without the context-switch trap.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use super::{IsolationError, IsolationOutcome};

static WARNED: AtomicBool = AtomicBool::new(false);

pub(super) fn execute(
    _stack_size: usize,
    body: &mut dyn FnMut(),
) -> Result<IsolationOutcome, IsolationError> {
    if !WARNED.swap(true, Ordering::Relaxed) {
        warn!("signal trapping is not supported on this platform, cases run inline");
    }
    body();
    Ok(IsolationOutcome::Completed)
}
