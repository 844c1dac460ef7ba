use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error returned when the process-wide interruption flag was raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("the operation was interrupted")]
pub struct Interrupted;

/// Process-wide cancellation token.
///
/// A clone shares the underlying flag. The engine checks the token between
/// every enqueued work item; module implementations receive it in their
/// call context and are expected to call [`check`](Interruption::check)
/// between observable side effects.
#[derive(Default, Clone, Debug)]
pub struct Interruption(Arc<AtomicBool>);

impl Interruption {
    pub fn new() -> Interruption {
        Interruption::default()
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Return `Err(Interrupted)` if the flag is raised.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}
