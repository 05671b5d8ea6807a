use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A shared, set-once flag used to ask every task in a run to stop.
///
/// Cancellation is cooperative: tasks check the flag before each step and
/// between sleep slices. Once set, a token never resets. A new run gets a
/// fresh token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken { CancellationToken::default() }

    /// Request cancellation.
    ///
    /// Returns `true` if this call was the one which set the flag.
    pub fn cancel(&self) -> bool { !self.flag.swap(true, Ordering::SeqCst) }

    pub fn is_cancelled(&self) -> bool { self.flag.load(Ordering::SeqCst) }
}
