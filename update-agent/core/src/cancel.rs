use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cooperative cancel flag scoped to one update session.
///
/// Clones share the same flag. The flag can only go from unset to set; every
/// suspendable step polls it with [`Self::is_cancelled`] and stops before issuing
/// further network reads or device commands.
#[derive(Clone, Debug, Default)]
pub struct CancellationController {
    cancelled: Arc<AtomicBool>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Returns `true` only for the call that actually set it.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
