//! The cooperative scheduler, as seen by the driver

/// Services that the blocking transfer calls need from the scheduler
///
/// The calls yield between checks of their transfer's status, and measure
/// timeouts with the millisecond clock.
pub trait Scheduler {
    /// Let the other tasks run
    fn yield_now(&self);
    /// A monotonic millisecond clock
    fn now_ms(&self) -> u64;
    /// Returns `true` if the calling task was asked to stop
    ///
    /// A blocking transfer that notices cancellation aborts, just like a
    /// timeout. The default never cancels.
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn yield_now(&self) {
        S::yield_now(self)
    }
    fn now_ms(&self) -> u64 {
        S::now_ms(self)
    }
    fn is_cancelled(&self) -> bool {
        S::is_cancelled(self)
    }
}
