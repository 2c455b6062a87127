use crate::state::InterruptRequest;
use crate::LoopExit;

/// Architecture hooks driven by the dispatch loop.
///
/// Chosen once when the executor is built; the loop never inspects the
/// guest architecture itself.
pub trait ArchPolicy<C> {
    /// Services pending interrupt lines (already masked for single-step).
    ///
    /// Returns `true` when program flow changed, which discards any pending
    /// block link.
    ///
    /// # Errors
    ///
    /// Returns [`LoopExit`] after latching an exception index to unwind to
    /// the top of the loop.
    fn process_interrupt(&mut self, request: InterruptRequest, cpu: &mut C)
        -> Result<bool, LoopExit>;

    /// Delivers the pending guest exception.
    ///
    /// The handler may leave the index unchanged (consumed), latch another
    /// guest exception, or latch an exit code.
    fn handle_exception(&mut self, cpu: &mut C);

    /// Called when code at `pc` has no physical mapping.
    ///
    /// A guest exception latched here is delivered on the next iteration;
    /// otherwise the loop exits with an interrupt exit code.
    fn fetch_fault(&mut self, _cpu: &mut C, _pc: u64) {}

    /// Called once on entry to the loop.
    fn exec_prologue(&mut self, _cpu: &mut C) {}

    /// Called once when the loop returns.
    fn exec_epilogue(&mut self, _cpu: &mut C) {}
}

/// Policy for targets without interrupt or exception delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoInterruptPolicy;

impl<C> ArchPolicy<C> for NoInterruptPolicy {
    fn process_interrupt(
        &mut self,
        _request: InterruptRequest,
        _cpu: &mut C,
    ) -> Result<bool, LoopExit> {
        Ok(false)
    }

    fn handle_exception(&mut self, _cpu: &mut C) {}
}
