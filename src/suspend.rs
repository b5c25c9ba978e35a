//! Two-phase suspend coordination.
//!
//! A suspend/resume cycle tears the channel's host bindings away and hands
//! them back with all peer-side state gone. Recovery runs in two ordered
//! phases: early callbacks observe the dead channel (invalidate records,
//! check identities), late callbacks rebuild the plumbing (reopen the
//! doorbell, reset receive state, replay notifications). The coordinator
//! owns the transition and counts completed cycles.

use log::info;

/// Ordered phases of a suspend/resume transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendPhase {
    /// Runs first, before any plumbing is rebuilt.
    Early,
    /// Runs second, with host services available again.
    Late,
}

type Callback<C> = Box<dyn FnMut(&mut C) + Send>;

/// Registered suspend callbacks and the cycle counter.
///
/// Callbacks run in registration order within their phase, under whatever
/// exclusion the caller of [`run`](Self::run) provides. The store runs the
/// whole transition while holding its channel lock, so no request can be
/// submitted between the phases.
pub(crate) struct SuspendCoordinator<C> {
    early: Vec<Callback<C>>,
    late: Vec<Callback<C>>,
    count: u64,
}

impl<C> SuspendCoordinator<C> {
    pub(crate) fn new() -> Self {
        Self { early: Vec::new(), late: Vec::new(), count: 0 }
    }

    /// Add a callback to one phase.
    pub(crate) fn register(
        &mut self,
        phase: SuspendPhase,
        callback: impl FnMut(&mut C) + Send + 'static,
    ) {
        match phase {
            SuspendPhase::Early => self.early.push(Box::new(callback)),
            SuspendPhase::Late => self.late.push(Box::new(callback)),
        }
    }

    /// Drive one complete transition: every early callback in order, then
    /// every late callback in order.
    pub(crate) fn run(&mut self, context: &mut C) {
        self.count += 1;
        info!("suspend cycle {} starting", self.count);
        for callback in &mut self.early {
            callback(context);
        }
        for callback in &mut self.late {
            callback(context);
        }
        crate::metrics::suspend_cycle();
        info!("suspend cycle {} complete", self.count);
    }

    /// Completed suspend/resume cycles since the channel attached.
    pub(crate) fn count(&self) -> u64 { self.count }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_run_in_registration_order() {
        let mut coordinator: SuspendCoordinator<Vec<&'static str>> = SuspendCoordinator::new();
        coordinator.register(SuspendPhase::Late, |trace| trace.push("late-a"));
        coordinator.register(SuspendPhase::Early, |trace| trace.push("early-a"));
        coordinator.register(SuspendPhase::Early, |trace| trace.push("early-b"));
        coordinator.register(SuspendPhase::Late, |trace| trace.push("late-b"));

        let mut trace = Vec::new();
        coordinator.run(&mut trace);
        assert_eq!(trace, ["early-a", "early-b", "late-a", "late-b"]);
        assert_eq!(coordinator.count(), 1);

        coordinator.run(&mut trace);
        assert_eq!(coordinator.count(), 2);
    }
}
