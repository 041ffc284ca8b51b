//! Scheduling state of the worker loop.
//!
//! Pure transitions, owned by the loop. The loop asks [`LoopState::next_action`]
//! what to do, performs it, and reports back with [`LoopState::record_tick`]
//! or [`LoopState::record_claim`].

/// What the loop should do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopAction {
    /// Try to claim a job.
    Claim,
    /// Sleep one tick interval.
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    signalled: bool,
    ticks: u32,
    max_ticks: u32,
}

impl LoopState {
    /// Starts signalled so the queue is checked once at start-up.
    pub fn new(max_ticks: u32) -> Self {
        Self {
            signalled: true,
            ticks: 0,
            max_ticks,
        }
    }

    pub fn signal(&mut self) {
        self.signalled = true;
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn next_action(&mut self) -> LoopAction {
        if self.max_ticks > 0 && self.ticks >= self.max_ticks {
            self.signalled = true;
        }
        if self.signalled {
            self.ticks = 0;
            LoopAction::Claim
        } else {
            LoopAction::Tick
        }
    }

    pub fn record_tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
    }

    /// A found job keeps the loop signalled; an empty queue clears it.
    pub fn record_claim(&mut self, found: bool) {
        if !found {
            self.signalled = false;
        }
    }
}
