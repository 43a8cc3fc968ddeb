//! Liveness probe driven by the periodic freshness timer
use ordo_consensus_core::view::SeqNo;

use crate::shared_state::SharedConsensusState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessAction {
    Nothing,
    /// We are an idle primary: propose an empty batch
    ProposeFreshnessBatch,
    /// The primary has been idle for too long
    SuspectPrimary,
}

#[derive(Debug)]
pub struct FreshnessChecker {
    stall_ticks: u32,
    last_seen_ordered: SeqNo,
    idle_ticks: u32,
}

impl FreshnessChecker {
    pub fn new(stall_ticks: u32) -> Self {
        Self {
            stall_ticks,
            last_seen_ordered: SeqNo::ZERO,
            idle_ticks: 0,
        }
    }

    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    pub fn on_tick(&mut self, state: &SharedConsensusState) -> FreshnessAction {
        if state.is_view_changing() {
            // The view change has its own timer
            self.reset(state);
            return FreshnessAction::Nothing;
        }

        if self.last_seen_ordered < state.last_ordered() {
            self.reset(state);
            return FreshnessAction::Nothing;
        }

        self.idle_ticks = self.idle_ticks.saturating_add(1);

        if state.primary() == state.our_idx() {
            FreshnessAction::ProposeFreshnessBatch
        } else if self.stall_ticks <= self.idle_ticks {
            // Give the next primary a fresh start
            self.idle_ticks = 0;
            FreshnessAction::SuspectPrimary
        } else {
            FreshnessAction::Nothing
        }
    }

    /// Start counting from scratch, e.g. after installing a view
    pub fn reset(&mut self, state: &SharedConsensusState) {
        self.last_seen_ordered = state.last_ordered();
        self.idle_ticks = 0;
    }
}
