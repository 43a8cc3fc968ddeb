use ordo_consensus_core::cert::CheckpointCertificate;
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::view::{SeqNo, ThreePhaseKey, ViewNo};

use super::ReplicaService;
use crate::config::ConsensusConfig;
use crate::error::FatalError;
use crate::ordering::BatchPhase;
use crate::shared_state::{ConsensusStateSnapshot, SharedConsensusState};

impl ReplicaService {
    pub fn state(&self) -> &SharedConsensusState {
        &self.state
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn our_idx(&self) -> PeerIdx {
        self.state.our_idx()
    }

    pub fn view(&self) -> ViewNo {
        self.state.view()
    }

    pub fn primary(&self) -> PeerIdx {
        self.state.primary()
    }

    pub fn is_primary(&self) -> bool {
        self.state.is_acting_primary()
    }

    pub fn last_ordered(&self) -> SeqNo {
        self.state.last_ordered()
    }

    pub fn stable_checkpoint(&self) -> Option<&CheckpointCertificate> {
        self.state.stable_checkpoint()
    }

    pub fn phase(&self, key: ThreePhaseKey) -> Option<BatchPhase> {
        self.services.ordering.phase(key)
    }

    pub fn stashed(&self) -> usize {
        self.stasher.len()
    }

    /// Why the replica halted, if it did
    pub fn halted(&self) -> Option<&FatalError> {
        self.halted.as_ref()
    }

    pub fn snapshot(&self) -> ConsensusStateSnapshot {
        self.state
            .snapshot(self.stasher.len(), self.halted.is_some())
    }
}
