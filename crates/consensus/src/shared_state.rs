//! State every service reads and only the replica mutates
//!
//! Services get `&SharedConsensusState` through their [`crate::ctx::Ctx`];
//! the mutating methods are crate-private and called by
//! [`crate::replica::ReplicaService`] alone, which makes it the single
//! mutation gateway. Each mutation checks the monotonicity it relies on and
//! reports a violation as a [`FatalError`].
use std::collections::BTreeMap;

use ordo_consensus_core::cert::CheckpointCertificate;
use ordo_consensus_core::digest::{BatchDigest, CheckpointDigest};
use ordo_consensus_core::num_peers::NumPeers;
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::validator_set::ValidatorSet;
use ordo_consensus_core::view::{InstanceId, SeqNo, ViewNo};
use serde::Serialize;
use snafu::ensure;

use crate::error::{
    CheckpointDivergedSnafu, FatalResult, OrderingGapSnafu, ReaffirmationMismatchSnafu,
    StableCheckpointRegressedSnafu, ViewDecreasedSnafu,
};

#[derive(Debug, Clone)]
pub struct ReplicaIdentity {
    pub instance_id: InstanceId,
    /// Human readable name, for logs only
    pub node_name: String,
    pub validators: ValidatorSet,
    pub our_idx: PeerIdx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    /// Extended the ordered log
    Appended,
    /// Same batch as already ordered at this seq, committed again in a later view
    Reaffirmed,
}

/// Point-in-time copy of the replica state, for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusStateSnapshot {
    pub node_name: String,
    pub our_idx: PeerIdx,
    pub view: ViewNo,
    pub primary: PeerIdx,
    pub view_change_target: Option<ViewNo>,
    pub last_ordered: SeqNo,
    pub stable_checkpoint: SeqNo,
    pub stashed: usize,
    pub halted: bool,
}

#[derive(Debug)]
pub struct SharedConsensusState {
    identity: ReplicaIdentity,
    log_size: u64,

    view: ViewNo,
    primary: PeerIdx,
    view_change_target: Option<ViewNo>,

    last_ordered: SeqNo,
    /// Batches ordered above the stable checkpoint
    ordered: BTreeMap<SeqNo, BatchDigest>,

    /// `None` until the first checkpoint past genesis stabilizes
    stable_checkpoint: Option<CheckpointCertificate>,
    /// Own checkpoints above the stable one
    checkpoints: BTreeMap<SeqNo, CheckpointDigest>,
}

impl SharedConsensusState {
    pub(crate) fn new(identity: ReplicaIdentity, log_size: u64) -> Self {
        let primary = identity.validators.primary_for(ViewNo::ZERO);
        Self {
            identity,
            log_size,
            view: ViewNo::ZERO,
            primary,
            view_change_target: None,
            last_ordered: SeqNo::ZERO,
            ordered: BTreeMap::new(),
            stable_checkpoint: None,
            checkpoints: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &ReplicaIdentity {
        &self.identity
    }

    pub fn instance_id(&self) -> InstanceId {
        self.identity.instance_id
    }

    pub fn node_name(&self) -> &str {
        &self.identity.node_name
    }

    pub fn our_idx(&self) -> PeerIdx {
        self.identity.our_idx
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.identity.validators
    }

    pub fn num_peers(&self) -> NumPeers {
        self.identity.validators.num_peers()
    }

    pub fn view(&self) -> ViewNo {
        self.view
    }

    pub fn primary(&self) -> PeerIdx {
        self.primary
    }

    pub fn primary_for(&self, view: ViewNo) -> PeerIdx {
        self.identity.validators.primary_for(view)
    }

    /// Are we the primary of the current view, and is it operating
    pub fn is_acting_primary(&self) -> bool {
        self.primary == self.identity.our_idx && self.view_change_target.is_none()
    }

    pub fn view_change_target(&self) -> Option<ViewNo> {
        self.view_change_target
    }

    pub fn is_view_changing(&self) -> bool {
        self.view_change_target.is_some()
    }

    pub fn last_ordered(&self) -> SeqNo {
        self.last_ordered
    }

    pub fn ordered_digest(&self, seq: SeqNo) -> Option<BatchDigest> {
        self.ordered.get(&seq).copied()
    }

    pub fn stable_checkpoint(&self) -> Option<&CheckpointCertificate> {
        self.stable_checkpoint.as_ref()
    }

    pub fn stable_seq(&self) -> SeqNo {
        self.stable_checkpoint
            .as_ref()
            .map(|cert| cert.seq_end)
            .unwrap_or(SeqNo::ZERO)
    }

    pub fn own_checkpoint(&self, seq: SeqNo) -> Option<CheckpointDigest> {
        self.checkpoints.get(&seq).copied()
    }

    /// Lowest seq (exclusive) three-phase messages are accepted for
    pub fn low_watermark(&self) -> SeqNo {
        self.stable_seq()
    }

    /// Highest seq (inclusive) three-phase messages are accepted for
    pub fn high_watermark(&self) -> SeqNo {
        self.stable_seq().saturating_add(self.log_size)
    }

    pub fn is_within_watermarks(&self, seq: SeqNo) -> bool {
        self.low_watermark() < seq && seq <= self.high_watermark()
    }

    pub(crate) fn begin_view_change(&mut self, target: ViewNo) {
        debug_assert!(self.view < target);
        self.view_change_target = Some(target);
    }

    pub(crate) fn install_view(&mut self, view: ViewNo) -> FatalResult<()> {
        ensure!(
            self.view <= view,
            ViewDecreasedSnafu {
                current: self.view,
                new: view,
            }
        );
        self.view = view;
        self.primary = self.primary_for(view);
        if self.view_change_target.is_some_and(|target| target <= view) {
            self.view_change_target = None;
        }
        Ok(())
    }

    pub(crate) fn record_ordered(
        &mut self,
        seq: SeqNo,
        digest: BatchDigest,
    ) -> FatalResult<OrderOutcome> {
        if seq <= self.last_ordered {
            match self.ordered.get(&seq) {
                Some(original) => {
                    ensure!(
                        *original == digest,
                        ReaffirmationMismatchSnafu {
                            seq,
                            original: *original,
                            new: digest,
                        }
                    );
                }
                // Below the stable checkpoint; the certificate vouches for it
                None => debug_assert!(seq <= self.stable_seq()),
            }
            return Ok(OrderOutcome::Reaffirmed);
        }

        ensure!(
            Some(seq) == self.last_ordered.next(),
            OrderingGapSnafu {
                last_ordered: self.last_ordered,
                seq,
            }
        );
        self.last_ordered = seq;
        self.ordered.insert(seq, digest);
        Ok(OrderOutcome::Appended)
    }

    pub(crate) fn record_checkpoint(&mut self, seq: SeqNo, digest: CheckpointDigest) {
        self.checkpoints.insert(seq, digest);
    }

    /// Make `cert` the stable checkpoint
    ///
    /// Returns `false` if it is not above the current one.
    pub(crate) fn record_stable_checkpoint(
        &mut self,
        cert: CheckpointCertificate,
    ) -> FatalResult<bool> {
        let current = self.stable_seq();
        ensure!(
            current <= cert.seq_end,
            StableCheckpointRegressedSnafu {
                current,
                new: cert.seq_end,
            }
        );
        if cert.seq_end == current {
            return Ok(false);
        }

        if let Some(own) = self.checkpoints.get(&cert.seq_end) {
            ensure!(
                *own == cert.digest,
                CheckpointDivergedSnafu {
                    seq: cert.seq_end,
                    own: *own,
                    quorum: cert.digest,
                }
            );
        }

        let seq = cert.seq_end;
        self.stable_checkpoint = Some(cert);
        self.checkpoints.retain(|s, _| seq < *s);
        self.ordered.retain(|s, _| seq < *s);
        if self.last_ordered < seq {
            // Only through state transfer
            self.last_ordered = seq;
        }
        Ok(true)
    }

    pub(crate) fn snapshot(&self, stashed: usize, halted: bool) -> ConsensusStateSnapshot {
        ConsensusStateSnapshot {
            node_name: self.identity.node_name.clone(),
            our_idx: self.identity.our_idx,
            view: self.view,
            primary: self.primary,
            view_change_target: self.view_change_target,
            last_ordered: self.last_ordered,
            stable_checkpoint: self.stable_seq(),
            stashed,
            halted,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests;
