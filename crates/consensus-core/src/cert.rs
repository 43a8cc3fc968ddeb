//! Quorum certificates carried by view change votes
use std::collections::{BTreeMap, BTreeSet};

use bincode::{Decode, Encode};
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

use crate::Signature;
use crate::digest::{BatchDigest, CheckpointDigest};
use crate::msg::{Checkpoint, PrePrepare, ViewChangeVote};
use crate::peer::{PeerIdx, PeerPubkey};
use crate::signed::{InvalidSignatureError, Signable as _, Signed};
use crate::validator_set::ValidatorSet;
use crate::view::{InstanceId, SeqNo, ThreePhaseKey};

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum InvalidCertificateError {
    #[snafu(display("Certificate for instance {received}, expected {expected}"))]
    WrongInstance {
        expected: InstanceId,
        received: InstanceId,
    },
    #[snafu(display("Unknown peer {peer_idx}"))]
    UnknownPeer { peer_idx: PeerIdx },
    #[snafu(display("Invalid signature of peer {peer_idx}"))]
    InvalidPeerSignature {
        peer_idx: PeerIdx,
        source: InvalidSignatureError,
    },
    #[snafu(display("Not enough signatures: {got} < {needed}"))]
    NotEnoughSignatures { got: usize, needed: usize },
    PrePrepareDigestMismatch,
    #[snafu(display("Prepare from the primary {peer_idx}"))]
    PrepareFromPrimary { peer_idx: PeerIdx },
    #[snafu(display("Checkpoint of peer {peer_idx} does not match"))]
    CheckpointMismatch { peer_idx: PeerIdx },
    #[snafu(display("Certificate for {key} not above the stable checkpoint"))]
    BelowStableCheckpoint { key: ThreePhaseKey },
    #[snafu(display("Certificate for {key} not from a view before the target view"))]
    NotBeforeTargetView { key: ThreePhaseKey },
    #[snafu(display("More than one certificate for seq {seq}"))]
    DuplicateSeq { seq: SeqNo },
}

pub type InvalidCertificateResult<T> = Result<T, InvalidCertificateError>;

fn peer_pubkey(validators: &ValidatorSet, peer_idx: PeerIdx) -> InvalidCertificateResult<PeerPubkey> {
    validators.get(peer_idx).context(UnknownPeerSnafu { peer_idx })
}

/// Proof that a key reached *prepared*: the primary's PrePrepare and a quorum
/// of matching Prepares from distinct backups
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PreparedCertificate {
    pub pre_prepare: Signed<PrePrepare>,
    pub prepares: BTreeMap<PeerIdx, Signature>,
}

impl PreparedCertificate {
    pub fn key(&self) -> ThreePhaseKey {
        self.pre_prepare.key
    }

    pub fn digest(&self) -> BatchDigest {
        self.pre_prepare.digest
    }

    pub fn verify(
        &self,
        inst_id: InstanceId,
        validators: &ValidatorSet,
    ) -> InvalidCertificateResult<()> {
        let key = self.key();
        ensure!(
            self.pre_prepare.inst_id == inst_id,
            WrongInstanceSnafu {
                expected: inst_id,
                received: self.pre_prepare.inst_id,
            }
        );
        ensure!(
            self.pre_prepare.has_valid_digest(),
            PrePrepareDigestMismatchSnafu
        );

        let primary = validators.primary_for(key.view);
        self.pre_prepare
            .verify_sig(peer_pubkey(validators, primary)?)
            .context(InvalidPeerSignatureSnafu { peer_idx: primary })?;

        let needed = validators.num_peers().prepare_quorum();
        ensure!(
            needed <= self.prepares.len(),
            NotEnoughSignaturesSnafu {
                got: self.prepares.len(),
                needed,
            }
        );

        let prepare = self.pre_prepare.to_prepare();
        for (peer_idx, sig) in &self.prepares {
            let peer_idx = *peer_idx;
            ensure!(peer_idx != primary, PrepareFromPrimarySnafu { peer_idx });
            prepare
                .verify_signature(peer_pubkey(validators, peer_idx)?, *sig)
                .context(InvalidPeerSignatureSnafu { peer_idx })?;
        }
        Ok(())
    }
}

/// Proof that a checkpoint is stable: a quorum of matching signed checkpoints
///
/// Checkpoints are kept whole, as replicas may have produced them in
/// different views.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CheckpointCertificate {
    pub seq_end: SeqNo,
    pub digest: CheckpointDigest,
    pub checkpoints: BTreeMap<PeerIdx, Signed<Checkpoint>>,
}

impl CheckpointCertificate {
    pub fn verify(
        &self,
        inst_id: InstanceId,
        validators: &ValidatorSet,
    ) -> InvalidCertificateResult<()> {
        let needed = validators.num_peers().checkpoint_quorum();
        ensure!(
            needed <= self.checkpoints.len(),
            NotEnoughSignaturesSnafu {
                got: self.checkpoints.len(),
                needed,
            }
        );

        for (peer_idx, checkpoint) in &self.checkpoints {
            let peer_idx = *peer_idx;
            ensure!(
                checkpoint.inst_id == inst_id,
                WrongInstanceSnafu {
                    expected: inst_id,
                    received: checkpoint.inst_id,
                }
            );
            ensure!(
                checkpoint.seq_end == self.seq_end && checkpoint.digest == self.digest,
                CheckpointMismatchSnafu { peer_idx }
            );
            checkpoint
                .verify_sig(peer_pubkey(validators, peer_idx)?)
                .context(InvalidPeerSignatureSnafu { peer_idx })?;
        }
        Ok(())
    }
}

impl ViewChangeVote {
    /// Verify the stable checkpoint and every prepared certificate
    pub fn verify(&self, validators: &ValidatorSet) -> InvalidCertificateResult<()> {
        if let Some(checkpoint) = &self.stable_checkpoint {
            checkpoint.verify(self.inst_id, validators)?;
        }

        let stable_seq = self.stable_seq();
        let mut seen = BTreeSet::new();
        for cert in &self.prepared {
            let key = cert.key();
            ensure!(stable_seq < key.seq, BelowStableCheckpointSnafu { key });
            ensure!(key.view < self.target_view, NotBeforeTargetViewSnafu { key });
            ensure!(seen.insert(key.seq), DuplicateSeqSnafu { seq: key.seq });
            cert.verify(self.inst_id, validators)?;
        }
        Ok(())
    }
}
