//! Periodic checkpoints of the ordered log and their stabilization
//!
//! Every `checkpoint_interval` ordered batches each replica chains the batch
//! digests into a [`CheckpointDigest`] and broadcasts it. A quorum of matching
//! checkpoints makes it stable, which moves the watermark window and lets
//! everything below it be forgotten.
use std::collections::BTreeMap;

use ordo_consensus_core::cert::CheckpointCertificate;
use ordo_consensus_core::digest::{BatchDigest, CheckpointDigest};
use ordo_consensus_core::msg::Checkpoint;
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::SeqNo;
use snafu::{Snafu, ensure};
use tracing::{Level, debug, instrument, warn};

use crate::LOG_TARGET;
use crate::ctx::{Ctx, Internal, Processed};
use crate::env::FaultKind;
use crate::error::{AsFault, FatalError};
use crate::stasher::ReadinessCondition;
use crate::tally::{InsertOutcome, count_matching, insert_vote};

#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Checkpoint range {seq_start}..={seq_end} is not an interval"))]
    MalformedRange { seq_start: SeqNo, seq_end: SeqNo },
    #[snafu(display("Peer {peer_idx} already sent checkpoint {existing} for {seq_end}"))]
    EquivocatingCheckpoint {
        peer_idx: PeerIdx,
        seq_end: SeqNo,
        existing: CheckpointDigest,
    },
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

impl AsFault for CheckpointError {
    fn fault_kind(&self) -> FaultKind {
        match self {
            CheckpointError::MalformedRange { .. } => FaultKind::MalformedMessage,
            CheckpointError::EquivocatingCheckpoint { .. } => FaultKind::Equivocation,
        }
    }
}

#[derive(Debug, Default)]
pub struct CheckpointService {
    /// Digests of batches ordered since the last own checkpoint
    pending: Vec<BatchDigest>,
    /// Digest of the last own checkpoint
    prev_digest: CheckpointDigest,
    /// Own and received checkpoints above the stable one, by `seq_end`
    received: BTreeMap<SeqNo, BTreeMap<PeerIdx, Signed<Checkpoint>>>,
    /// Highest seq catch-up was already asked for
    catchup_requested: SeqNo,
}

impl CheckpointService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn votes_at(&self, seq_end: SeqNo) -> usize {
        self.received.get(&seq_end).map(BTreeMap::len).unwrap_or_default()
    }

    /// A batch was appended to the ordered log
    ///
    /// At a checkpoint boundary returns the own checkpoint digest, which the
    /// caller records in the shared state.
    pub(crate) fn on_commit_at(
        &mut self,
        ctx: &mut Ctx,
        seq: SeqNo,
        digest: BatchDigest,
    ) -> Option<CheckpointDigest> {
        self.pending.push(digest);
        let interval = ctx.config.checkpoint_interval;
        if !seq.is_checkpoint_boundary(interval) {
            return None;
        }

        let checkpoint_digest = CheckpointDigest::chain(self.prev_digest, &self.pending);
        self.pending.clear();
        self.prev_digest = checkpoint_digest;

        let checkpoint = Checkpoint {
            inst_id: ctx.state.instance_id(),
            view: ctx.state.view(),
            seq_start: seq.saturating_sub(interval - 1),
            seq_end: seq,
            digest: checkpoint_digest,
        };
        debug!(target: LOG_TARGET, node = %ctx.state.node_name(), %seq, digest = %checkpoint_digest, "Own checkpoint");
        let sig = ctx.broadcast(checkpoint);
        self.received
            .entry(seq)
            .or_default()
            .insert(ctx.state.our_idx(), Signed::new(checkpoint, sig));

        self.try_stabilize(ctx, seq);
        Some(checkpoint_digest)
    }

    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, seq_end = %checkpoint.seq_end),
        ret(level = Level::TRACE))]
    pub(crate) fn on_checkpoint(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        checkpoint: Signed<Checkpoint>,
    ) -> CheckpointResult<Processed> {
        let Checkpoint {
            seq_start, seq_end, ..
        } = checkpoint.inner;
        let interval = ctx.config.checkpoint_interval;
        ensure!(
            seq_end.is_checkpoint_boundary(interval)
                && seq_end.saturating_sub(interval - 1) == seq_start,
            MalformedRangeSnafu { seq_start, seq_end }
        );

        if seq_end <= ctx.state.stable_seq() {
            return Ok(Processed::Stale);
        }
        if ctx.state.high_watermark() < seq_end {
            return Ok(Processed::Stash(ReadinessCondition::CheckpointStable(
                seq_end.saturating_sub(ctx.config.log_size),
            )));
        }

        let digest = checkpoint.digest;
        let votes = self.received.entry(seq_end).or_default();
        if let InsertOutcome::AlreadyPresent(existing) = insert_vote(votes, sender, checkpoint) {
            ensure!(
                existing.digest == digest,
                EquivocatingCheckpointSnafu {
                    peer_idx: sender,
                    seq_end,
                    existing: existing.digest,
                }
            );
            return Ok(Processed::Duplicate);
        }

        self.try_stabilize(ctx, seq_end);
        Ok(Processed::Accepted)
    }

    /// Check for a quorum at `seq_end`
    fn try_stabilize(&mut self, ctx: &mut Ctx, seq_end: SeqNo) {
        let Some(votes) = self.received.get(&seq_end) else {
            return;
        };
        let own = votes.get(&ctx.state.our_idx()).map(|c| c.digest);
        let quorum = ctx.state.num_peers().checkpoint_quorum();
        let Some(digest) = quorum_digest(votes, quorum) else {
            return;
        };

        match own {
            Some(own) if own == digest => {
                let mut checkpoints = BTreeMap::new();
                for (peer_idx, checkpoint) in votes {
                    if checkpoint.digest == digest {
                        checkpoints.insert(*peer_idx, checkpoint.clone());
                    } else {
                        ctx.fault(
                            *peer_idx,
                            FaultKind::CheckpointMismatch,
                            "Checkpoint",
                            None,
                        );
                    }
                }
                ctx.emit(Internal::Stabilized(CheckpointCertificate {
                    seq_end,
                    digest,
                    checkpoints,
                }));
            }
            Some(own) => {
                warn!(target: LOG_TARGET, %seq_end, %own, quorum = %digest, "Own checkpoint diverged from the quorum");
                ctx.emit(Internal::Fatal(FatalError::CheckpointDiverged {
                    seq: seq_end,
                    own,
                    quorum: digest,
                }));
            }
            None => {
                if self.catchup_requested < seq_end && self.is_lagging(ctx, seq_end) {
                    self.catchup_requested = seq_end;
                    debug!(target: LOG_TARGET, %seq_end, last_ordered = %ctx.state.last_ordered(), "Quorum checkpoint we have not reached");
                    ctx.emit(Internal::CatchupNeeded(seq_end));
                }
            }
        }
    }

    /// Is a quorum checkpoint at `seq_end` out of reach of normal ordering
    ///
    /// Either a whole window behind it, or an earlier quorum checkpoint is
    /// still missing our own.
    fn is_lagging(&self, ctx: &Ctx, seq_end: SeqNo) -> bool {
        if ctx.state.last_ordered().saturating_add(ctx.config.log_size) <= seq_end {
            return true;
        }
        let our_idx = ctx.state.our_idx();
        let quorum = ctx.state.num_peers().checkpoint_quorum();
        self.received.range(..seq_end).any(|(_, votes)| {
            !votes.contains_key(&our_idx) && quorum_digest(votes, quorum).is_some()
        })
    }

    /// Continue the digest chain from a checkpoint obtained by state transfer
    pub(crate) fn apply_catchup(&mut self, cert: &CheckpointCertificate) {
        self.prev_digest = cert.digest;
        self.pending.clear();
        self.gc(cert.seq_end);
    }

    pub(crate) fn gc(&mut self, stable: SeqNo) {
        self.received.retain(|seq, _| stable < *seq);
    }
}

fn quorum_digest(
    votes: &BTreeMap<PeerIdx, Signed<Checkpoint>>,
    quorum: usize,
) -> Option<CheckpointDigest> {
    votes
        .values()
        .map(|c| c.digest)
        .find(|d| quorum <= count_matching(votes, |c| c.digest == *d))
}
