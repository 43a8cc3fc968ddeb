//! Three-phase agreement (pre-prepare, prepare, commit) per key
//!
//! Every [`ThreePhaseKey`] moves through [`BatchPhase`]s:
//!
//! ```text
//! Unknown -> PrePrepared -> Prepared -> Committed
//! ```
//!
//! Votes can arrive before the PrePrepare they refer to; they are collected
//! under `Unknown` and pruned to the PrePrepare's digest once it arrives.
//! Keys of a view that a view change moved past are discarded unless
//! committed.
//!
//! Committed batches are handed over in strict sequence order via
//! [`crate::ctx::Internal::Ordered`].
use std::collections::BTreeMap;

use ordo_consensus_core::Signature;
use ordo_consensus_core::cert::PreparedCertificate;
use ordo_consensus_core::digest::BatchDigest;
use ordo_consensus_core::msg::{
    Commit, MessageKind, PrePrepare, Prepare, SuspicionReason, ThreePhaseMessage,
};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::{SeqNo, ThreePhaseKey, ViewNo};
use snafu::Snafu;
use tracing::debug;

use crate::LOG_TARGET;
use crate::ctx::{Ctx, Internal, Processed};
use crate::env::FaultKind;
use crate::error::AsFault;
use crate::stasher::ReadinessCondition;

mod handle_pre_prepare;
mod handle_vote;
mod propose;

pub use self::propose::{SubmitBatchError, SubmitBatchResult};

#[derive(Debug, Snafu)]
pub enum OrderingError {
    #[snafu(display("PrePrepare for {key} from {peer_idx}, the primary is {primary}"))]
    NotPrimary {
        key: ThreePhaseKey,
        peer_idx: PeerIdx,
        primary: PeerIdx,
    },
    #[snafu(display("PrePrepare for {key} with a digest not matching its requests"))]
    DigestMismatch { key: ThreePhaseKey },
    #[snafu(display("PrePrepare for {key} conflicts with accepted {existing}"))]
    ConflictingPrePrepare {
        key: ThreePhaseKey,
        existing: BatchDigest,
    },
    #[snafu(display("Vote for {key} does not match the accepted {expected}"))]
    VoteForADifferentBatch {
        key: ThreePhaseKey,
        expected: BatchDigest,
    },
    #[snafu(display("Peer {peer_idx} already voted {existing} for {key}"))]
    EquivocatingVote {
        key: ThreePhaseKey,
        peer_idx: PeerIdx,
        existing: BatchDigest,
    },
    #[snafu(display("Prepare for {key} from its primary"))]
    PrepareFromPrimary { key: ThreePhaseKey },
}

pub type OrderingResult<T> = Result<T, OrderingError>;

impl AsFault for OrderingError {
    fn fault_kind(&self) -> FaultKind {
        match self {
            OrderingError::NotPrimary { .. } => FaultKind::WrongPrimary,
            OrderingError::DigestMismatch { .. } | OrderingError::VoteForADifferentBatch { .. } => {
                FaultKind::DigestMismatch
            }
            OrderingError::ConflictingPrePrepare { .. } | OrderingError::EquivocatingVote { .. } => {
                FaultKind::Equivocation
            }
            OrderingError::PrepareFromPrimary { .. } => FaultKind::MalformedMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchPhase {
    /// Only votes seen so far
    Unknown,
    PrePrepared,
    Prepared,
    Committed,
}

#[derive(Debug)]
struct BatchState {
    phase: BatchPhase,
    pre_prepare: Option<Signed<PrePrepare>>,
    prepares: BTreeMap<PeerIdx, (BatchDigest, Signature)>,
    commits: BTreeMap<PeerIdx, (BatchDigest, Signature)>,
    /// Handed over to the ordered log already
    ordered: bool,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            phase: BatchPhase::Unknown,
            pre_prepare: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            ordered: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderingService {
    batches: BTreeMap<ThreePhaseKey, BatchState>,
    /// Highest seq a PrePrepare was accepted for in the current view
    last_pre_prepared: SeqNo,
    /// Highest-view proof of every seq prepared above the stable checkpoint
    prepared_certs: BTreeMap<SeqNo, PreparedCertificate>,
    /// First missing PrePrepare we are waiting for
    gap: Option<ThreePhaseKey>,
}

impl OrderingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, key: ThreePhaseKey) -> Option<BatchPhase> {
        self.batches.get(&key).map(|b| b.phase)
    }

    pub fn last_pre_prepared(&self) -> SeqNo {
        self.last_pre_prepared
    }

    pub fn pre_prepare(&self, key: ThreePhaseKey) -> Option<&Signed<PrePrepare>> {
        self.batches.get(&key)?.pre_prepare.as_ref()
    }

    /// Certificates to put in a view change vote
    pub fn prepared_certificates(&self, stable: SeqNo) -> Vec<PreparedCertificate> {
        self.prepared_certs
            .range(stable.next_expect()..)
            .map(|(_, cert)| cert.clone())
            .collect()
    }

    /// A signed three-phase message of `author` we hold for `key`
    pub fn find_message(
        &self,
        kind: MessageKind,
        key: ThreePhaseKey,
        author: PeerIdx,
    ) -> Option<ThreePhaseMessage> {
        let batch = self.batches.get(&key)?;
        let pre_prepare = batch.pre_prepare.as_ref()?;
        match kind {
            MessageKind::PrePrepare => Some(pre_prepare.clone().into()),
            MessageKind::Prepare => batch.prepares.get(&author).map(|(digest, sig)| {
                Signed::new(
                    Prepare {
                        inst_id: pre_prepare.inst_id,
                        key,
                        digest: *digest,
                    },
                    *sig,
                )
                .into()
            }),
            MessageKind::Commit => batch.commits.get(&author).map(|(digest, sig)| {
                Signed::new(
                    Commit {
                        inst_id: pre_prepare.inst_id,
                        key,
                        digest: *digest,
                    },
                    *sig,
                )
                .into()
            }),
        }
    }

    /// Accept/stash/drop decision shared by all three-phase messages
    ///
    /// `None` means the key is in the current view and inside the watermarks.
    fn check_view_and_window(&self, ctx: &Ctx, key: ThreePhaseKey) -> Option<Processed> {
        let state = ctx.state;
        if key.view < state.view() {
            return Some(Processed::Stale);
        }
        if state.view() < key.view {
            return Some(Processed::Stash(ReadinessCondition::ViewAtLeast(key.view)));
        }
        if state.is_view_changing() {
            return Some(Processed::Stale);
        }
        if key.seq <= state.low_watermark() {
            return Some(Processed::Stale);
        }
        if state.high_watermark() < key.seq {
            return Some(Processed::Stash(ReadinessCondition::CheckpointStable(
                key.seq.saturating_sub(ctx.config.log_size),
            )));
        }
        None
    }

    /// A key did not commit in time
    pub(crate) fn on_key_stalled(&mut self, ctx: &mut Ctx, key: ThreePhaseKey) {
        if key.view != ctx.state.view() || ctx.state.is_view_changing() {
            return;
        }
        let phase = self
            .batches
            .get(&key)
            .map(|b| b.phase)
            .unwrap_or(BatchPhase::Unknown);
        let kind = match phase {
            BatchPhase::Committed => return,
            BatchPhase::Unknown => MessageKind::PrePrepare,
            BatchPhase::PrePrepared => MessageKind::Prepare,
            BatchPhase::Prepared => MessageKind::Commit,
        };
        debug!(target: LOG_TARGET, %key, ?phase, "Key stalled");
        ctx.emit(Internal::RequestMissing { kind, key });
        ctx.emit(Internal::SuspectPrimary(SuspicionReason::KeyStalled));
    }

    /// A gap in PrePrepares was not filled in time
    pub(crate) fn on_gap_timeout(&mut self, ctx: &mut Ctx, key: ThreePhaseKey) {
        if self.gap != Some(key) {
            return;
        }
        self.gap = None;
        if key.view != ctx.state.view() || ctx.state.is_view_changing() {
            return;
        }
        if self.last_pre_prepared < key.seq {
            debug!(target: LOG_TARGET, %key, "PrePrepare gap not filled");
            ctx.emit(Internal::SuspectPrimary(SuspicionReason::GapTimeout));
        }
    }

    /// Drop per-key state of views before `view` that did not commit
    ///
    /// Returns the number of discarded keys.
    pub(crate) fn reset_for_view(&mut self, view: ViewNo, start_seq: SeqNo) -> usize {
        let before = self.batches.len();
        self.batches
            .retain(|key, batch| view <= key.view || batch.phase == BatchPhase::Committed);
        self.last_pre_prepared = start_seq;
        self.gap = None;
        before - self.batches.len()
    }

    /// Forget everything at or below a stable checkpoint
    pub(crate) fn gc(&mut self, stable: SeqNo) {
        self.batches.retain(|key, _| stable < key.seq);
        self.prepared_certs.retain(|seq, _| stable < *seq);
        if self.last_pre_prepared < stable {
            self.last_pre_prepared = stable;
        }
    }
}
