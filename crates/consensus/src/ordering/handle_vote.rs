use std::collections::BTreeMap;

use ordo_consensus_core::Signature;
use ordo_consensus_core::cert::PreparedCertificate;
use ordo_consensus_core::digest::BatchDigest;
use ordo_consensus_core::msg::{Commit, MessageKind, Prepare};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::ThreePhaseKey;
use snafu::ensure;
use tracing::{Level, debug, instrument, trace};

use super::{
    BatchPhase, EquivocatingVoteSnafu, OrderingResult, OrderingService, PrepareFromPrimarySnafu,
    VoteForADifferentBatchSnafu,
};
use crate::LOG_TARGET;
use crate::ctx::{Ctx, Internal, Processed};
use crate::env::TimerEvent;
use crate::stasher::ReadinessCondition;
use crate::tally::{InsertOutcome, count_matching, insert_vote};

type Votes = BTreeMap<PeerIdx, (BatchDigest, Signature)>;

fn votes_for(votes: &Votes, digest: BatchDigest) -> usize {
    count_matching(votes, |(d, _)| *d == digest)
}

/// Record a vote, first one per peer wins
fn record_vote(
    votes: &mut Votes,
    expected: Option<BatchDigest>,
    key: ThreePhaseKey,
    peer_idx: PeerIdx,
    digest: BatchDigest,
    sig: Signature,
) -> OrderingResult<Processed> {
    if let Some(expected) = expected {
        ensure!(
            expected == digest,
            VoteForADifferentBatchSnafu { key, expected }
        );
    }
    match insert_vote(votes, peer_idx, (digest, sig)) {
        InsertOutcome::Inserted => Ok(Processed::Accepted),
        InsertOutcome::AlreadyPresent((existing, _)) => {
            ensure!(
                existing == digest,
                EquivocatingVoteSnafu {
                    key,
                    peer_idx,
                    existing,
                }
            );
            Ok(Processed::Duplicate)
        }
    }
}

impl OrderingService {
    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, key = %prepare.key),
        ret(level = Level::TRACE))]
    pub(crate) fn on_prepare(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        prepare: Signed<Prepare>,
    ) -> OrderingResult<Processed> {
        let key = prepare.key;
        if let Some(processed) = self.check_view_and_window(ctx, key) {
            return Ok(processed);
        }
        ensure!(sender != ctx.state.primary(), PrepareFromPrimarySnafu { key });

        let batch = self.batches.entry(key).or_default();
        let expected = batch.pre_prepare.as_ref().map(|pp| pp.digest);
        let processed = record_vote(
            &mut batch.prepares,
            expected,
            key,
            sender,
            prepare.digest,
            prepare.sig,
        )?;
        if processed != Processed::Accepted {
            return Ok(processed);
        }

        if expected.is_none() {
            if ctx.state.num_peers().prepare_quorum() <= votes_for(&batch.prepares, prepare.digest) {
                debug!(target: LOG_TARGET, %key, "Prepare quorum without a PrePrepare");
                ctx.emit(Internal::RequestMissing {
                    kind: MessageKind::PrePrepare,
                    key,
                });
            }
            return Ok(processed);
        }

        self.try_advance(ctx, key);
        Ok(processed)
    }

    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, key = %commit.key),
        ret(level = Level::TRACE))]
    pub(crate) fn on_commit(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        commit: Signed<Commit>,
    ) -> OrderingResult<Processed> {
        let key = commit.key;
        if let Some(processed) = self.check_view_and_window(ctx, key) {
            return Ok(processed);
        }
        if ctx.state.last_ordered().next_expect() < key.seq {
            return Ok(Processed::Stash(ReadinessCondition::SeqCommitted(
                key.seq.saturating_sub(1),
            )));
        }

        let batch = self.batches.entry(key).or_default();
        let expected = batch.pre_prepare.as_ref().map(|pp| pp.digest);
        let processed = record_vote(
            &mut batch.commits,
            expected,
            key,
            sender,
            commit.digest,
            commit.sig,
        )?;
        if processed == Processed::Accepted && expected.is_some() {
            self.try_advance(ctx, key);
        }
        Ok(processed)
    }

    /// Check the quorums of `key` and move it forward as far as they allow
    pub(super) fn try_advance(&mut self, ctx: &mut Ctx, key: ThreePhaseKey) {
        let Some(batch) = self.batches.get_mut(&key) else {
            return;
        };
        let Some(pre_prepare) = batch.pre_prepare.as_ref() else {
            return;
        };
        let digest = pre_prepare.digest;
        let num_peers = ctx.state.num_peers();

        if batch.phase == BatchPhase::PrePrepared
            && num_peers.prepare_quorum() <= votes_for(&batch.prepares, digest)
        {
            batch.phase = BatchPhase::Prepared;
            let cert = PreparedCertificate {
                pre_prepare: pre_prepare.clone(),
                prepares: batch
                    .prepares
                    .iter()
                    .filter(|(_, (d, _))| *d == digest)
                    .map(|(peer_idx, (_, sig))| (*peer_idx, *sig))
                    .collect(),
            };
            let commit = pre_prepare.to_commit();
            self.prepared_certs.insert(key.seq, cert);

            trace!(target: LOG_TARGET, %key, "Prepared");
            let sig = ctx.broadcast(commit);
            batch.commits.insert(ctx.state.our_idx(), (digest, sig));
        }

        if batch.phase == BatchPhase::Prepared
            && num_peers.commit_quorum() <= votes_for(&batch.commits, digest)
        {
            batch.phase = BatchPhase::Committed;
            trace!(target: LOG_TARGET, %key, "Committed");
            ctx.cancel(TimerEvent::KeyStalled(key));
            self.try_order(ctx);
        }
    }

    /// Hand committed batches of the current view over in seq order
    ///
    /// Seqs at or below the last ordered one are handed over again, to be
    /// checked as re-affirmations.
    fn try_order(&mut self, ctx: &mut Ctx) {
        let view = ctx.state.view();
        let mut next = ctx.state.last_ordered().next_expect();

        for (key, batch) in self
            .batches
            .range_mut(ThreePhaseKey::view_start(view)..=ThreePhaseKey::view_end(view))
        {
            if batch.phase != BatchPhase::Committed {
                if next <= key.seq {
                    break;
                }
                continue;
            }
            if batch.ordered {
                if key.seq == next {
                    next = next.next_expect();
                }
                continue;
            }
            if next < key.seq {
                break;
            }
            let Some(pre_prepare) = batch.pre_prepare.as_ref() else {
                continue;
            };

            batch.ordered = true;
            if key.seq == next {
                next = next.next_expect();
            }
            ctx.emit(Internal::Ordered {
                key: *key,
                digest: pre_prepare.digest,
                requests: pre_prepare.requests.clone(),
            });
        }
    }
}
