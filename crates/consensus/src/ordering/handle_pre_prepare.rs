use ordo_consensus_core::msg::{MessageKind, PrePrepare};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::ThreePhaseKey;
use snafu::ensure;
use tracing::{Level, debug, instrument, trace};

use super::{
    BatchPhase, ConflictingPrePrepareSnafu, DigestMismatchSnafu, NotPrimarySnafu,
    OrderingResult, OrderingService,
};
use crate::LOG_TARGET;
use crate::ctx::{Ctx, Internal, Processed};
use crate::env::{FaultKind, TimerEvent};
use crate::stasher::ReadinessCondition;

impl OrderingService {
    #[instrument(skip_all,
        fields(
            node = %ctx.state.node_name(),
            peer_idx = %sender,
            key = %pre_prepare.key,
        ),
        ret(level = Level::TRACE))]
    pub(crate) fn on_pre_prepare(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        pre_prepare: Signed<PrePrepare>,
    ) -> OrderingResult<Processed> {
        let key = pre_prepare.key;
        if let Some(processed) = self.check_view_and_window(ctx, key) {
            return Ok(processed);
        }

        let primary = ctx.state.primary();
        ensure!(
            sender == primary,
            NotPrimarySnafu {
                key,
                peer_idx: sender,
                primary,
            }
        );
        ensure!(pre_prepare.has_valid_digest(), DigestMismatchSnafu { key });

        if let Some(existing) = self.pre_prepare(key) {
            ensure!(
                existing.digest == pre_prepare.digest,
                ConflictingPrePrepareSnafu {
                    key,
                    existing: existing.digest,
                }
            );
            return Ok(Processed::Duplicate);
        }

        let expected = self
            .last_pre_prepared
            .max(ctx.state.low_watermark())
            .next_expect();
        if key.seq < expected {
            return Ok(Processed::Stale);
        }
        if expected < key.seq {
            debug!(target: LOG_TARGET, %expected, "Gap before PrePrepare");
            for seq in expected.saturating_sub(1).range_after(key.seq.saturating_sub(1)) {
                ctx.emit(Internal::RequestMissing {
                    kind: MessageKind::PrePrepare,
                    key: ThreePhaseKey::new(key.view, seq),
                });
            }
            if self.gap.is_none() {
                let gap = ThreePhaseKey::new(key.view, expected);
                self.gap = Some(gap);
                ctx.schedule(ctx.config.gap_timeout(), TimerEvent::GapTimeout(gap));
            }
            return Ok(Processed::Stash(ReadinessCondition::SeqCommitted(
                key.seq.saturating_sub(1),
            )));
        }

        self.accept_pre_prepare(ctx, pre_prepare);
        Ok(Processed::Accepted)
    }

    /// Move `key` to `PrePrepared` with the given proposal
    pub(super) fn accept_pre_prepare(&mut self, ctx: &mut Ctx, pre_prepare: Signed<PrePrepare>) {
        let key = pre_prepare.key;
        let digest = pre_prepare.digest;
        let our_idx = ctx.state.our_idx();

        let batch = self.batches.entry(key).or_default();
        debug_assert!(batch.pre_prepare.is_none());

        let mut mismatched = vec![];
        batch.prepares.retain(|peer_idx, (d, _)| {
            let keep = *d == digest;
            if !keep {
                mismatched.push((*peer_idx, "Prepare"));
            }
            keep
        });
        batch.commits.retain(|peer_idx, (d, _)| {
            let keep = *d == digest;
            if !keep {
                mismatched.push((*peer_idx, "Commit"));
            }
            keep
        });

        if batch.phase < BatchPhase::PrePrepared {
            batch.phase = BatchPhase::PrePrepared;
        }
        if our_idx != ctx.state.primary() {
            let sig = ctx.broadcast(pre_prepare.to_prepare());
            batch.prepares.insert(our_idx, (digest, sig));
        }
        batch.pre_prepare = Some(pre_prepare);

        for (peer_idx, msg_type) in mismatched {
            ctx.fault(peer_idx, FaultKind::DigestMismatch, msg_type, Some(key));
        }

        if self.last_pre_prepared < key.seq {
            self.last_pre_prepared = key.seq;
        }
        if let Some(gap) = self.gap.filter(|gap| gap.seq <= key.seq) {
            self.gap = None;
            ctx.cancel(TimerEvent::GapTimeout(gap));
        }
        trace!(target: LOG_TARGET, %key, %digest, "PrePrepared");
        ctx.schedule(ctx.config.ordering_timeout(), TimerEvent::KeyStalled(key));

        self.try_advance(ctx, key);
    }
}
