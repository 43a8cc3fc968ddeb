use std::error::Error;

use ordo_consensus_core::msg::{ConsensusMessage, Envelope, SuspicionReason};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::ThreePhaseKey;
use ordo_util_error::fmt::FmtCompact as _;
use tracing::{debug, instrument, trace};

use super::ReplicaService;
use crate::LOG_TARGET;
use crate::ctx::Processed;
use crate::env::{FaultEvidence, FaultKind, TimerEvent};
use crate::error::{AsFault, FatalResult};
use crate::freshness::FreshnessAction;
use crate::stasher::StashOutcome;

/// A message dropped as evidence against its sender
struct Rejection {
    kind: FaultKind,
    reason: String,
}

impl<E> From<E> for Rejection
where
    E: AsFault + Error,
{
    fn from(err: E) -> Self {
        Self {
            kind: err.fault_kind(),
            reason: err.fmt_compact().to_string(),
        }
    }
}

enum Routed {
    Processed(Processed),
    /// A reply relaying a message of its author
    Relay(Envelope),
}

type RouteResult = Result<Routed, Rejection>;

impl ReplicaService {
    /// Validate, route and apply a single message
    #[instrument(skip_all,
        fields(
            peer_idx = %envelope.sender,
            msg_type = envelope.msg.type_name(),
        ),
        level = "trace")]
    pub(super) fn dispatch(&mut self, envelope: Envelope) -> FatalResult<()> {
        let sender = envelope.sender;
        let msg_type = envelope.msg.type_name();
        let key = envelope.msg.three_phase_key();

        if sender == self.state.our_idx() {
            debug!(target: LOG_TARGET, "Ignoring own message");
            return Ok(());
        }
        if let Some(kind) = self.validate(&envelope) {
            self.report(sender, kind, msg_type, key, "Invalid envelope");
            return Ok(());
        }

        let mut relayed = None;
        match self.route(envelope.clone()) {
            Ok(Routed::Relay(envelope)) => {
                trace!(target: LOG_TARGET, author = %envelope.sender, "Relaying");
                relayed = Some(envelope);
            }
            Ok(Routed::Processed(Processed::Accepted)) => {
                trace!(target: LOG_TARGET, "Accepted");
            }
            Ok(Routed::Processed(processed @ (Processed::Duplicate | Processed::Stale))) => {
                debug!(target: LOG_TARGET, ?processed, ?key, "Ignored");
            }
            Ok(Routed::Processed(Processed::Stash(condition))) => {
                if condition.is_ready(&self.state) {
                    // Nothing left to wait for
                    debug!(target: LOG_TARGET, ?condition, ?key, "Dropping unprocessable message");
                } else if self.stasher.stash(envelope, condition) == StashOutcome::Overflow {
                    self.report(sender, FaultKind::StashOverflow, msg_type, key, "Stash full");
                } else {
                    debug!(target: LOG_TARGET, ?condition, ?key, "Stashed");
                }
            }
            Err(rejection) => {
                self.report(sender, rejection.kind, msg_type, key, &rejection.reason);
            }
        }
        self.flush()?;

        if let Some(relayed) = relayed {
            self.dispatch(relayed)?;
        }
        Ok(())
    }

    /// Returns the fault of an envelope that fails intake checks
    fn validate(&self, envelope: &Envelope) -> Option<FaultKind> {
        let Some(pubkey) = self.state.validators().get(envelope.sender) else {
            return Some(FaultKind::UnknownSender);
        };
        if envelope.msg.verify_sig(pubkey).is_err() {
            return Some(FaultKind::InvalidSignature);
        }
        if envelope.msg.inst_id() != self.state.instance_id() {
            return Some(FaultKind::WrongInstance);
        }
        None
    }

    fn route(&mut self, envelope: Envelope) -> RouteResult {
        let Envelope { sender, msg } = envelope;
        let sig = msg.sig;
        let processed = match msg.inner {
            ConsensusMessage::PrePrepare(m) => self.with_ctx(|s, ctx| {
                s.ordering.on_pre_prepare(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::Prepare(m) => self.with_ctx(|s, ctx| {
                s.ordering.on_prepare(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::Commit(m) => self.with_ctx(|s, ctx| {
                s.ordering.on_commit(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::Checkpoint(m) => self.with_ctx(|s, ctx| {
                s.checkpoints.on_checkpoint(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::Suspicion(m) => self.with_ctx(|s, ctx| {
                s.view_change.on_suspicion(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::ViewChangeVote(m) => self.with_ctx(|s, ctx| {
                s.view_change
                    .on_view_change_vote(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::NewView(m) => self.with_ctx(|s, ctx| {
                s.view_change.on_new_view(ctx, sender, Signed::new(m, sig))
            })?,
            ConsensusMessage::MessageReq(m) => self.with_ctx(|s, ctx| {
                s.requests
                    .on_message_req(ctx, &s.ordering, sender, Signed::new(m, sig))
            }),
            ConsensusMessage::MessageRep(m) => {
                let relayed = self.with_ctx(|s, ctx| {
                    s.requests.on_message_rep(ctx, sender, Signed::new(m, sig))
                })?;
                return Ok(match relayed {
                    Some(envelope) => Routed::Relay(envelope),
                    None => Routed::Processed(Processed::Stale),
                });
            }
        };
        Ok(Routed::Processed(processed))
    }

    fn report(
        &mut self,
        peer_idx: PeerIdx,
        kind: FaultKind,
        msg_type: &'static str,
        key: Option<ThreePhaseKey>,
        reason: &str,
    ) {
        debug!(target: LOG_TARGET, %peer_idx, %kind, msg_type, ?key, %reason, "Rejected message");
        self.out.faults.push(FaultEvidence {
            peer_idx,
            kind,
            msg_type,
            key,
        });
    }

    pub(super) fn handle_timeout(&mut self, event: TimerEvent) -> FatalResult<()> {
        self.timers.remove(&event);
        trace!(target: LOG_TARGET, ?event, "Timeout");
        match event {
            TimerEvent::Freshness => {
                let interval = self.config.freshness_interval();
                let action = self.services.freshness.on_tick(&self.state);
                self.with_ctx(|s, ctx| {
                    ctx.schedule(interval, TimerEvent::Freshness);
                    match action {
                        FreshnessAction::Nothing => {}
                        FreshnessAction::ProposeFreshnessBatch => {
                            if let Err(err) = s.ordering.on_client_batch(ctx, vec![]) {
                                debug!(target: LOG_TARGET, err = %err.fmt_compact(), "No freshness batch");
                            }
                        }
                        FreshnessAction::SuspectPrimary => s
                            .view_change
                            .suspect_primary(ctx, SuspicionReason::FreshnessStalled),
                    }
                });
            }
            TimerEvent::KeyStalled(key) => {
                self.with_ctx(|s, ctx| s.ordering.on_key_stalled(ctx, key));
            }
            TimerEvent::GapTimeout(key) => {
                self.with_ctx(|s, ctx| s.ordering.on_gap_timeout(ctx, key));
            }
            TimerEvent::ViewChangeTimeout(target) => {
                self.with_ctx(|s, ctx| s.view_change.on_timeout(ctx, target));
            }
        }
        self.flush()
    }

    /// Replay stashed messages until none is ready
    pub(super) fn drain_stash(&mut self) -> FatalResult<()> {
        loop {
            let ready = self.stasher.drain_ready(&self.state);
            if ready.is_empty() {
                return Ok(());
            }
            trace!(target: LOG_TARGET, len = ready.len(), "Replaying stashed messages");
            for envelope in ready {
                self.dispatch(envelope)?;
            }
        }
    }
}
