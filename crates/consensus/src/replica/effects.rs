use std::mem;

use ordo_consensus_core::cert::CheckpointCertificate;
use ordo_consensus_core::msg::NewView;
use ordo_consensus_core::view::ViewNo;
use ordo_util_error::fmt::FmtCompact as _;
use ordo_util_fmt_opt::AsFmtOption as _;
use tracing::{debug, info, trace, warn};

use super::ReplicaService;
use crate::LOG_TARGET;
use crate::ctx::{Internal, Outgoing, TimerCommand};
use crate::env::{NodeEvent, RequestOutcome, TimerEvent};
use crate::error::FatalResult;
use crate::shared_state::OrderOutcome;
use crate::view_change::new_view_stable_checkpoint;

impl ReplicaService {
    /// Apply internal events, then hand everything else to the collaborators
    pub(super) fn flush(&mut self) -> FatalResult<()> {
        while let Some(event) = self.out.internal.pop_front() {
            self.apply_internal(event)?;
        }

        for outgoing in mem::take(&mut self.out.outgoing) {
            match outgoing {
                Outgoing::Broadcast(msg) => self.network.broadcast(msg),
                Outgoing::Send(peer_idx, msg) => self.network.send(peer_idx, msg),
            }
        }
        for command in mem::take(&mut self.out.timers) {
            match command {
                TimerCommand::Schedule(after, event) => {
                    if let Some(handle) = self.timers.remove(&event) {
                        self.timer.cancel(handle);
                    }
                    let handle = self.timer.schedule(after, event);
                    self.timers.insert(event, handle);
                }
                TimerCommand::Cancel(event) => {
                    if let Some(handle) = self.timers.remove(&event) {
                        self.timer.cancel(handle);
                    }
                }
            }
        }
        for evidence in mem::take(&mut self.out.faults) {
            self.supervisor.report_fault(evidence);
        }
        Ok(())
    }

    fn apply_internal(&mut self, event: Internal) -> FatalResult<()> {
        trace!(target: LOG_TARGET, ?event, "Internal event");
        match event {
            Internal::Ordered {
                key,
                digest,
                requests,
            } => match self.state.record_ordered(key.seq, digest)? {
                OrderOutcome::Appended => {
                    let outcomes = self.executor.apply_ordered_batch(key.seq, &requests);
                    let rejected = outcomes
                        .iter()
                        .filter(|o| matches!(o, RequestOutcome::Rejected { .. }))
                        .count();
                    debug!(target: LOG_TARGET, %key, len = requests.len(), rejected, "Ordered");
                    if let Some(checkpoint) = self.with_ctx(|s, ctx| {
                        s.checkpoints.on_commit_at(ctx, key.seq, digest)
                    }) {
                        self.state.record_checkpoint(key.seq, checkpoint);
                    }
                }
                OrderOutcome::Reaffirmed => {
                    debug!(target: LOG_TARGET, %key, "Re-affirmed");
                }
            },
            Internal::Stabilized(cert) => self.stabilize(cert)?,
            Internal::SuspectPrimary(reason) => {
                self.with_ctx(|s, ctx| s.view_change.suspect_primary(ctx, reason));
            }
            Internal::StartViewChange(target) => self.start_view_change(target),
            Internal::InstallNewView(new_view) => self.install_new_view(new_view)?,
            Internal::RequestMissing { kind, key } => {
                self.with_ctx(|s, ctx| s.requests.request_missing(ctx, kind, key));
            }
            Internal::CatchupNeeded(till) => {
                self.supervisor.on_event(NodeEvent::CatchupNeeded { till });
            }
            Internal::Fatal(err) => return Err(err),
        }
        Ok(())
    }

    /// Make `cert` the stable checkpoint and forget everything below it
    pub(super) fn stabilize(&mut self, cert: CheckpointCertificate) -> FatalResult<()> {
        let seq = cert.seq_end;
        let digest = cert.digest;
        if !self.state.record_stable_checkpoint(cert)? {
            return Ok(());
        }

        self.services.ordering.gc(seq);
        self.services.checkpoints.gc(seq);
        self.services.requests.gc(seq);
        let purged = self.stasher.purge_below(seq);
        info!(
            target: LOG_TARGET,
            node = %self.state.node_name(),
            %seq,
            %digest,
            purged,
            "Checkpoint stable"
        );
        self.supervisor
            .on_event(NodeEvent::CheckpointStabilized { seq, digest });
        Ok(())
    }

    fn start_view_change(&mut self, target: ViewNo) {
        if target <= self.state.view()
            || self
                .state
                .view_change_target()
                .is_some_and(|current| target <= current)
        {
            return;
        }
        debug!(
            target: LOG_TARGET,
            node = %self.state.node_name(),
            view = %self.state.view(),
            previous = %self.state.view_change_target().fmt_option(),
            %target,
            "View change"
        );
        self.state.begin_view_change(target);
        self.with_ctx(|s, ctx| s.view_change.start_view_change(ctx, &s.ordering, target));
    }

    fn install_new_view(&mut self, new_view: NewView) -> FatalResult<()> {
        let view = new_view.view;
        if view <= self.state.view() {
            return Ok(());
        }
        self.state.install_view(view)?;

        let merged_stable = new_view_stable_checkpoint(&new_view);
        let low = merged_stable
            .as_ref()
            .map(|cert| cert.seq_end)
            .unwrap_or_default();
        if let Some(cert) = merged_stable {
            if self.state.stable_seq() < cert.seq_end {
                if self.state.own_checkpoint(cert.seq_end) == Some(cert.digest) {
                    self.stabilize(cert)?;
                } else {
                    warn!(target: LOG_TARGET, seq = %cert.seq_end, "New view starts above our state");
                    self.supervisor.on_event(NodeEvent::CatchupNeeded {
                        till: cert.seq_end,
                    });
                    self.services.checkpoints.gc(cert.seq_end);
                }
            }
        }
        let start_seq = low.max(self.state.stable_seq());

        let discarded = self.services.ordering.reset_for_view(view, start_seq);
        self.services.view_change.on_view_installed(view);
        self.services.requests.on_view_installed(view);
        self.services.freshness.reset(&self.state);
        let purged = self.stasher.purge_views_below(view);
        let stale_timers: Vec<_> = self
            .timers
            .keys()
            .filter(|event| matches!(event, TimerEvent::ViewChangeTimeout(t) if *t <= view))
            .copied()
            .collect();
        for event in stale_timers {
            if let Some(handle) = self.timers.remove(&event) {
                self.timer.cancel(handle);
            }
        }

        let primary = self.state.primary();
        info!(
            target: LOG_TARGET,
            node = %self.state.node_name(),
            %view,
            %primary,
            re_proposed = new_view.pre_prepares.len(),
            discarded,
            purged,
            "New view installed"
        );

        for pre_prepare in new_view.pre_prepares {
            let key = pre_prepare.key;
            let res = self.with_ctx(|s, ctx| s.ordering.on_pre_prepare(ctx, primary, pre_prepare));
            if let Err(err) = res {
                warn!(target: LOG_TARGET, %key, err = %err.fmt_compact(), "Re-proposal rejected");
            }
        }
        self.supervisor
            .on_event(NodeEvent::ViewInstalled { view, primary });
        Ok(())
    }
}
