//! Replacing a faulty primary
//!
//! ```text
//! Normal(v) -> ViewChanging(t) -> Normal(t)
//!                   |      ^
//!                   +------+ timeout: t + 1
//! ```
//!
//! Local liveness faults turn into a broadcast [`Suspicion`] of the current
//! primary; `n - f` suspicions for the same target start the view change, and
//! `f + 1` votes for a higher target make a replica join it. The primary of
//! the target view merges a quorum of votes into a [`NewView`] (see
//! [`merge`]), which backups verify by recomputing the merge.
use std::collections::{BTreeMap, BTreeSet};

use ordo_consensus_core::cert::{CheckpointCertificate, InvalidCertificateError};
use ordo_consensus_core::msg::{ConsensusMessage, NewView, Suspicion, SuspicionReason, ViewChangeVote};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::ViewNo;
use snafu::{ResultExt as _, Snafu, ensure};
use tracing::{Level, debug, info, instrument, warn};

use crate::LOG_TARGET;
use crate::ctx::{Ctx, Internal, Processed};
use crate::env::{FaultKind, TimerEvent};
use crate::error::AsFault;
use crate::ordering::OrderingService;
use crate::tally::{InsertOutcome, insert_vote};

pub(crate) mod merge;

/// How far above the current view (or the target being changed to) a peer
/// may point in a suspicion, vote or NewView
pub const MAX_VIEWS_AHEAD: u64 = 64;

#[derive(Debug, Snafu)]
pub enum ViewChangeError {
    #[snafu(display("View {view} is beyond {limit}"))]
    ViewTooFarAhead { view: ViewNo, limit: ViewNo },
    #[snafu(display("Invalid view change vote"))]
    InvalidVote { source: InvalidCertificateError },
    #[snafu(display("Peer {peer_idx} already voted differently for view {target}"))]
    EquivocatingVote { peer_idx: PeerIdx, target: ViewNo },
    #[snafu(display("NewView for {view} from {peer_idx}, its primary is {primary}"))]
    NewViewFromWrongPrimary {
        view: ViewNo,
        peer_idx: PeerIdx,
        primary: PeerIdx,
    },
    #[snafu(display("NewView with {got} votes, {needed} needed"))]
    NewViewNotEnoughVotes { got: usize, needed: usize },
    #[snafu(display("NewView with a vote of {peer_idx} not for its view"))]
    NewViewVoteWrongTarget { peer_idx: PeerIdx },
    #[snafu(display("NewView with more than one vote of {peer_idx}"))]
    NewViewDuplicateVoter { peer_idx: PeerIdx },
    #[snafu(display("NewView with an invalid vote of {peer_idx}"))]
    NewViewInvalidVote {
        peer_idx: PeerIdx,
        source: InvalidCertificateError,
    },
    #[snafu(display("NewView with an invalid PrePrepare signature"))]
    NewViewPrePrepareSignature,
    #[snafu(display("NewView proposals do not match the merged votes"))]
    NewViewMismatch,
}

pub type ViewChangeResult<T> = Result<T, ViewChangeError>;

impl AsFault for ViewChangeError {
    fn fault_kind(&self) -> FaultKind {
        match self {
            ViewChangeError::ViewTooFarAhead { .. } => FaultKind::MalformedMessage,
            ViewChangeError::InvalidVote { .. } => FaultKind::InvalidCertificate,
            ViewChangeError::EquivocatingVote { .. } => FaultKind::Equivocation,
            ViewChangeError::NewViewFromWrongPrimary { .. } => FaultKind::WrongPrimary,
            ViewChangeError::NewViewNotEnoughVotes { .. }
            | ViewChangeError::NewViewVoteWrongTarget { .. }
            | ViewChangeError::NewViewDuplicateVoter { .. }
            | ViewChangeError::NewViewInvalidVote { .. }
            | ViewChangeError::NewViewPrePrepareSignature
            | ViewChangeError::NewViewMismatch => FaultKind::InvalidNewView,
        }
    }
}

#[derive(Debug, Default)]
pub struct ViewChangeService {
    suspicions: BTreeMap<ViewNo, BTreeMap<PeerIdx, SuspicionReason>>,
    /// Highest target we broadcast a suspicion for
    suspected: ViewNo,
    votes: BTreeMap<ViewNo, BTreeMap<PeerIdx, Signed<ViewChangeVote>>>,
    /// View changes started since the last installed view
    attempt: u64,
    new_view_sent: Option<ViewNo>,
}

impl ViewChangeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn votes_for(&self, target: ViewNo) -> usize {
        self.votes.get(&target).map(BTreeMap::len).unwrap_or_default()
    }

    pub fn suspicions_for(&self, target: ViewNo) -> usize {
        self.suspicions
            .get(&target)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }

    /// Broadcast our suspicion of the current primary
    pub(crate) fn suspect_primary(&mut self, ctx: &mut Ctx, reason: SuspicionReason) {
        if ctx.state.is_view_changing() {
            return;
        }
        let Some(target) = ctx.state.view().next() else {
            return;
        };
        if target <= self.suspected {
            return;
        }
        self.suspected = target;

        info!(target: LOG_TARGET, node = %ctx.state.node_name(), primary = %ctx.state.primary(), %target, %reason, "Suspecting primary");
        ctx.broadcast(Suspicion {
            inst_id: ctx.state.instance_id(),
            target_view: target,
            reason,
        });
        self.suspicions
            .entry(target)
            .or_default()
            .insert(ctx.state.our_idx(), reason);
        self.check_suspicions(ctx, target);
    }

    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, target = %suspicion.target_view),
        ret(level = Level::TRACE))]
    pub(crate) fn on_suspicion(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        suspicion: Signed<Suspicion>,
    ) -> ViewChangeResult<Processed> {
        let target = suspicion.target_view;
        if target <= ctx.state.view()
            || ctx.state.view_change_target().is_some_and(|t| target <= t)
        {
            return Ok(Processed::Stale);
        }
        ensure_within_horizon(ctx, target)?;
        if moved_past(&self.suspicions, sender, target) {
            return Ok(Processed::Stale);
        }
        drop_older(&mut self.suspicions, sender, target);

        let votes = self.suspicions.entry(target).or_default();
        if let InsertOutcome::AlreadyPresent(_) = insert_vote(votes, sender, suspicion.reason) {
            return Ok(Processed::Duplicate);
        }
        self.check_suspicions(ctx, target);
        Ok(Processed::Accepted)
    }

    fn check_suspicions(&self, ctx: &mut Ctx, target: ViewNo) {
        if ctx.state.num_peers().view_change_quorum() <= self.suspicions_for(target) {
            ctx.emit(Internal::StartViewChange(target));
        }
    }

    /// Broadcast our vote for `target`
    ///
    /// The shared state must already be changing to `target`.
    #[instrument(skip_all, fields(node = %ctx.state.node_name(), %target))]
    pub(crate) fn start_view_change(
        &mut self,
        ctx: &mut Ctx,
        ordering: &OrderingService,
        target: ViewNo,
    ) {
        debug_assert_eq!(ctx.state.view_change_target(), Some(target));
        self.attempt = self.attempt.saturating_add(1);
        if self.suspected < target {
            self.suspected = target;
        }

        let stable_seq = ctx.state.stable_seq();
        let vote = ViewChangeVote {
            inst_id: ctx.state.instance_id(),
            target_view: target,
            stable_checkpoint: ctx.state.stable_checkpoint().cloned(),
            prepared: ordering.prepared_certificates(stable_seq),
        };
        info!(
            target: LOG_TARGET,
            attempt = self.attempt,
            %stable_seq,
            prepared = vote.prepared.len(),
            "Starting view change"
        );
        let sig = ctx.broadcast(vote.clone());
        drop_older(&mut self.votes, ctx.state.our_idx(), target);
        self.votes
            .entry(target)
            .or_default()
            .insert(ctx.state.our_idx(), Signed::new(vote, sig));

        ctx.schedule(
            ctx.config.view_change_timeout(self.attempt),
            TimerEvent::ViewChangeTimeout(target),
        );
        self.try_new_view(ctx, target);
    }

    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, target = %vote.target_view),
        ret(level = Level::TRACE))]
    pub(crate) fn on_view_change_vote(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        vote: Signed<ViewChangeVote>,
    ) -> ViewChangeResult<Processed> {
        let target = vote.target_view;
        if target <= ctx.state.view() {
            return Ok(Processed::Stale);
        }
        ensure_within_horizon(ctx, target)?;
        if moved_past(&self.votes, sender, target) {
            return Ok(Processed::Stale);
        }
        vote.verify(ctx.state.validators()).context(InvalidVoteSnafu)?;
        drop_older(&mut self.votes, sender, target);

        let votes = self.votes.entry(target).or_default();
        if let InsertOutcome::AlreadyPresent(existing) = insert_vote(votes, sender, vote.clone()) {
            ensure!(
                existing.inner == vote.inner,
                EquivocatingVoteSnafu {
                    peer_idx: sender,
                    target,
                }
            );
            return Ok(Processed::Duplicate);
        }

        let joining = ctx.state.view_change_target().is_none_or(|t| t < target);
        if joining && ctx.state.num_peers().weak_quorum() <= self.votes_for(target) {
            debug!(target: LOG_TARGET, %target, "Joining view change");
            ctx.emit(Internal::StartViewChange(target));
        }
        self.try_new_view(ctx, target);
        Ok(Processed::Accepted)
    }

    /// As the primary of `target`, propose the new view once votes allow
    fn try_new_view(&mut self, ctx: &mut Ctx, target: ViewNo) {
        if ctx.state.view_change_target() != Some(target)
            || ctx.state.primary_for(target) != ctx.state.our_idx()
            || self.new_view_sent == Some(target)
        {
            return;
        }
        let Some(votes) = self.votes.get(&target) else {
            return;
        };
        if votes.len() < ctx.state.num_peers().view_change_quorum() {
            return;
        }

        let inst_id = ctx.state.instance_id();
        let merged = merge::merge(inst_id, target, votes.values().map(|v| &v.inner));
        let pre_prepares = merged
            .pre_prepares
            .into_iter()
            .map(|pp| {
                let sig = ctx.sign(&ConsensusMessage::PrePrepare(pp.clone()));
                Signed::new(pp, sig)
            })
            .collect();
        let new_view = NewView {
            inst_id,
            view: target,
            votes: votes.iter().map(|(idx, v)| (*idx, v.clone())).collect(),
            pre_prepares,
        };

        info!(
            target: LOG_TARGET,
            node = %ctx.state.node_name(),
            %target,
            votes = new_view.votes.len(),
            stable_seq = %merged.stable_checkpoint.as_ref().map(|c| c.seq_end).unwrap_or_default(),
            "Proposing new view"
        );
        self.new_view_sent = Some(target);
        ctx.broadcast(new_view.clone());
        ctx.emit(Internal::InstallNewView(new_view));
    }

    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, view = %new_view.view),
        ret(level = Level::TRACE))]
    pub(crate) fn on_new_view(
        &mut self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        new_view: Signed<NewView>,
    ) -> ViewChangeResult<Processed> {
        let view = new_view.view;
        if view <= ctx.state.view() {
            return Ok(Processed::Stale);
        }
        ensure_within_horizon(ctx, view)?;
        let primary = ctx.state.primary_for(view);
        ensure!(
            sender == primary,
            NewViewFromWrongPrimarySnafu {
                view,
                peer_idx: sender,
                primary,
            }
        );

        if let Err(err) = verify_new_view(ctx, &new_view.inner) {
            // Escalate only a view change we take part in
            if ctx.state.view_change_target() == Some(view) {
                if let Some(next) = view.next() {
                    warn!(target: LOG_TARGET, %view, err = %err, "Invalid NewView, escalating");
                    ctx.emit(Internal::StartViewChange(next));
                }
            }
            return Err(err);
        }

        ctx.emit(Internal::InstallNewView(new_view.inner));
        Ok(Processed::Accepted)
    }

    /// The view change timer fired
    pub(crate) fn on_timeout(&mut self, ctx: &mut Ctx, target: ViewNo) {
        if ctx.state.view_change_target() != Some(target) {
            return;
        }
        match target.next() {
            Some(next) => {
                warn!(target: LOG_TARGET, node = %ctx.state.node_name(), %target, "View change timed out");
                ctx.emit(Internal::StartViewChange(next));
            }
            None => {
                warn!(target: LOG_TARGET, node = %ctx.state.node_name(), %target, "View change timed out at the last view");
            }
        }
    }

    pub(crate) fn on_view_installed(&mut self, view: ViewNo) {
        self.votes.retain(|target, _| view < *target);
        self.suspicions.retain(|target, _| view < *target);
        if self.suspected < view {
            self.suspected = view;
        }
        self.attempt = 0;
    }
}

fn ensure_within_horizon(ctx: &Ctx, view: ViewNo) -> ViewChangeResult<()> {
    let base = ctx
        .state
        .view_change_target()
        .map_or(ctx.state.view(), |target| target.max(ctx.state.view()));
    let limit = base.saturating_add(MAX_VIEWS_AHEAD);
    // The last view has no successor to escalate to
    ensure!(
        view <= limit && view < ViewNo::MAX,
        ViewTooFarAheadSnafu { view, limit }
    );
    Ok(())
}

/// Did `sender` already point at a target above `target`
fn moved_past<V>(
    tables: &BTreeMap<ViewNo, BTreeMap<PeerIdx, V>>,
    sender: PeerIdx,
    target: ViewNo,
) -> bool {
    tables
        .range(target..)
        .any(|(t, entries)| target < *t && entries.contains_key(&sender))
}

/// Forget what `sender` sent for targets below `target`
///
/// Each sender keeps at most one entry.
fn drop_older<V>(
    tables: &mut BTreeMap<ViewNo, BTreeMap<PeerIdx, V>>,
    sender: PeerIdx,
    target: ViewNo,
) {
    tables.retain(|t, entries| {
        if *t < target {
            entries.remove(&sender);
        }
        !entries.is_empty()
    });
}

fn verify_new_view(ctx: &Ctx, new_view: &NewView) -> ViewChangeResult<()> {
    let validators = ctx.state.validators();
    let needed = validators.num_peers().view_change_quorum();
    ensure!(
        needed <= new_view.votes.len(),
        NewViewNotEnoughVotesSnafu {
            got: new_view.votes.len(),
            needed,
        }
    );

    let mut voters = BTreeSet::new();
    for (peer_idx, vote) in &new_view.votes {
        let peer_idx = *peer_idx;
        ensure!(
            voters.insert(peer_idx),
            NewViewDuplicateVoterSnafu { peer_idx }
        );
        ensure!(
            vote.target_view == new_view.view && vote.inst_id == new_view.inst_id,
            NewViewVoteWrongTargetSnafu { peer_idx }
        );
        let pubkey = validators
            .get(peer_idx)
            .ok_or(InvalidCertificateError::UnknownPeer { peer_idx })
            .context(NewViewInvalidVoteSnafu { peer_idx })?;
        vote.verify_sig(pubkey)
            .map_err(|source| InvalidCertificateError::InvalidPeerSignature { peer_idx, source })
            .context(NewViewInvalidVoteSnafu { peer_idx })?;
        vote.verify(validators)
            .context(NewViewInvalidVoteSnafu { peer_idx })?;
    }

    let primary = validators
        .get(ctx.state.primary_for(new_view.view))
        .ok_or(ViewChangeError::NewViewPrePrepareSignature)?;
    for pp in &new_view.pre_prepares {
        pp.verify_sig(primary)
            .map_err(|_| ViewChangeError::NewViewPrePrepareSignature)?;
    }

    let merged = merge::merge(
        new_view.inst_id,
        new_view.view,
        new_view.votes.iter().map(|(_, v)| &v.inner),
    );
    ensure!(
        merged.pre_prepares.len() == new_view.pre_prepares.len()
            && merged
                .pre_prepares
                .iter()
                .zip(&new_view.pre_prepares)
                .all(|(expected, got)| *expected == got.inner),
        NewViewMismatchSnafu
    );
    Ok(())
}

/// Highest stable checkpoint among the votes a new view was built from
pub(crate) fn new_view_stable_checkpoint(new_view: &NewView) -> Option<CheckpointCertificate> {
    merge::merge(
        new_view.inst_id,
        new_view.view,
        new_view.votes.iter().map(|(_, v)| &v.inner),
    )
    .stable_checkpoint
}

#[cfg(test)]
mod tests;
