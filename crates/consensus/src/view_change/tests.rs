use assert_matches::assert_matches;
use ordo_consensus_core::msg::{
    ConsensusMessage, NewView, PrePrepare, Suspicion, SuspicionReason, ViewChangeVote,
};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::timestamp::Timestamp;
use ordo_consensus_core::view::ViewNo;

use super::{MAX_VIEWS_AHEAD, ViewChangeError, ViewChangeService};
use crate::ctx::{Ctx, Internal, Outbox, Outgoing, Processed, TimerCommand};
use crate::env::{FaultKind, TimerEvent};
use crate::error::AsFault as _;
use crate::ordering::OrderingService;
use crate::shared_state::SharedConsensusState;
use crate::testing::{Fixture, INST, key, pre_prepare};

struct Harness {
    our: u8,
    state: SharedConsensusState,
    views: ViewChangeService,
    ordering: OrderingService,
    out: Outbox,
}

impl Harness {
    fn new(fx: &Fixture, our: u8) -> Self {
        Self {
            our,
            state: fx.state(our),
            views: ViewChangeService::new(),
            ordering: OrderingService::new(),
            out: Outbox::default(),
        }
    }

    fn with<R>(
        &mut self,
        fx: &Fixture,
        f: impl FnOnce(&mut ViewChangeService, &OrderingService, &mut Ctx) -> R,
    ) -> R {
        let seckey = fx.seckey(self.our);
        let mut ctx = Ctx::new(&self.state, &fx.config, &seckey, &mut self.out);
        f(&mut self.views, &self.ordering, &mut ctx)
    }

    /// What the replica does on `Internal::StartViewChange`
    fn start(&mut self, fx: &Fixture, target: u64) {
        let target = ViewNo::new(target);
        self.state.begin_view_change(target);
        self.with(fx, |v, o, ctx| v.start_view_change(ctx, o, target));
    }

    fn suspicion(
        &mut self,
        fx: &Fixture,
        from: u8,
        target: u64,
    ) -> Result<Processed, ViewChangeError> {
        let suspicion = Signed::new_sign(
            Suspicion {
                inst_id: INST,
                target_view: ViewNo::new(target),
                reason: SuspicionReason::FreshnessStalled,
            },
            fx.seckey(from),
        );
        self.with(fx, |v, _, ctx| {
            v.on_suspicion(ctx, PeerIdx::new(from), suspicion)
        })
    }

    fn vote(
        &mut self,
        fx: &Fixture,
        from: u8,
        vote: ViewChangeVote,
    ) -> Result<Processed, ViewChangeError> {
        let vote = Signed::new_sign(vote, fx.seckey(from));
        self.with(fx, |v, _, ctx| {
            v.on_view_change_vote(ctx, PeerIdx::new(from), vote)
        })
    }

    fn new_view(
        &mut self,
        fx: &Fixture,
        from: u8,
        new_view: NewView,
    ) -> Result<Processed, ViewChangeError> {
        let new_view = Signed::new_sign(new_view, fx.seckey(from));
        self.with(fx, |v, _, ctx| {
            v.on_new_view(ctx, PeerIdx::new(from), new_view)
        })
    }

    fn internal(&mut self) -> Vec<Internal> {
        self.out.internal.drain(..).collect()
    }

    fn broadcast_new_view(&self) -> Option<NewView> {
        self.out.outgoing.iter().find_map(|o| match o {
            Outgoing::Broadcast(msg) => match &msg.inner {
                ConsensusMessage::NewView(nv) => Some(nv.clone()),
                _ => None,
            },
            Outgoing::Send(..) => None,
        })
    }
}

fn empty_vote(target: u64) -> ViewChangeVote {
    ViewChangeVote {
        inst_id: INST,
        target_view: ViewNo::new(target),
        stable_checkpoint: None,
        prepared: vec![],
    }
}

fn starts(events: &[Internal]) -> Vec<ViewNo> {
    events
        .iter()
        .filter_map(|e| match e {
            Internal::StartViewChange(target) => Some(*target),
            _ => None,
        })
        .collect()
}

#[test_log::test]
fn suspicion_quorum_starts_view_change() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 1);

    h.with(&fx, |v, _, ctx| {
        v.suspect_primary(ctx, SuspicionReason::FreshnessStalled)
    });
    // Only once per target
    h.with(&fx, |v, _, ctx| v.suspect_primary(ctx, SuspicionReason::KeyStalled));
    assert_eq!(h.out.outgoing.len(), 1);

    assert_eq!(h.suspicion(&fx, 2, 1).expect("valid"), Processed::Accepted);
    assert_eq!(h.suspicion(&fx, 2, 1).expect("valid"), Processed::Duplicate);
    assert!(starts(&h.internal()).is_empty());

    assert_eq!(h.suspicion(&fx, 3, 1).expect("valid"), Processed::Accepted);
    assert_eq!(starts(&h.internal()), vec![ViewNo::new(1)]);

    assert_eq!(h.suspicion(&fx, 3, 0).expect("valid"), Processed::Stale);
}

#[test_log::test]
fn starting_view_change_votes_and_arms_timer() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 2);
    h.start(&fx, 1);

    assert_matches!(
        h.out.outgoing.as_slice(),
        [Outgoing::Broadcast(msg)] if msg.inner == ConsensusMessage::ViewChangeVote(empty_vote(1))
    );
    assert!(h.out.timers.iter().any(|t| matches!(
        t,
        TimerCommand::Schedule(d, TimerEvent::ViewChangeTimeout(v))
            if *v == ViewNo::new(1) && *d == fx.config.view_change_timeout(1)
    )));
    assert_eq!(h.views.votes_for(ViewNo::new(1)), 1);

    h.with(&fx, |v, _, ctx| v.on_timeout(ctx, ViewNo::new(1)));
    assert_eq!(starts(&h.internal()), vec![ViewNo::new(2)]);

    // A stale timer is ignored
    h.start(&fx, 2);
    h.internal();
    h.with(&fx, |v, _, ctx| v.on_timeout(ctx, ViewNo::new(1)));
    assert!(starts(&h.internal()).is_empty());
    assert_eq!(h.views.attempt(), 2);
}

#[test_log::test]
fn weak_quorum_of_votes_joins() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 3);

    h.vote(&fx, 1, empty_vote(1)).expect("valid");
    assert!(starts(&h.internal()).is_empty());
    h.vote(&fx, 2, empty_vote(1)).expect("valid");
    assert_eq!(starts(&h.internal()), vec![ViewNo::new(1)]);
}

#[test_log::test]
fn invalid_vote_is_rejected() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 3);

    let mut cert = fx.prepared_certificate(pre_prepare(0, 1, "a"));
    cert.prepares.pop_first();
    cert.prepares.pop_first();
    let mut vote = empty_vote(1);
    vote.prepared.push(cert);

    let err = h.vote(&fx, 1, vote).unwrap_err();
    assert_matches!(err, ViewChangeError::InvalidVote { .. });
    assert_eq!(err.fault_kind(), FaultKind::InvalidCertificate);
}

/// Primary of view 1 (peer 1) collecting votes from 2 and 3
fn new_view_of_primary(fx: &Fixture, prepared: Vec<PrePrepare>) -> NewView {
    let mut primary = Harness::new(fx, 1);
    primary.start(fx, 1);
    assert!(primary.broadcast_new_view().is_none());

    let mut vote = empty_vote(1);
    vote.prepared = prepared
        .into_iter()
        .map(|pp| fx.prepared_certificate(pp))
        .collect();
    primary.vote(fx, 2, vote).expect("valid");
    primary.vote(fx, 3, empty_vote(1)).expect("valid");

    let new_view = primary.broadcast_new_view().expect("quorum reached");
    assert_matches!(
        primary.internal().as_slice(),
        [.., Internal::InstallNewView(nv)] if *nv == new_view
    );
    new_view
}

#[test_log::test]
fn new_primary_merges_votes() {
    let fx = Fixture::new(4);
    let new_view = new_view_of_primary(&fx, vec![pre_prepare(0, 2, "b")]);

    assert_eq!(new_view.view, ViewNo::new(1));
    assert_eq!(new_view.votes.len(), 3);
    let keys: Vec<_> = new_view.pre_prepares.iter().map(|pp| pp.key).collect();
    assert_eq!(keys, vec![key(1, 1), key(1, 2)]);
    assert!(new_view.pre_prepares[0].is_freshness());
    assert_eq!(new_view.pre_prepares[1].digest, pre_prepare(0, 2, "b").digest);
}

#[test_log::test]
fn backup_accepts_a_valid_new_view() {
    let fx = Fixture::new(4);
    let new_view = new_view_of_primary(&fx, vec![pre_prepare(0, 1, "a")]);

    let mut backup = Harness::new(&fx, 2);
    backup.start(&fx, 1);
    backup.internal();
    assert_eq!(
        backup.new_view(&fx, 1, new_view.clone()).expect("valid"),
        Processed::Accepted
    );
    assert_matches!(
        backup.internal().as_slice(),
        [Internal::InstallNewView(nv)] if *nv == new_view
    );
}

#[test_log::test]
fn new_view_from_wrong_primary_is_rejected() {
    let fx = Fixture::new(4);
    let new_view = new_view_of_primary(&fx, vec![]);
    let mut backup = Harness::new(&fx, 2);
    let err = backup.new_view(&fx, 3, new_view).unwrap_err();
    assert_eq!(err.fault_kind(), FaultKind::WrongPrimary);
}

#[test_log::test]
fn tampered_new_view_escalates_an_ongoing_view_change() {
    let fx = Fixture::new(4);
    let mut new_view = new_view_of_primary(&fx, vec![pre_prepare(0, 1, "a")]);
    let extra = PrePrepare::new(INST, key(1, 2), vec![], Timestamp::ZERO);
    new_view
        .pre_prepares
        .push(Signed::new_sign(extra, fx.seckey(1)));

    let mut backup = Harness::new(&fx, 2);
    backup.start(&fx, 1);
    backup.internal();
    let err = backup.new_view(&fx, 1, new_view).unwrap_err();
    assert_matches!(err, ViewChangeError::NewViewMismatch);
    assert_eq!(err.fault_kind(), FaultKind::InvalidNewView);
    assert_eq!(starts(&backup.internal()), vec![ViewNo::new(2)]);
}

#[test_log::test]
fn invalid_new_view_does_not_start_a_view_change() {
    let fx = Fixture::new(4);
    let mut backup = Harness::new(&fx, 2);

    // Peer 1 is the primary of view 5
    let bogus = NewView {
        inst_id: INST,
        view: ViewNo::new(5),
        votes: vec![],
        pre_prepares: vec![],
    };
    let err = backup.new_view(&fx, 1, bogus).unwrap_err();
    assert_eq!(err.fault_kind(), FaultKind::InvalidNewView);
    assert!(starts(&backup.internal()).is_empty());
    assert_eq!(backup.state.view_change_target(), None);
    assert_eq!(backup.state.view(), ViewNo::ZERO);
}

#[test_log::test]
fn views_far_ahead_are_rejected() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 2);
    let last = ViewNo::MAX;

    let new_view = NewView {
        inst_id: INST,
        view: last,
        votes: vec![],
        pre_prepares: vec![],
    };
    let primary = u8::try_from(h.state.primary_for(last).as_usize()).expect("small set");
    let err = h.new_view(&fx, primary, new_view).unwrap_err();
    assert_matches!(err, ViewChangeError::ViewTooFarAhead { .. });
    assert_eq!(err.fault_kind(), FaultKind::MalformedMessage);

    let beyond = MAX_VIEWS_AHEAD + 1;
    assert_matches!(
        h.vote(&fx, 1, empty_vote(beyond)),
        Err(ViewChangeError::ViewTooFarAhead { .. })
    );
    assert_matches!(
        h.suspicion(&fx, 1, beyond),
        Err(ViewChangeError::ViewTooFarAhead { .. })
    );
    assert_eq!(
        h.vote(&fx, 1, empty_vote(MAX_VIEWS_AHEAD)).expect("valid"),
        Processed::Accepted
    );
    assert!(starts(&h.internal()).is_empty());
}

#[test_log::test]
fn timeout_at_the_last_view_does_not_escalate() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 2);
    h.state.begin_view_change(ViewNo::MAX);
    h.with(&fx, |v, _, ctx| v.on_timeout(ctx, ViewNo::MAX));
    assert!(starts(&h.internal()).is_empty());
}

#[test_log::test]
fn each_sender_keeps_only_its_highest_target() {
    let fx = Fixture::new(4);
    let mut h = Harness::new(&fx, 3);

    for target in 1..=MAX_VIEWS_AHEAD {
        h.vote(&fx, 1, empty_vote(target)).expect("valid");
        h.suspicion(&fx, 2, target).expect("valid");
    }
    let votes: usize = (1..=MAX_VIEWS_AHEAD)
        .map(|t| h.views.votes_for(ViewNo::new(t)))
        .sum();
    let suspicions: usize = (1..=MAX_VIEWS_AHEAD)
        .map(|t| h.views.suspicions_for(ViewNo::new(t)))
        .sum();
    assert_eq!(votes, 1);
    assert_eq!(suspicions, 1);
    assert_eq!(h.views.votes_for(ViewNo::new(MAX_VIEWS_AHEAD)), 1);

    // Going back is stale
    assert_eq!(
        h.vote(&fx, 1, empty_vote(3)).expect("valid"),
        Processed::Stale
    );
    assert_eq!(h.suspicion(&fx, 2, 3).expect("valid"), Processed::Stale);
    assert!(starts(&h.internal()).is_empty());
}

#[test_log::test]
fn new_view_without_quorum_is_rejected() {
    let fx = Fixture::new(4);
    let mut new_view = new_view_of_primary(&fx, vec![]);
    new_view.votes.pop();

    let mut backup = Harness::new(&fx, 2);
    assert_matches!(
        backup.new_view(&fx, 1, new_view),
        Err(ViewChangeError::NewViewNotEnoughVotes { got: 2, needed: 3 })
    );
}

#[test_log::test]
fn stale_new_view_is_ignored() {
    let fx = Fixture::new(4);
    let new_view = new_view_of_primary(&fx, vec![]);
    let mut backup = Harness::new(&fx, 2);
    backup.state.install_view(ViewNo::new(1)).expect("valid");
    backup.views.on_view_installed(ViewNo::new(1));
    assert_eq!(
        backup.new_view(&fx, 1, new_view).expect("valid"),
        Processed::Stale
    );
}
