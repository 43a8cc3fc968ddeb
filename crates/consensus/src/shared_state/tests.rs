use assert_matches::assert_matches;
use ordo_consensus_core::cert::CheckpointCertificate;
use ordo_consensus_core::digest::{BatchDigest, CheckpointDigest};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::view::{SeqNo, ViewNo};

use super::OrderOutcome;
use crate::error::FatalError;
use crate::testing::{Fixture, requests};

fn digest(tag: &str) -> BatchDigest {
    BatchDigest::compute(&requests(tag))
}

fn cert(seq: u64, digest: CheckpointDigest) -> CheckpointCertificate {
    CheckpointCertificate {
        seq_end: SeqNo::new(seq),
        digest,
        checkpoints: Default::default(),
    }
}

#[test]
fn view_never_decreases() {
    let fixture = Fixture::new(4);
    let mut state = fixture.state(2);

    assert_eq!(state.primary(), PeerIdx::new(0));
    state.begin_view_change(ViewNo::new(2));
    assert!(state.is_view_changing());

    state.install_view(ViewNo::new(2)).expect("increasing");
    assert_eq!(state.primary(), PeerIdx::new(2));
    assert!(state.is_acting_primary());
    assert!(!state.is_view_changing());

    assert_matches!(
        state.install_view(ViewNo::new(1)),
        Err(FatalError::ViewDecreased { .. })
    );
    assert_eq!(state.view(), ViewNo::new(2));
}

#[test]
fn ordering_has_no_gaps_and_reaffirms_identically() {
    let fixture = Fixture::new(4);
    let mut state = fixture.state(0);

    assert_eq!(
        state.record_ordered(SeqNo::new(1), digest("a")),
        Ok(OrderOutcome::Appended)
    );
    assert_matches!(
        state.record_ordered(SeqNo::new(3), digest("c")),
        Err(FatalError::OrderingGap { .. })
    );
    assert_eq!(
        state.record_ordered(SeqNo::new(2), digest("b")),
        Ok(OrderOutcome::Appended)
    );
    assert_eq!(
        state.record_ordered(SeqNo::new(1), digest("a")),
        Ok(OrderOutcome::Reaffirmed)
    );
    assert_matches!(
        state.record_ordered(SeqNo::new(1), digest("x")),
        Err(FatalError::ReaffirmationMismatch { .. })
    );
    assert_eq!(state.last_ordered(), SeqNo::new(2));
}

#[test]
fn stable_checkpoint_is_monotonic() {
    let fixture = Fixture::new(4);
    let mut state = fixture.state(0);
    let d = CheckpointDigest::chain(CheckpointDigest::ZERO, &[digest("a"), digest("b")]);

    state
        .record_ordered(SeqNo::new(1), digest("a"))
        .expect("in order");
    state
        .record_ordered(SeqNo::new(2), digest("b"))
        .expect("in order");
    state.record_checkpoint(SeqNo::new(2), d);

    assert_eq!(state.record_stable_checkpoint(cert(2, d)), Ok(true));
    assert_eq!(state.stable_seq(), SeqNo::new(2));
    assert_eq!(state.ordered_digest(SeqNo::new(2)), None);
    assert_eq!(state.own_checkpoint(SeqNo::new(2)), None);
    assert_eq!(state.high_watermark(), SeqNo::new(8));

    assert_eq!(state.record_stable_checkpoint(cert(2, d)), Ok(false));
    assert_matches!(
        state.record_stable_checkpoint(cert(0, CheckpointDigest::ZERO)),
        Err(FatalError::StableCheckpointRegressed { .. })
    );
}

#[test]
fn stable_checkpoint_must_match_own() {
    let fixture = Fixture::new(4);
    let mut state = fixture.state(0);
    let own = CheckpointDigest::chain(CheckpointDigest::ZERO, &[digest("a")]);
    state.record_checkpoint(SeqNo::new(2), own);

    assert_matches!(
        state.record_stable_checkpoint(cert(2, CheckpointDigest::ZERO)),
        Err(FatalError::CheckpointDiverged { .. })
    );
}

#[test]
fn watermarks() {
    let fixture = Fixture::new(4);
    let state = fixture.state(0);

    assert!(!state.is_within_watermarks(SeqNo::ZERO));
    assert!(state.is_within_watermarks(SeqNo::new(1)));
    assert!(state.is_within_watermarks(SeqNo::new(6)));
    assert!(!state.is_within_watermarks(SeqNo::new(7)));
}
