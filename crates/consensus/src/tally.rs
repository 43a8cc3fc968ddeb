use std::collections::BTreeMap;

use ordo_consensus_core::peer::PeerIdx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Inserted,
    AlreadyPresent(T),
}

/// Record the first vote of `peer_idx`; later votes never replace it
pub fn insert_vote<T: Clone>(
    votes: &mut BTreeMap<PeerIdx, T>,
    peer_idx: PeerIdx,
    vote: T,
) -> InsertOutcome<T> {
    match votes.get(&peer_idx) {
        Some(existing) => InsertOutcome::AlreadyPresent(existing.clone()),
        None => {
            votes.insert(peer_idx, vote);
            InsertOutcome::Inserted
        }
    }
}

/// Number of votes satisfying `matches`
pub fn count_matching<T>(votes: &BTreeMap<PeerIdx, T>, matches: impl Fn(&T) -> bool) -> usize {
    votes.values().filter(|v| matches(v)).count()
}

#[test]
fn first_vote_wins() {
    let mut votes = BTreeMap::new();
    assert_eq!(
        insert_vote(&mut votes, PeerIdx::new(1), 'a'),
        InsertOutcome::Inserted
    );
    assert_eq!(
        insert_vote(&mut votes, PeerIdx::new(1), 'b'),
        InsertOutcome::AlreadyPresent('a')
    );
    assert_eq!(
        insert_vote(&mut votes, PeerIdx::new(2), 'a'),
        InsertOutcome::Inserted
    );
    assert_eq!(count_matching(&votes, |v| *v == 'a'), 2);
    assert_eq!(count_matching(&votes, |v| *v == 'b'), 0);
}
