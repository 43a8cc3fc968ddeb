use core::fmt;

use bincode::{Decode, Encode};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::peer::PeerIdx;

/// Size of the validator set, and the quorum arithmetic derived from it
#[derive(
    Debug, Clone, Copy, From, PartialEq, Eq, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize,
)]
pub struct NumPeers(u8);

impl fmt::Display for NumPeers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl NumPeers {
    /// Total number of peers
    pub fn total(self) -> usize {
        self.0.into()
    }

    /// Max number of faulty nodes (`f`)
    pub fn max_faulty(self) -> usize {
        self.total().saturating_sub(1) / 3
    }

    /// Matching Prepares (besides the PrePrepare) needed to prepare a key
    ///
    /// `2f` when `n = 3f + 1`.
    pub fn prepare_quorum(self) -> usize {
        self.total() - self.max_faulty() - 1
    }

    /// Matching Commits (own included) needed to commit a key
    ///
    /// `2f + 1` when `n = 3f + 1`.
    pub fn commit_quorum(self) -> usize {
        self.strong_quorum()
    }

    /// Matching Checkpoints needed to make a checkpoint stable
    pub fn checkpoint_quorum(self) -> usize {
        self.strong_quorum()
    }

    /// View change votes (or suspicions) needed to move to a new view
    pub fn view_change_quorum(self) -> usize {
        self.strong_quorum()
    }

    /// Smallest set guaranteed to contain at least one correct replica
    pub fn weak_quorum(self) -> usize {
        self.max_faulty() + 1
    }

    fn strong_quorum(self) -> usize {
        self.total() - self.max_faulty()
    }

    /// Iterator over given number of [`PeerIdx`]es
    pub fn peer_idx_iter(self) -> impl Iterator<Item = PeerIdx> {
        (0..self.0).map(PeerIdx::new)
    }
}

pub trait ToNumPeers {
    fn to_num_peers(&self) -> NumPeers;
}

impl<T> ToNumPeers for [T] {
    fn to_num_peers(&self) -> NumPeers {
        let num_peers: u8 = <usize as TryInto<u8>>::try_into(self.len())
            .expect("ToNumPeers used for Vec of size larger than u8");
        NumPeers::from(num_peers)
    }
}

#[test]
fn num_peers_sanity() {
    use convi::CastFrom;
    for (n, f, prepare, commit, weak) in [
        (1, 0, 0, 1, 1),
        (2, 0, 1, 2, 1),
        (3, 0, 2, 3, 1),
        (4, 1, 2, 3, 2),
        (7, 2, 4, 5, 3),
        (10, 3, 6, 7, 4),
    ] {
        let num = NumPeers::from(n);
        assert_eq!(usize::cast_from(n), num.total());
        assert_eq!(f, num.max_faulty());
        assert_eq!(prepare, num.prepare_quorum());
        assert_eq!(commit, num.commit_quorum());
        assert_eq!(commit, num.checkpoint_quorum());
        assert_eq!(commit, num.view_change_quorum());
        assert_eq!(weak, num.weak_quorum());
    }
}
