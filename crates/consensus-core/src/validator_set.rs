use std::ops;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

use crate::num_peers::{NumPeers, ToNumPeers as _};
use crate::peer::{PeerIdx, PeerPubkey};
use crate::view::ViewNo;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ValidatorSetError {
    Empty,
    #[snafu(display("Too many validators: {len}"))]
    TooLarge {
        len: usize,
    },
    #[snafu(display("Duplicate validator: {pubkey}"))]
    Duplicate {
        pubkey: PeerPubkey,
    },
}

/// Validators in their stable ranking order
///
/// The rank of a validator is its [`PeerIdx`]. Unlike a plain set the order
/// is significant: primaries rotate through it.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet(Vec<PeerPubkey>);

impl ops::Deref for ValidatorSet {
    type Target = [PeerPubkey];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ValidatorSet {
    pub fn new(validators: Vec<PeerPubkey>) -> Result<Self, ValidatorSetError> {
        ensure!(!validators.is_empty(), EmptySnafu);
        ensure!(
            validators.len() <= usize::from(u8::MAX),
            TooLargeSnafu {
                len: validators.len()
            }
        );
        for (i, pubkey) in validators.iter().enumerate() {
            ensure!(
                !validators[..i].contains(pubkey),
                DuplicateSnafu { pubkey: *pubkey }
            );
        }
        Ok(Self(validators))
    }

    pub fn num_peers(&self) -> NumPeers {
        self.0.to_num_peers()
    }

    pub fn as_slice(&self) -> &[PeerPubkey] {
        &self.0
    }

    pub fn get(&self, peer_idx: PeerIdx) -> Option<PeerPubkey> {
        self.0.get(peer_idx.as_usize()).copied()
    }

    pub fn contains_idx(&self, peer_idx: PeerIdx) -> bool {
        peer_idx.as_usize() < self.0.len()
    }

    pub fn find_idx(&self, pubkey: PeerPubkey) -> Option<PeerIdx> {
        self.0.iter().position(|p| *p == pubkey).map(|i| {
            let i: u8 = i.try_into().expect("Validator set size checked at creation");
            PeerIdx::from(i)
        })
    }

    /// The primary of `view`: the validator ranked `view mod n`
    pub fn primary_for(&self, view: ViewNo) -> PeerIdx {
        let n: u64 = u64::try_from(self.0.len()).expect("usize fits in u64");
        let idx: u8 = (view.to_number() % n)
            .try_into()
            .expect("Validator set size checked at creation");
        PeerIdx::from(idx)
    }

    pub fn peer_idx_iter(&self) -> impl Iterator<Item = PeerIdx> {
        self.num_peers().peer_idx_iter()
    }
}
