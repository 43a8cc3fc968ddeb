use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

number_type_define! {
    /// View number
    ///
    /// Identifies the primary (see [`crate::validator_set::ValidatorSet::primary_for`]).
    /// Never decreases, and advances only through a completed view change.
    pub struct ViewNo(u64);
}

number_type_define! {
    /// Position of a batch in the totally ordered log
    ///
    /// `0` is the genesis position, the first batch gets `1`.
    pub struct SeqNo(u64);
}

number_type_define! {
    /// Identifies a consensus instance
    ///
    /// Messages of a different instance are rejected at intake.
    pub struct InstanceId(u32);
}

impl ViewNo {
    pub fn saturating_add(self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }
}

impl SeqNo {
    /// Is this a checkpoint boundary for the given interval
    pub fn is_checkpoint_boundary(self, interval: u64) -> bool {
        self.0 != 0 && self.0 % interval == 0
    }

    pub fn saturating_sub(self, n: u64) -> Self {
        Self(self.0.saturating_sub(n))
    }

    pub fn saturating_add(self, n: u64) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// All sequence numbers in `(self, end]`
    pub fn range_after(self, end: SeqNo) -> impl Iterator<Item = SeqNo> {
        (self.0.saturating_add(1)..=end.0).map(SeqNo)
    }
}

/// The unit of agreement: a slot in a given view
///
/// Ordered by view first, which lets per-view ranges be scanned in a `BTreeMap`.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct ThreePhaseKey {
    pub view: ViewNo,
    pub seq: SeqNo,
}

impl ThreePhaseKey {
    pub const fn new(view: ViewNo, seq: SeqNo) -> Self {
        Self { view, seq }
    }

    /// First key of the view, for range scans
    pub const fn view_start(view: ViewNo) -> Self {
        Self {
            view,
            seq: SeqNo::ZERO,
        }
    }

    /// Last possible key of the view, for range scans
    pub const fn view_end(view: ViewNo) -> Self {
        Self {
            view,
            seq: SeqNo::MAX,
        }
    }
}

impl fmt::Display for ThreePhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.view, self.seq))
    }
}

#[test]
fn three_phase_key_orders_by_view_first() {
    let a = ThreePhaseKey::new(ViewNo::new(0), SeqNo::new(10));
    let b = ThreePhaseKey::new(ViewNo::new(1), SeqNo::new(1));
    assert!(a < b);
    assert!(ThreePhaseKey::view_end(ViewNo::new(0)) < b);
    assert_eq!(b.to_string(), "1:1");
}

#[test]
fn checkpoint_boundary_sanity() {
    assert!(!SeqNo::ZERO.is_checkpoint_boundary(100));
    assert!(!SeqNo::new(99).is_checkpoint_boundary(100));
    assert!(SeqNo::new(100).is_checkpoint_boundary(100));
    assert!(SeqNo::new(200).is_checkpoint_boundary(100));
    assert_eq!(
        SeqNo::new(3).range_after(SeqNo::new(5)).collect::<Vec<_>>(),
        vec![SeqNo::new(4), SeqNo::new(5)]
    );
    assert_eq!(SeqNo::new(5).range_after(SeqNo::new(5)).count(), 0);
}
