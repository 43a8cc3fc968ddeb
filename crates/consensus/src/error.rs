use ordo_consensus_core::digest::{BatchDigest, CheckpointDigest};
use ordo_consensus_core::view::{SeqNo, ViewNo};
use snafu::Snafu;

use crate::env::FaultKind;

/// Local state would break a safety invariant; the replica halts
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum FatalError {
    #[snafu(display("View would decrease from {current} to {new}"))]
    ViewDecreased { current: ViewNo, new: ViewNo },
    #[snafu(display("Ordering seq {seq} after {last_ordered}"))]
    OrderingGap { last_ordered: SeqNo, seq: SeqNo },
    #[snafu(display("Seq {seq} re-committed as {new}, originally ordered as {original}"))]
    ReaffirmationMismatch {
        seq: SeqNo,
        original: BatchDigest,
        new: BatchDigest,
    },
    #[snafu(display("Stable checkpoint would regress from {current} to {new}"))]
    StableCheckpointRegressed { current: SeqNo, new: SeqNo },
    #[snafu(display("Own checkpoint at {seq} is {own}, a quorum agreed on {quorum}"))]
    CheckpointDiverged {
        seq: SeqNo,
        own: CheckpointDigest,
        quorum: CheckpointDigest,
    },
    #[snafu(display("Replica has halted"))]
    Halted,
}

pub type FatalResult<T> = Result<T, FatalError>;

/// Protocol faults map to the evidence reported about their sender
pub trait AsFault {
    fn fault_kind(&self) -> FaultKind;
}
