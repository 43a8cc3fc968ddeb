//! Collaborators a replica is wired with
//!
//! Everything outside of the protocol itself: transport, execution, signing,
//! time and the node supervisor. Implementations are expected to be cheap and
//! non-blocking, they are called from within the serialized state machine.
use std::time::Duration;

use derive_more::{Display, From};
use ordo_consensus_core::Signature;
use ordo_consensus_core::digest::{CheckpointDigest, RequestId};
use ordo_consensus_core::msg::ConsensusMessage;
use ordo_consensus_core::peer::{PeerIdx, PeerPubkey, PeerSeckey};
use ordo_consensus_core::signed::{Signable as _, Signed};
use ordo_consensus_core::view::{SeqNo, ThreePhaseKey, ViewNo};

/// Message transport
pub trait Network: Send {
    /// Send to every validator but us
    fn broadcast(&mut self, msg: Signed<ConsensusMessage>);
    fn send(&mut self, peer_idx: PeerIdx, msg: Signed<ConsensusMessage>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Applied,
    Rejected { reason: String },
}

/// Execution layer consuming the ordered log
pub trait Executor: Send {
    /// Called exactly once per sequence number, in order
    ///
    /// Rejected requests are an application matter and never stall ordering.
    fn apply_ordered_batch(&mut self, seq: SeqNo, requests: &[RequestId]) -> Vec<RequestOutcome>;
}

/// Signing capability of the local validator
pub trait Signer: Send {
    fn pubkey(&self) -> PeerPubkey;
    fn sign(&self, msg: &ConsensusMessage) -> Signature;
}

impl Signer for PeerSeckey {
    fn pubkey(&self) -> PeerPubkey {
        PeerSeckey::pubkey(*self)
    }

    fn sign(&self, msg: &ConsensusMessage) -> Signature {
        msg.sign_with(*self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct TimerHandle(u64);

/// Timeouts a replica asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerEvent {
    /// Periodic liveness probe
    Freshness,
    /// A pre-prepared key should have committed by now
    KeyStalled(ThreePhaseKey),
    /// The PrePrepare for this key should have arrived by now
    GapTimeout(ThreePhaseKey),
    /// The view change to this view should have completed by now
    ViewChangeTimeout(ViewNo),
}

/// Timer service; fired events are fed back as [`crate::ReplicaEvent::Timeout`]
pub trait Timer: Send {
    fn schedule(&mut self, after: Duration, event: TimerEvent) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FaultKind {
    UnknownSender,
    InvalidSignature,
    WrongInstance,
    WrongPrimary,
    DigestMismatch,
    Equivocation,
    InvalidCertificate,
    InvalidNewView,
    MalformedMessage,
    UnsolicitedReply,
    StashOverflow,
    CheckpointMismatch,
}

/// Evidence of a misbehaving peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvidence {
    pub peer_idx: PeerIdx,
    pub kind: FaultKind,
    pub msg_type: &'static str,
    pub key: Option<ThreePhaseKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    ViewInstalled { view: ViewNo, primary: PeerIdx },
    CheckpointStabilized { seq: SeqNo, digest: CheckpointDigest },
    /// A quorum is ahead of us: state has to be transferred before we can
    /// continue ordering past `till`
    CatchupNeeded { till: SeqNo },
    Halted { reason: String },
}

/// Node-level sink for everything that needs attention beyond the protocol
pub trait NodeSupervisor: Send {
    fn report_fault(&mut self, evidence: FaultEvidence);
    fn on_event(&mut self, event: NodeEvent);
}
