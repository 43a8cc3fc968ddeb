//! Per-call context handed to the services
//!
//! Services never talk to collaborators directly: they read the shared state
//! and push their effects into the [`Outbox`], which the replica flushes
//! after every call.
use std::collections::VecDeque;
use std::time::Duration;

use ordo_consensus_core::Signature;
use ordo_consensus_core::cert::CheckpointCertificate;
use ordo_consensus_core::digest::{BatchDigest, RequestId};
use ordo_consensus_core::msg::{ConsensusMessage, MessageKind, NewView, SuspicionReason};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::{SeqNo, ThreePhaseKey, ViewNo};

use crate::config::ConsensusConfig;
use crate::env::{FaultEvidence, FaultKind, Signer, TimerEvent};
use crate::error::FatalError;
use crate::shared_state::SharedConsensusState;
use crate::stasher::ReadinessCondition;

/// What happened to an inbound message that was not rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Accepted,
    /// Already known, nothing changed
    Duplicate,
    /// Refers to a view or checkpoint we moved past
    Stale,
    /// Not processable yet; park until the condition holds
    Stash(ReadinessCondition),
}

#[derive(Debug)]
pub(crate) enum Outgoing {
    Broadcast(Signed<ConsensusMessage>),
    Send(PeerIdx, Signed<ConsensusMessage>),
}

pub(crate) enum TimerCommand {
    Schedule(Duration, TimerEvent),
    Cancel(TimerEvent),
}

/// Events services raise for the replica (and so for each other)
#[derive(Debug)]
pub(crate) enum Internal {
    /// A committed batch is next in the log (or re-affirms an ordered one)
    Ordered {
        key: ThreePhaseKey,
        digest: BatchDigest,
        requests: Vec<RequestId>,
    },
    Stabilized(CheckpointCertificate),
    SuspectPrimary(SuspicionReason),
    StartViewChange(ViewNo),
    InstallNewView(NewView),
    RequestMissing {
        kind: MessageKind,
        key: ThreePhaseKey,
    },
    CatchupNeeded(SeqNo),
    Fatal(FatalError),
}

#[derive(Default)]
pub(crate) struct Outbox {
    pub(crate) outgoing: Vec<Outgoing>,
    pub(crate) timers: Vec<TimerCommand>,
    pub(crate) internal: VecDeque<Internal>,
    pub(crate) faults: Vec<FaultEvidence>,
}

pub(crate) struct Ctx<'a> {
    pub(crate) state: &'a SharedConsensusState,
    pub(crate) config: &'a ConsensusConfig,
    signer: &'a dyn Signer,
    out: &'a mut Outbox,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        state: &'a SharedConsensusState,
        config: &'a ConsensusConfig,
        signer: &'a dyn Signer,
        out: &'a mut Outbox,
    ) -> Self {
        Self {
            state,
            config,
            signer,
            out,
        }
    }

    pub(crate) fn sign(&self, msg: &ConsensusMessage) -> Signature {
        self.signer.sign(msg)
    }

    /// Sign and broadcast, returning our signature
    pub(crate) fn broadcast(&mut self, msg: impl Into<ConsensusMessage>) -> Signature {
        let msg = msg.into();
        let sig = self.sign(&msg);
        self.out
            .outgoing
            .push(Outgoing::Broadcast(Signed::new(msg, sig)));
        sig
    }

    pub(crate) fn send(&mut self, peer_idx: PeerIdx, msg: impl Into<ConsensusMessage>) {
        let msg = msg.into();
        let sig = self.sign(&msg);
        self.out
            .outgoing
            .push(Outgoing::Send(peer_idx, Signed::new(msg, sig)));
    }

    pub(crate) fn emit(&mut self, event: Internal) {
        self.out.internal.push_back(event);
    }

    pub(crate) fn fault(
        &mut self,
        peer_idx: PeerIdx,
        kind: FaultKind,
        msg_type: &'static str,
        key: Option<ThreePhaseKey>,
    ) {
        self.out.faults.push(FaultEvidence {
            peer_idx,
            kind,
            msg_type,
            key,
        });
    }

    /// (Re)arm a timer; an armed timer for the same event is replaced
    pub(crate) fn schedule(&mut self, after: Duration, event: TimerEvent) {
        self.out.timers.push(TimerCommand::Schedule(after, event));
    }

    pub(crate) fn cancel(&mut self, event: TimerEvent) {
        self.out.timers.push(TimerCommand::Cancel(event));
    }
}
