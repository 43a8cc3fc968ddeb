//! Messages exchanged between replicas
//!
//! Every message type is individually [`Signable`] with its own tag, and
//! [`ConsensusMessage`] delegates to the variant it wraps. A signature over a
//! [`Prepare`] taken off the wire can thus be stored in a certificate and
//! verified on its own later.
use bincode::{Decode, Encode};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::bincode::{CONSENSUS_BINCODE_CONFIG, decode_whole};
use crate::cert::{CheckpointCertificate, PreparedCertificate};
use crate::digest::{BatchDigest, CheckpointDigest, RequestId};
use crate::peer::PeerIdx;
use crate::signed::{Hashable, Signable, Signed};
use crate::timestamp::Timestamp;
use crate::view::{InstanceId, SeqNo, ThreePhaseKey, ViewNo};

/// Primary's proposal of a request batch for a key
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PrePrepare {
    pub inst_id: InstanceId,
    pub key: ThreePhaseKey,
    pub digest: BatchDigest,
    pub requests: Vec<RequestId>,
    pub timestamp: Timestamp,
}

impl PrePrepare {
    pub fn new(
        inst_id: InstanceId,
        key: ThreePhaseKey,
        requests: Vec<RequestId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            inst_id,
            key,
            digest: BatchDigest::compute(&requests),
            requests,
            timestamp,
        }
    }

    /// Empty batches are proposed only to show the primary is alive
    pub fn is_freshness(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn has_valid_digest(&self) -> bool {
        self.digest == BatchDigest::compute(&self.requests)
    }

    pub fn to_prepare(&self) -> Prepare {
        Prepare {
            inst_id: self.inst_id,
            key: self.key,
            digest: self.digest,
        }
    }

    pub fn to_commit(&self) -> Commit {
        Commit {
            inst_id: self.inst_id,
            key: self.key,
            digest: self.digest,
        }
    }
}

impl Hashable for PrePrepare {}
impl Signable for PrePrepare {
    const TAG: [u8; 4] = *b"ppre";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Prepare {
    pub inst_id: InstanceId,
    pub key: ThreePhaseKey,
    pub digest: BatchDigest,
}

impl Hashable for Prepare {}
impl Signable for Prepare {
    const TAG: [u8; 4] = *b"prep";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Commit {
    pub inst_id: InstanceId,
    pub key: ThreePhaseKey,
    pub digest: BatchDigest,
}

impl Hashable for Commit {}
impl Signable for Commit {
    const TAG: [u8; 4] = *b"cmit";
}

/// A replica's digest of the ordered log over `seq_start..=seq_end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Checkpoint {
    pub inst_id: InstanceId,
    pub view: ViewNo,
    pub seq_start: SeqNo,
    pub seq_end: SeqNo,
    pub digest: CheckpointDigest,
}

impl Hashable for Checkpoint {}
impl Signable for Checkpoint {
    const TAG: [u8; 4] = *b"chkp";
}

/// Why a replica wants to replace the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Display, Serialize, Deserialize)]
pub enum SuspicionReason {
    /// No batch got ordered for several freshness intervals
    FreshnessStalled,
    /// A pre-prepared key did not commit in time
    KeyStalled,
    /// A gap in the PrePrepare sequence was not filled in time
    GapTimeout,
    /// The primary of the target view sent an invalid `NewView`
    InvalidNewView,
}

/// Vote to replace the primary of the view before `target_view`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Suspicion {
    pub inst_id: InstanceId,
    pub target_view: ViewNo,
    pub reason: SuspicionReason,
}

impl Hashable for Suspicion {}
impl Signable for Suspicion {
    const TAG: [u8; 4] = *b"susp";
}

/// A replica's view change vote: its stable checkpoint and everything
/// prepared above it
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ViewChangeVote {
    pub inst_id: InstanceId,
    pub target_view: ViewNo,
    /// `None` is the genesis checkpoint
    pub stable_checkpoint: Option<CheckpointCertificate>,
    pub prepared: Vec<PreparedCertificate>,
}

impl ViewChangeVote {
    pub fn stable_seq(&self) -> SeqNo {
        self.stable_checkpoint
            .as_ref()
            .map(|cert| cert.seq_end)
            .unwrap_or(SeqNo::ZERO)
    }
}

impl Hashable for ViewChangeVote {}
impl Signable for ViewChangeVote {
    const TAG: [u8; 4] = *b"vcvt";
}

/// New primary's installation of its view
///
/// Carries the quorum of votes it merged, so every backup can recompute the
/// merge and compare it with `pre_prepares`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct NewView {
    pub inst_id: InstanceId,
    pub view: ViewNo,
    pub votes: Vec<(PeerIdx, Signed<ViewChangeVote>)>,
    pub pre_prepares: Vec<Signed<PrePrepare>>,
}

impl Hashable for NewView {}
impl Signable for NewView {
    const TAG: [u8; 4] = *b"nvie";
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Display, Serialize,
)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
}

/// Ask a peer for a three-phase message it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MessageReq {
    pub inst_id: InstanceId,
    pub kind: MessageKind,
    pub key: ThreePhaseKey,
}

impl Hashable for MessageReq {}
impl Signable for MessageReq {
    const TAG: [u8; 4] = *b"mreq";
}

/// A three-phase message with its author's signature
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, From)]
pub enum ThreePhaseMessage {
    PrePrepare(Signed<PrePrepare>),
    Prepare(Signed<Prepare>),
    Commit(Signed<Commit>),
}

impl ThreePhaseMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ThreePhaseMessage::PrePrepare(_) => MessageKind::PrePrepare,
            ThreePhaseMessage::Prepare(_) => MessageKind::Prepare,
            ThreePhaseMessage::Commit(_) => MessageKind::Commit,
        }
    }

    pub fn key(&self) -> ThreePhaseKey {
        match self {
            ThreePhaseMessage::PrePrepare(m) => m.key,
            ThreePhaseMessage::Prepare(m) => m.key,
            ThreePhaseMessage::Commit(m) => m.key,
        }
    }

    /// Convert back into a message as if received directly from its author
    pub fn into_signed_message(self) -> Signed<ConsensusMessage> {
        match self {
            ThreePhaseMessage::PrePrepare(m) => {
                Signed::new(ConsensusMessage::PrePrepare(m.inner), m.sig)
            }
            ThreePhaseMessage::Prepare(m) => Signed::new(ConsensusMessage::Prepare(m.inner), m.sig),
            ThreePhaseMessage::Commit(m) => Signed::new(ConsensusMessage::Commit(m.inner), m.sig),
        }
    }
}

/// Reply to a [`MessageReq`], relaying a message signed by `author`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MessageRep {
    pub inst_id: InstanceId,
    pub author: PeerIdx,
    pub message: ThreePhaseMessage,
}

impl Hashable for MessageRep {}
impl Signable for MessageRep {
    const TAG: [u8; 4] = *b"mrep";
}

/// Every message a replica can receive
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, From)]
pub enum ConsensusMessage {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    Suspicion(Suspicion),
    ViewChangeVote(ViewChangeVote),
    NewView(NewView),
    MessageReq(MessageReq),
    MessageRep(MessageRep),
}

impl ConsensusMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::Checkpoint(_) => "Checkpoint",
            ConsensusMessage::Suspicion(_) => "Suspicion",
            ConsensusMessage::ViewChangeVote(_) => "ViewChangeVote",
            ConsensusMessage::NewView(_) => "NewView",
            ConsensusMessage::MessageReq(_) => "MessageReq",
            ConsensusMessage::MessageRep(_) => "MessageRep",
        }
    }

    pub fn inst_id(&self) -> InstanceId {
        match self {
            ConsensusMessage::PrePrepare(m) => m.inst_id,
            ConsensusMessage::Prepare(m) => m.inst_id,
            ConsensusMessage::Commit(m) => m.inst_id,
            ConsensusMessage::Checkpoint(m) => m.inst_id,
            ConsensusMessage::Suspicion(m) => m.inst_id,
            ConsensusMessage::ViewChangeVote(m) => m.inst_id,
            ConsensusMessage::NewView(m) => m.inst_id,
            ConsensusMessage::MessageReq(m) => m.inst_id,
            ConsensusMessage::MessageRep(m) => m.inst_id,
        }
    }

    /// Key of a three-phase message
    pub fn three_phase_key(&self) -> Option<ThreePhaseKey> {
        match self {
            ConsensusMessage::PrePrepare(m) => Some(m.key),
            ConsensusMessage::Prepare(m) => Some(m.key),
            ConsensusMessage::Commit(m) => Some(m.key),
            _ => None,
        }
    }

    /// The sequence number this message is about, if any
    pub fn seq(&self) -> Option<SeqNo> {
        match self {
            ConsensusMessage::Checkpoint(m) => Some(m.seq_end),
            _ => self.three_phase_key().map(|key| key.seq),
        }
    }

    /// The view this message belongs to, if any
    pub fn view(&self) -> Option<ViewNo> {
        match self {
            ConsensusMessage::Suspicion(m) => Some(m.target_view),
            ConsensusMessage::ViewChangeVote(m) => Some(m.target_view),
            ConsensusMessage::NewView(m) => Some(m.view),
            _ => self.three_phase_key().map(|key| key.view),
        }
    }
}

impl Hashable for ConsensusMessage {}
impl Signable for ConsensusMessage {
    const TAG: [u8; 4] = *b"cmsg";

    fn sign_hash(&self) -> blake3::Hash {
        match self {
            ConsensusMessage::PrePrepare(m) => m.sign_hash(),
            ConsensusMessage::Prepare(m) => m.sign_hash(),
            ConsensusMessage::Commit(m) => m.sign_hash(),
            ConsensusMessage::Checkpoint(m) => m.sign_hash(),
            ConsensusMessage::Suspicion(m) => m.sign_hash(),
            ConsensusMessage::ViewChangeVote(m) => m.sign_hash(),
            ConsensusMessage::NewView(m) => m.sign_hash(),
            ConsensusMessage::MessageReq(m) => m.sign_hash(),
            ConsensusMessage::MessageRep(m) => m.sign_hash(),
        }
    }
}

/// A signed message together with the validator that sent it
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Envelope {
    pub sender: PeerIdx,
    pub msg: Signed<ConsensusMessage>,
}

impl Envelope {
    pub fn new(sender: PeerIdx, msg: Signed<ConsensusMessage>) -> Self {
        Self { sender, msg }
    }

    /// Wire encoding
    pub fn encode_to_vec(&self) -> Vec<u8> {
        bincode::encode_to_vec(self, CONSENSUS_BINCODE_CONFIG).expect("Can't fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        decode_whole(bytes, CONSENSUS_BINCODE_CONFIG)
    }
}

#[cfg(test)]
mod tests;
