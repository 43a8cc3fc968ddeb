//! Fixtures shared by the unit tests
use ordo_consensus_core::cert::PreparedCertificate;
use ordo_consensus_core::digest::RequestId;
use ordo_consensus_core::msg::{ConsensusMessage, Envelope, PrePrepare};
use ordo_consensus_core::peer::{PeerIdx, PeerSeckey};
use ordo_consensus_core::signed::{Signable as _, Signed};
use ordo_consensus_core::timestamp::Timestamp;
use ordo_consensus_core::validator_set::ValidatorSet;
use ordo_consensus_core::view::{InstanceId, SeqNo, ThreePhaseKey, ViewNo};

use crate::config::ConsensusConfig;
use crate::shared_state::{ReplicaIdentity, SharedConsensusState};

pub(crate) const INST: InstanceId = InstanceId::new(0);

pub(crate) struct Fixture {
    pub seckeys: Vec<PeerSeckey>,
    pub validators: ValidatorSet,
    pub config: ConsensusConfig,
}

impl Fixture {
    pub fn new(n: usize) -> Self {
        let seckeys: Vec<_> = (0..n).map(|_| PeerSeckey::generate()).collect();
        let validators =
            ValidatorSet::new(seckeys.iter().map(|s| s.pubkey()).collect()).expect("valid");
        Self {
            seckeys,
            validators,
            config: ConsensusConfig::builder()
                .checkpoint_interval(2)
                .log_size(6)
                .max_stash_per_sender(4)
                .build(),
        }
    }

    pub fn seckey(&self, i: u8) -> PeerSeckey {
        self.seckeys[usize::from(i)]
    }

    pub fn state(&self, our_idx: u8) -> SharedConsensusState {
        SharedConsensusState::new(
            ReplicaIdentity {
                instance_id: INST,
                node_name: format!("node-{our_idx}"),
                validators: self.validators.clone(),
                our_idx: PeerIdx::new(our_idx),
            },
            self.config.log_size,
        )
    }

    /// A message as sent by peer `from`
    pub fn envelope(&self, from: u8, msg: impl Into<ConsensusMessage>) -> Envelope {
        let msg = msg.into();
        let sig = msg.sign_with(self.seckey(from));
        Envelope::new(PeerIdx::new(from), Signed::new(msg, sig))
    }

    /// `pp` signed by its primary and prepared by every backup
    pub fn prepared_certificate(&self, pp: PrePrepare) -> PreparedCertificate {
        let primary = self.validators.primary_for(pp.key.view);
        let prepare = pp.to_prepare();
        let prepares = self
            .validators
            .peer_idx_iter()
            .filter(|idx| *idx != primary)
            .map(|idx| (idx, prepare.sign_with(self.seckeys[idx.as_usize()])))
            .collect();
        PreparedCertificate {
            pre_prepare: Signed::new_sign(pp, self.seckeys[primary.as_usize()]),
            prepares,
        }
    }
}

pub(crate) fn key(view: u64, seq: u64) -> ThreePhaseKey {
    ThreePhaseKey::new(ViewNo::new(view), SeqNo::new(seq))
}

pub(crate) fn requests(tag: &str) -> Vec<RequestId> {
    vec![RequestId::from_content(tag.as_bytes())]
}

pub(crate) fn pre_prepare(view: u64, seq: u64, tag: &str) -> PrePrepare {
    PrePrepare::new(INST, key(view, seq), requests(tag), Timestamp::from_micros(seq))
}
