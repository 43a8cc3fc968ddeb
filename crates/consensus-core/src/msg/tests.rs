use std::collections::BTreeMap;

use assert_matches::assert_matches;

use super::*;
use crate::cert::InvalidCertificateError;
use crate::peer::PeerSeckey;
use crate::validator_set::ValidatorSet;

struct Keys {
    seckeys: Vec<PeerSeckey>,
    validators: ValidatorSet,
}

impl Keys {
    fn new(n: usize) -> Self {
        let seckeys: Vec<_> = (0..n).map(|_| PeerSeckey::generate()).collect();
        let validators =
            ValidatorSet::new(seckeys.iter().map(|s| s.pubkey()).collect()).expect("valid");
        Self {
            seckeys,
            validators,
        }
    }

    fn seckey(&self, i: u8) -> PeerSeckey {
        self.seckeys[usize::from(i)]
    }
}

const INST: InstanceId = InstanceId::new(0);

fn pre_prepare(view: u64, seq: u64) -> PrePrepare {
    PrePrepare::new(
        INST,
        ThreePhaseKey::new(ViewNo::new(view), SeqNo::new(seq)),
        vec![RequestId::from_content(b"req")],
        Timestamp::from_micros(1),
    )
}

fn prepared_cert(keys: &Keys, pp: PrePrepare, backups: &[u8]) -> PreparedCertificate {
    let primary = keys.validators.primary_for(pp.key.view);
    let prepare = pp.to_prepare();
    PreparedCertificate {
        prepares: backups
            .iter()
            .map(|i| (PeerIdx::new(*i), prepare.sign_with(keys.seckey(*i))))
            .collect(),
        pre_prepare: Signed::new_sign(pp, keys.seckeys[primary.as_usize()]),
    }
}

#[test]
fn envelope_signature_covers_inner_message() {
    let keys = Keys::new(4);
    let prepare = pre_prepare(0, 1).to_prepare();

    // Signing the bare Prepare and the wrapped message gives the same signature
    let sig = prepare.sign_with(keys.seckey(1));
    let msg = Signed::new(ConsensusMessage::from(prepare), sig);
    assert_eq!(msg.verify_sig(keys.validators[1]), Ok(()));
    assert!(msg.verify_sig(keys.validators[2]).is_err());

    let commit = Commit {
        inst_id: prepare.inst_id,
        key: prepare.key,
        digest: prepare.digest,
    };
    // Same fields, different message type
    assert!(commit.verify_signature(keys.validators[1], sig).is_err());
}

#[test]
fn envelope_wire_encoding() {
    let keys = Keys::new(1);
    let env = Envelope::new(
        PeerIdx::new(0),
        Signed::new_sign(ConsensusMessage::from(pre_prepare(3, 7)), keys.seckey(0)),
    );

    let bytes = env.encode_to_vec();
    assert_eq!(Envelope::decode(&bytes).expect("valid encoding"), env);

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert!(Envelope::decode(&trailing).is_err());
}

#[test]
fn prepared_certificate_verification() {
    let keys = Keys::new(4);

    let cert = prepared_cert(&keys, pre_prepare(1, 5), &[0, 2]);
    assert_eq!(cert.verify(INST, &keys.validators), Ok(()));

    let short = prepared_cert(&keys, pre_prepare(1, 5), &[2]);
    assert_matches!(
        short.verify(INST, &keys.validators),
        Err(InvalidCertificateError::NotEnoughSignatures { got: 1, needed: 2 })
    );

    // Primary of view 1 is peer 1, it does not prepare
    let with_primary = prepared_cert(&keys, pre_prepare(1, 5), &[1, 2]);
    assert_matches!(
        with_primary.verify(INST, &keys.validators),
        Err(InvalidCertificateError::PrepareFromPrimary { .. })
    );

    let mut tampered = prepared_cert(&keys, pre_prepare(1, 5), &[0, 2]);
    tampered.pre_prepare.inner.requests.push(RequestId::from_content(b"extra"));
    assert_matches!(
        tampered.verify(INST, &keys.validators),
        Err(InvalidCertificateError::PrePrepareDigestMismatch)
    );

    assert_matches!(
        cert.verify(InstanceId::new(1), &keys.validators),
        Err(InvalidCertificateError::WrongInstance { .. })
    );
}

fn checkpoint_cert(keys: &Keys, signers: &[u8], digest: CheckpointDigest) -> CheckpointCertificate {
    let checkpoints: BTreeMap<_, _> = signers
        .iter()
        .map(|i| {
            let checkpoint = Checkpoint {
                inst_id: INST,
                view: ViewNo::new(u64::from(*i % 2)),
                seq_start: SeqNo::new(1),
                seq_end: SeqNo::new(10),
                digest,
            };
            (PeerIdx::new(*i), Signed::new_sign(checkpoint, keys.seckey(*i)))
        })
        .collect();
    CheckpointCertificate {
        seq_end: SeqNo::new(10),
        digest,
        checkpoints,
    }
}

#[test]
fn checkpoint_certificate_verification() {
    let keys = Keys::new(4);
    let digest = CheckpointDigest::chain(CheckpointDigest::ZERO, &[]);

    assert_eq!(
        checkpoint_cert(&keys, &[0, 1, 3], digest).verify(INST, &keys.validators),
        Ok(())
    );
    assert_matches!(
        checkpoint_cert(&keys, &[0, 1], digest).verify(INST, &keys.validators),
        Err(InvalidCertificateError::NotEnoughSignatures { .. })
    );

    let mut forged = checkpoint_cert(&keys, &[0, 1, 3], digest);
    forged.digest = CheckpointDigest::ZERO;
    assert_matches!(
        forged.verify(INST, &keys.validators),
        Err(InvalidCertificateError::CheckpointMismatch { .. })
    );
}

#[test]
fn view_change_vote_verification() {
    let keys = Keys::new(4);
    let digest = CheckpointDigest::chain(CheckpointDigest::ZERO, &[]);

    let vote = ViewChangeVote {
        inst_id: INST,
        target_view: ViewNo::new(2),
        stable_checkpoint: Some(checkpoint_cert(&keys, &[0, 1, 2], digest)),
        prepared: vec![
            prepared_cert(&keys, pre_prepare(0, 11), &[1, 2]),
            prepared_cert(&keys, pre_prepare(1, 12), &[2, 3]),
        ],
    };
    assert_eq!(vote.stable_seq(), SeqNo::new(10));
    assert_eq!(vote.verify(&keys.validators), Ok(()));

    let mut below = vote.clone();
    below
        .prepared
        .push(prepared_cert(&keys, pre_prepare(0, 9), &[1, 2]));
    assert_matches!(
        below.verify(&keys.validators),
        Err(InvalidCertificateError::BelowStableCheckpoint { .. })
    );

    let mut same_view = vote.clone();
    same_view
        .prepared
        .push(prepared_cert(&keys, pre_prepare(2, 13), &[0, 1]));
    assert_matches!(
        same_view.verify(&keys.validators),
        Err(InvalidCertificateError::NotBeforeTargetView { .. })
    );

    let mut duplicate = vote;
    duplicate
        .prepared
        .push(prepared_cert(&keys, pre_prepare(1, 11), &[0, 2]));
    assert_matches!(
        duplicate.verify(&keys.validators),
        Err(InvalidCertificateError::DuplicateSeq { .. })
    );
}

#[test]
fn message_accessors() {
    let pp = pre_prepare(2, 4);
    let key = pp.key;
    let msg = ConsensusMessage::from(pp);
    assert_eq!(msg.three_phase_key(), Some(key));
    assert_eq!(msg.view(), Some(ViewNo::new(2)));
    assert_eq!(msg.seq(), Some(SeqNo::new(4)));
    assert_eq!(msg.type_name(), "PrePrepare");

    let suspicion = ConsensusMessage::from(Suspicion {
        inst_id: INST,
        target_view: ViewNo::new(5),
        reason: SuspicionReason::KeyStalled,
    });
    assert_eq!(suspicion.three_phase_key(), None);
    assert_eq!(suspicion.view(), Some(ViewNo::new(5)));
}
