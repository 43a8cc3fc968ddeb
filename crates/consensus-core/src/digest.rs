use std::io::Write as _;

use crate::bincode::CONSENSUS_BINCODE_CONFIG;

bytes_type_define! {
    /// Client request identifier
    pub struct RequestId[32];
}
bytes_type_impl_display!(RequestId);

bytes_type_define! {
    /// Hash of an ordered request batch
    pub struct BatchDigest[32];
}
bytes_type_impl_display!(BatchDigest);

bytes_type_define! {
    /// Hash chaining all batches ordered up to a checkpoint
    pub struct CheckpointDigest[32];
}
bytes_type_impl_display!(CheckpointDigest);

impl From<blake3::Hash> for RequestId {
    fn from(value: blake3::Hash) -> Self {
        Self(value.into())
    }
}

impl RequestId {
    /// Request id derived from arbitrary request content
    pub fn from_content(content: &[u8]) -> Self {
        blake3::hash(content).into()
    }
}

impl BatchDigest {
    const TAG: &[u8; 4] = b"obat";

    pub fn compute(requests: &[RequestId]) -> Self {
        let mut hasher = blake3::Hasher::new();

        hasher.write_all(Self::TAG).expect("Can't fail");
        bincode::encode_into_std_write(requests, &mut hasher, CONSENSUS_BINCODE_CONFIG)
            .expect("Can't fail");

        Self(hasher.finalize().into())
    }
}

impl CheckpointDigest {
    const TAG: &[u8; 4] = b"ochk";

    /// Digest of a checkpoint, given the previous one and the batches since
    pub fn chain(prev: CheckpointDigest, batches: &[BatchDigest]) -> Self {
        let mut hasher = blake3::Hasher::new();

        hasher.write_all(Self::TAG).expect("Can't fail");
        hasher.write_all(prev.as_slice()).expect("Can't fail");
        bincode::encode_into_std_write(batches, &mut hasher, CONSENSUS_BINCODE_CONFIG)
            .expect("Can't fail");

        Self(hasher.finalize().into())
    }
}

#[test]
fn batch_digest_depends_on_order() {
    let a = RequestId::from_content(b"a");
    let b = RequestId::from_content(b"b");

    assert_eq!(BatchDigest::compute(&[a, b]), BatchDigest::compute(&[a, b]));
    assert_ne!(BatchDigest::compute(&[a, b]), BatchDigest::compute(&[b, a]));
    assert_ne!(BatchDigest::compute(&[]), BatchDigest::compute(&[a]));
}

#[test]
fn checkpoint_digest_chains() {
    let d1 = BatchDigest::compute(&[RequestId::from_content(b"x")]);
    let first = CheckpointDigest::chain(CheckpointDigest::ZERO, &[d1]);

    assert_ne!(first, CheckpointDigest::chain(first, &[d1]));
    assert_eq!(first, CheckpointDigest::chain(CheckpointDigest::ZERO, &[d1]));
}
