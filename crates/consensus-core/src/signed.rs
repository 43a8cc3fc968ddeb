use std::io::Write as _;
use std::ops;

use bincode::{Decode, Encode};
use ed25519_dalek::Signer as _;
use snafu::{OptionExt as _, Snafu};

use crate::Signature;
use crate::bincode::CONSENSUS_BINCODE_CONFIG;
use crate::peer::{PeerPubkey, PeerSeckey};

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSignatureError;

pub type InvalidSignatureResult<T> = Result<T, InvalidSignatureError>;

pub trait Hashable: bincode::Encode {
    fn hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();

        bincode::encode_into_std_write(self, &mut hasher, CONSENSUS_BINCODE_CONFIG)
            .expect("Can't fail");

        hasher.finalize()
    }
}

/// A message that can be signed/verified by [`PeerPubkey`] identity
pub trait Signable: Hashable {
    /// Unique tag preventing two different type of messages with the same
    /// encoding from conflicting with each other
    const TAG: [u8; 4];

    fn sign_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();

        hasher.write_all(b"ordo").expect("Can't fail");
        hasher.write_all(&Self::TAG).expect("Can't fail");
        hasher
            .write_all(self.hash().as_bytes())
            .expect("Can't fail");

        hasher.finalize()
    }

    fn sign_with(&self, seckey: PeerSeckey) -> Signature {
        ed25519_dalek::SigningKey::from(seckey)
            .sign(self.sign_hash().as_bytes())
            .into()
    }

    fn verify_signature(&self, pubkey: PeerPubkey, sig: Signature) -> InvalidSignatureResult<()> {
        ed25519_dalek::VerifyingKey::try_from(pubkey)
            .ok()
            .context(InvalidSignatureSnafu)?
            .verify_strict(self.sign_hash().as_bytes(), &sig.into())
            .ok()
            .context(InvalidSignatureSnafu)?;
        Ok(())
    }
}

#[derive(Decode, Encode, Clone, Debug, PartialEq, Eq)]
pub struct Signed<T> {
    pub inner: T,
    pub sig: Signature,
}

impl<T> Signed<T>
where
    T: Signable,
{
    pub fn new(inner: T, sig: Signature) -> Self {
        Self { inner, sig }
    }

    pub fn new_sign(inner: T, seckey: PeerSeckey) -> Self {
        let sig = inner.sign_with(seckey);
        Self { inner, sig }
    }

    pub fn verify_sig(&self, pubkey: PeerPubkey) -> InvalidSignatureResult<()> {
        self.inner.verify_signature(pubkey, self.sig)
    }
}

impl<T> ops::Deref for Signed<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
