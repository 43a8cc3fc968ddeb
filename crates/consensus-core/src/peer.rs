use core::fmt;

use bincode::{Decode, Encode};
use convi::CastInto as _;
use derive_more::From;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Validator index
///
/// The validator set is known to every replica, so validators are referred
/// to by their rank in it.
#[derive(
    Encode,
    Decode,
    Serialize,
    Deserialize,
    From,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Clone,
    Copy,
)]
pub struct PeerIdx(u8);

impl fmt::Display for PeerIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl PeerIdx {
    pub const MIN: Self = PeerIdx(0x00);
    pub const MAX: Self = PeerIdx(0xff);

    pub const fn new(i: u8) -> Self {
        Self(i)
    }

    pub fn as_usize(self) -> usize {
        self.0.cast_into()
    }
}

impl From<PeerIdx> for usize {
    fn from(value: PeerIdx) -> Self {
        usize::from(value.0)
    }
}

bytes_type_define! {
    /// Validator identity: an ed25519 public key
    pub struct PeerPubkey[32];
}
bytes_type_impl_display!(PeerPubkey);

impl PeerPubkey {
    pub fn to_short(self) -> PeerPubkeyShort {
        PeerPubkeyShort(self)
    }
}

/// Abbreviated pubkey, for logs
pub struct PeerPubkeyShort(PeerPubkey);

impl fmt::Display for PeerPubkeyShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "{}...",
            data_encoding::BASE32_DNSCURVE.encode_display(&self.0.as_slice()[0..5]),
        ))
    }
}

#[derive(Debug, Snafu)]
pub struct InvalidPubkeyError;

impl TryFrom<PeerPubkey> for ed25519_dalek::VerifyingKey {
    type Error = InvalidPubkeyError;

    fn try_from(value: PeerPubkey) -> Result<Self, Self::Error> {
        ed25519_dalek::VerifyingKey::from_bytes(&value.0).map_err(|_| InvalidPubkeyError)
    }
}

bytes_type_define! {
    pub struct PeerSeckey[32];
}

impl fmt::Debug for PeerSeckey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerSeckey(..)")
    }
}

impl PeerSeckey {
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::thread_rng()).to_bytes())
    }

    pub fn pubkey(self) -> PeerPubkey {
        PeerPubkey(
            ed25519_dalek::SigningKey::from(self)
                .verifying_key()
                .to_bytes(),
        )
    }
}

impl From<PeerSeckey> for ed25519_dalek::SigningKey {
    fn from(value: PeerSeckey) -> Self {
        ed25519_dalek::SigningKey::from_bytes(&value.0)
    }
}
