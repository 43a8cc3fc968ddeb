// SPDX-License-Identifier: MIT

//! Core types of the Ordo consensus
//!
//! Identifiers, digests, keys and signatures, the messages replicas exchange
//! and the certificates built from them. Everything that ends up hashed,
//! signed or sent over the wire is defined here, together with its encoding.

#[macro_use]
mod macros;

pub mod bincode;
pub mod cert;
pub mod digest;
pub mod msg;
pub mod num_peers;
pub mod peer;
pub mod signed;
pub mod timestamp;
pub mod validator_set;
pub mod view;

bytes_type_define! {
    pub struct Signature[64];
}
bytes_type_impl_display!(Signature);

impl From<Signature> for ed25519_dalek::Signature {
    fn from(value: Signature) -> Self {
        ed25519_dalek::Signature::from_bytes(&value.0)
    }
}
impl From<ed25519_dalek::Signature> for Signature {
    fn from(value: ed25519_dalek::Signature) -> Self {
        Self(value.to_bytes())
    }
}
