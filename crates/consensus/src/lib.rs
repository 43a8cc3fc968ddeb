// SPDX-License-Identifier: MIT

//! Three-phase BFT ordering core used in Ordo
//!
//! A replica agrees with its peers on a single totally ordered log of request
//! batches, tolerating `f` arbitrary faults among `3f + 1` validators.
//!
//! The implementation is deterministic and side-effect free. Everything
//! outside of the protocol (transport, execution, timers) is reached through
//! the traits in [`env`], and [`ReplicaService`] serializes all inputs, so
//! the same sequence of events always yields the same state and effects.
//! [`runner`] drives a replica from a tokio task.
//!
//! See [`replica`] for the processing cycle, and [`ordering`],
//! [`checkpoint`] and [`view_change`] for the protocol phases.

pub mod checkpoint;
pub mod config;
pub(crate) mod ctx;
pub mod env;
pub mod error;
pub mod freshness;
pub mod message_req;
pub mod ordering;
pub mod replica;
pub mod runner;
pub mod shared_state;
pub mod stasher;
mod tally;
pub mod view_change;

#[cfg(test)]
mod testing;

pub use config::ConsensusConfig;
pub use env::{Executor, Network, NodeSupervisor, Signer, Timer};
pub use replica::{InitError, ReplicaError, ReplicaEvent, ReplicaResult, ReplicaService};
pub use shared_state::ConsensusStateSnapshot;

pub(crate) const LOG_TARGET: &str = "ordo::consensus";
