//! Deferred delivery of messages that arrived too early
use std::collections::{BTreeMap, VecDeque};

use ordo_consensus_core::msg::Envelope;
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::view::{SeqNo, ViewNo};

use crate::shared_state::SharedConsensusState;

/// When a stashed message becomes processable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessCondition {
    /// The installed view is at least this
    ViewAtLeast(ViewNo),
    /// The ordered log reached this seq
    SeqCommitted(SeqNo),
    /// The stable checkpoint reached this seq
    CheckpointStable(SeqNo),
}

impl ReadinessCondition {
    pub fn is_ready(self, state: &SharedConsensusState) -> bool {
        match self {
            ReadinessCondition::ViewAtLeast(view) => view <= state.view(),
            ReadinessCondition::SeqCommitted(seq) => seq <= state.last_ordered(),
            ReadinessCondition::CheckpointStable(seq) => seq <= state.stable_seq(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StashedMessage {
    pub envelope: Envelope,
    pub condition: ReadinessCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashOutcome {
    Stashed,
    /// The sender exhausted its share; message dropped
    Overflow,
}

#[derive(Debug)]
pub struct MessageStasher {
    /// In arrival order
    entries: VecDeque<StashedMessage>,
    per_sender: BTreeMap<PeerIdx, usize>,
    max_per_sender: usize,
}

impl MessageStasher {
    pub fn new(max_per_sender: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            per_sender: BTreeMap::new(),
            max_per_sender,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len_for(&self, peer_idx: PeerIdx) -> usize {
        self.per_sender.get(&peer_idx).copied().unwrap_or_default()
    }

    pub fn stash(&mut self, envelope: Envelope, condition: ReadinessCondition) -> StashOutcome {
        let count = self.per_sender.entry(envelope.sender).or_default();
        if self.max_per_sender <= *count {
            return StashOutcome::Overflow;
        }
        *count += 1;
        self.entries.push_back(StashedMessage {
            envelope,
            condition,
        });
        StashOutcome::Stashed
    }

    /// Remove and return every message whose condition holds, in arrival order
    pub fn drain_ready(&mut self, state: &SharedConsensusState) -> Vec<Envelope> {
        if !self.entries.iter().any(|e| e.condition.is_ready(state)) {
            return vec![];
        }

        let mut ready = vec![];
        let mut pending = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.condition.is_ready(state) {
                ready.push(entry.envelope);
            } else {
                pending.push_back(entry);
            }
        }
        self.entries = pending;
        for envelope in &ready {
            self.release(envelope.sender);
        }
        ready
    }

    /// Drop messages about seqs at or below a stable checkpoint
    pub fn purge_below(&mut self, stable: SeqNo) -> usize {
        self.purge(|e| e.envelope.msg.seq().is_some_and(|seq| seq <= stable))
    }

    /// Drop messages belonging to views before `view`
    pub fn purge_views_below(&mut self, view: ViewNo) -> usize {
        self.purge(|e| e.envelope.msg.view().is_some_and(|v| v < view))
    }

    fn purge(&mut self, remove: impl Fn(&StashedMessage) -> bool) -> usize {
        let before = self.entries.len();
        let mut removed = vec![];
        self.entries.retain(|e| {
            if remove(e) {
                removed.push(e.envelope.sender);
                false
            } else {
                true
            }
        });
        for sender in removed {
            self.release(sender);
        }
        before - self.entries.len()
    }

    fn release(&mut self, sender: PeerIdx) {
        if let Some(count) = self.per_sender.get_mut(&sender) {
            *count -= 1;
            if *count == 0 {
                self.per_sender.remove(&sender);
            }
        }
    }
}
