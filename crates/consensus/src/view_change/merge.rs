//! Deterministic merge of a quorum of view change votes
//!
//! The new primary and every backup compute the same result from the same
//! votes, so backups can check a `NewView` by recomputing it.
use std::collections::BTreeMap;

use ordo_consensus_core::cert::{CheckpointCertificate, PreparedCertificate};
use ordo_consensus_core::msg::{PrePrepare, ViewChangeVote};
use ordo_consensus_core::timestamp::Timestamp;
use ordo_consensus_core::view::{InstanceId, SeqNo, ThreePhaseKey, ViewNo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MergedView {
    /// Highest stable checkpoint among the votes
    pub stable_checkpoint: Option<CheckpointCertificate>,
    /// Proposals of the new view, one per seq from above the stable
    /// checkpoint to the highest prepared seq
    pub pre_prepares: Vec<PrePrepare>,
}

impl MergedView {
    pub fn stable_seq(&self) -> SeqNo {
        self.stable_checkpoint
            .as_ref()
            .map(|cert| cert.seq_end)
            .unwrap_or_default()
    }
}

pub(crate) fn merge<'v>(
    inst_id: InstanceId,
    view: ViewNo,
    votes: impl IntoIterator<Item = &'v ViewChangeVote> + Clone,
) -> MergedView {
    let mut stable_checkpoint: Option<&CheckpointCertificate> = None;
    for vote in votes.clone() {
        if let Some(cert) = &vote.stable_checkpoint {
            if stable_checkpoint.is_none_or(|current| current.seq_end < cert.seq_end) {
                stable_checkpoint = Some(cert);
            }
        }
    }
    let low = stable_checkpoint
        .map(|cert| cert.seq_end)
        .unwrap_or_default();

    let mut best: BTreeMap<SeqNo, &PreparedCertificate> = BTreeMap::new();
    for cert in votes.into_iter().flat_map(|vote| &vote.prepared) {
        let seq = cert.key().seq;
        if seq <= low {
            continue;
        }
        let entry = best.entry(seq).or_insert(cert);
        if entry.key().view < cert.key().view {
            *entry = cert;
        }
    }
    let high = best.last_key_value().map(|(seq, _)| *seq).unwrap_or(low);

    let pre_prepares = low
        .range_after(high)
        .map(|seq| {
            let key = ThreePhaseKey::new(view, seq);
            match best.get(&seq) {
                Some(cert) => PrePrepare {
                    inst_id,
                    key,
                    digest: cert.digest(),
                    requests: cert.pre_prepare.requests.clone(),
                    timestamp: cert.pre_prepare.timestamp,
                },
                None => PrePrepare::new(inst_id, key, vec![], Timestamp::ZERO),
            }
        })
        .collect();

    MergedView {
        stable_checkpoint: stable_checkpoint.cloned(),
        pre_prepares,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ordo_consensus_core::cert::{CheckpointCertificate, PreparedCertificate};
    use ordo_consensus_core::digest::CheckpointDigest;
    use ordo_consensus_core::msg::ViewChangeVote;
    use ordo_consensus_core::view::{SeqNo, ViewNo};

    use super::merge;
    use crate::testing::{Fixture, INST, key, pre_prepare};

    fn vote(
        stable: Option<CheckpointCertificate>,
        prepared: Vec<PreparedCertificate>,
    ) -> ViewChangeVote {
        ViewChangeVote {
            inst_id: INST,
            target_view: ViewNo::new(2),
            stable_checkpoint: stable,
            prepared,
        }
    }

    fn stable_at(seq: u64) -> CheckpointCertificate {
        CheckpointCertificate {
            seq_end: SeqNo::new(seq),
            digest: CheckpointDigest::ZERO,
            checkpoints: BTreeMap::new(),
        }
    }

    #[test]
    fn highest_view_certificate_wins_and_gaps_are_filled() {
        let fx = Fixture::new(4);
        let votes = [
            vote(
                None,
                vec![
                    fx.prepared_certificate(pre_prepare(0, 1, "a")),
                    fx.prepared_certificate(pre_prepare(0, 3, "c")),
                ],
            ),
            vote(None, vec![fx.prepared_certificate(pre_prepare(1, 3, "c'"))]),
            vote(None, vec![]),
        ];

        let merged = merge(INST, ViewNo::new(2), &votes);
        assert_eq!(merged.stable_seq(), SeqNo::ZERO);
        let keys: Vec<_> = merged.pre_prepares.iter().map(|pp| pp.key).collect();
        assert_eq!(keys, vec![key(2, 1), key(2, 2), key(2, 3)]);

        assert_eq!(merged.pre_prepares[0].digest, pre_prepare(0, 1, "a").digest);
        assert_eq!(merged.pre_prepares[0].requests, pre_prepare(0, 1, "a").requests);
        assert!(merged.pre_prepares[1].is_freshness());
        assert!(merged.pre_prepares[1].has_valid_digest());
        assert_eq!(merged.pre_prepares[2].digest, pre_prepare(1, 3, "c'").digest);
    }

    #[test]
    fn certificates_below_the_highest_stable_checkpoint_are_dropped() {
        let fx = Fixture::new(4);
        let votes = [
            vote(Some(stable_at(2)), vec![]),
            vote(
                None,
                vec![
                    fx.prepared_certificate(pre_prepare(0, 2, "b")),
                    fx.prepared_certificate(pre_prepare(0, 3, "c")),
                ],
            ),
        ];
        let merged = merge(INST, ViewNo::new(2), &votes);
        assert_eq!(merged.stable_seq(), SeqNo::new(2));
        assert_eq!(merged.pre_prepares.len(), 1);
        assert_eq!(merged.pre_prepares[0].key, key(2, 3));
    }

    #[test]
    fn nothing_prepared_gives_an_empty_view() {
        let votes = [vote(Some(stable_at(4)), vec![]), vote(None, vec![])];
        let merged = merge(INST, ViewNo::new(2), &votes);
        assert_eq!(merged.stable_seq(), SeqNo::new(4));
        assert!(merged.pre_prepares.is_empty());
    }

    #[test]
    fn merge_is_independent_of_vote_order() {
        let fx = Fixture::new(4);
        let a = vote(None, vec![fx.prepared_certificate(pre_prepare(0, 1, "a"))]);
        let b = vote(None, vec![fx.prepared_certificate(pre_prepare(1, 1, "b"))]);
        assert_eq!(
            merge(INST, ViewNo::new(2), [&a, &b]),
            merge(INST, ViewNo::new(2), [&b, &a])
        );
    }
}
