//! In-process cluster of replicas talking over channels
//!
//! Every replica runs in its own task behind a [`ReplicaRunner`]. Batches are
//! submitted to whichever replica is the acting primary, and resubmitted if
//! a view change swallowed them.
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ordo_consensus::env::{
    Executor, FaultEvidence, Network, NodeEvent, NodeSupervisor, RequestOutcome,
};
use ordo_consensus::runner::{ReplicaHandle, ReplicaRunner};
use ordo_consensus::{ConsensusConfig, ConsensusStateSnapshot, ReplicaEvent, ReplicaService};
use ordo_consensus_core::digest::RequestId;
use ordo_consensus_core::msg::{ConsensusMessage, Envelope};
use ordo_consensus_core::peer::{PeerIdx, PeerSeckey};
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::validator_set::ValidatorSet;
use ordo_consensus_core::view::{SeqNo, ViewNo};
use ordo_util_error::WhateverResult;
use serde::Serialize;
use snafu::{ResultExt as _, whatever};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::LOG_TARGET;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct ChannelNetwork {
    our_idx: PeerIdx,
    peers: Vec<mpsc::UnboundedSender<ReplicaEvent>>,
}

impl ChannelNetwork {
    fn deliver(&self, to: PeerIdx, msg: Signed<ConsensusMessage>) {
        if let Some(peer) = self.peers.get(to.as_usize()) {
            // Stopped replicas just don't answer
            let _ = peer.send(ReplicaEvent::Message(Envelope::new(self.our_idx, msg)));
        }
    }
}

impl Network for ChannelNetwork {
    fn broadcast(&mut self, msg: Signed<ConsensusMessage>) {
        for i in 0..self.peers.len() {
            let to = PeerIdx::new(u8::try_from(i).expect("Validator set size fits u8"));
            if to != self.our_idx {
                self.deliver(to, msg.clone());
            }
        }
    }

    fn send(&mut self, peer_idx: PeerIdx, msg: Signed<ConsensusMessage>) {
        self.deliver(peer_idx, msg);
    }
}

#[derive(Debug, Default)]
struct AppState {
    log: Vec<RequestId>,
    applied: BTreeSet<RequestId>,
    faults: usize,
}

/// Replicated application: an append-only log of unique requests
#[derive(Debug, Clone, Default)]
struct App {
    node_name: String,
    state: Arc<Mutex<AppState>>,
}

impl App {
    fn lock(&self) -> std::sync::MutexGuard<'_, AppState> {
        self.state.lock().expect("Locking failed")
    }

    fn contains(&self, request: &RequestId) -> bool {
        self.lock().applied.contains(request)
    }
}

impl Executor for App {
    fn apply_ordered_batch(
        &mut self,
        seq: SeqNo,
        requests: &[RequestId],
    ) -> Vec<RequestOutcome> {
        let mut state = self.lock();
        requests
            .iter()
            .map(|request| {
                if state.applied.insert(*request) {
                    state.log.push(*request);
                    RequestOutcome::Applied
                } else {
                    debug!(target: LOG_TARGET, node = %self.node_name, %seq, "Request already applied");
                    RequestOutcome::Rejected {
                        reason: "duplicate".to_owned(),
                    }
                }
            })
            .collect()
    }
}

impl NodeSupervisor for App {
    fn report_fault(&mut self, evidence: FaultEvidence) {
        warn!(target: LOG_TARGET, node = %self.node_name, ?evidence, "Peer fault");
        self.lock().faults += 1;
    }

    fn on_event(&mut self, event: NodeEvent) {
        info!(target: LOG_TARGET, node = %self.node_name, ?event, "Replica event");
    }
}

#[derive(Debug, Serialize)]
pub struct ReplicaReport {
    pub crashed: bool,
    pub applied: usize,
    pub faults: usize,
    /// `None` for a stopped replica
    pub state: Option<ConsensusStateSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub batches: u64,
    /// All running replicas applied the same requests in the same order
    pub consistent: bool,
    pub replicas: Vec<ReplicaReport>,
}

#[derive(bon::Builder)]
pub struct Simulation {
    config: ConsensusConfig,
    #[builder(default = 4)]
    replicas: u8,
    #[builder(default = 10)]
    batches: u64,
    crash_primary_after: Option<u64>,
    #[builder(default = Duration::from_secs(30))]
    batch_timeout: Duration,
}

impl Simulation {
    pub async fn run(self) -> WhateverResult<SimulationReport> {
        let seckeys: Vec<_> = (0..self.replicas)
            .map(|_| PeerSeckey::generate())
            .collect();
        let validators = ValidatorSet::new(seckeys.iter().map(|s| s.pubkey()).collect())
            .whatever_context("Invalid validator set")?;

        let runners: Vec<_> = seckeys.iter().map(|_| ReplicaRunner::new()).collect();
        let peers: Vec<_> = runners.iter().map(ReplicaRunner::events_tx).collect();
        let apps: Vec<_> = (0..self.replicas)
            .map(|i| App {
                node_name: format!("node-{i}"),
                state: Arc::default(),
            })
            .collect();

        let mut handles = vec![];
        for (i, (runner, seckey)) in runners.into_iter().zip(&seckeys).enumerate() {
            let app = &apps[i];
            let replica = ReplicaService::builder()
                .config(self.config.clone())
                .node_name(app.node_name.clone())
                .validators(validators.clone())
                .signer(Box::new(*seckey))
                .network(Box::new(ChannelNetwork {
                    our_idx: PeerIdx::new(u8::try_from(i).expect("Validator set size fits u8")),
                    peers: peers.clone(),
                }))
                .executor(Box::new(app.clone()))
                .timer(Box::new(runner.timer()))
                .supervisor(Box::new(app.clone()))
                .build()
                .whatever_context("Failed to create replica")?;
            handles.push(Some(runner.spawn(replica)));
        }

        for batch in 0..self.batches {
            if self.crash_primary_after == Some(batch) {
                if let Some(handle) = handles[0].take() {
                    warn!(target: LOG_TARGET, "Stopping the initial primary");
                    handle
                        .shutdown()
                        .await
                        .whatever_context("Stopped replica failed")?;
                }
            }
            let request = RequestId::from_content(format!("batch-{batch}").as_bytes());
            self.order(&handles, &apps, request, batch).await?;
        }

        let consistent = is_consistent(&handles, &apps);
        let mut replicas = vec![];
        for (handle, app) in handles.into_iter().zip(&apps) {
            let (crashed, state) = match handle {
                Some(handle) => {
                    let state = handle.snapshot();
                    handle
                        .shutdown()
                        .await
                        .whatever_context("Replica failed")?;
                    (false, Some(state))
                }
                None => (true, None),
            };
            let app = app.lock();
            replicas.push(ReplicaReport {
                crashed,
                applied: app.log.len(),
                faults: app.faults,
                state,
            });
        }

        Ok(SimulationReport {
            batches: self.batches,
            consistent,
            replicas,
        })
    }

    /// Get `request` applied by every running replica
    async fn order(
        &self,
        handles: &[Option<ReplicaHandle>],
        apps: &[App],
        request: RequestId,
        batch: u64,
    ) -> WhateverResult<()> {
        let deadline = Instant::now() + self.batch_timeout;
        let mut submitted_in: Option<ViewNo> = None;
        loop {
            let running = || handles.iter().zip(apps).filter(|(h, _)| h.is_some());
            if running().all(|(_, app)| app.contains(&request)) {
                debug!(target: LOG_TARGET, batch, "Batch applied everywhere");
                return Ok(());
            }
            if deadline < Instant::now() {
                whatever!("Batch {batch} was not ordered in time");
            }

            let acting_primary = handles.iter().flatten().find(|handle| {
                let s = handle.snapshot();
                s.primary == s.our_idx && s.view_change_target.is_none()
            });
            if let Some(primary) = acting_primary {
                let view = primary.snapshot().view;
                if submitted_in != Some(view) {
                    debug!(target: LOG_TARGET, batch, %view, "Submitting batch");
                    primary.submit(ReplicaEvent::ClientBatch(vec![request]));
                    submitted_in = Some(view);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn is_consistent(handles: &[Option<ReplicaHandle>], apps: &[App]) -> bool {
    let logs: Vec<_> = handles
        .iter()
        .zip(apps)
        .filter(|(h, _)| h.is_some())
        .map(|(_, app)| app.lock().log.clone())
        .collect();
    logs.windows(2).all(|pair| {
        let common = pair[0].len().min(pair[1].len());
        pair[0][..common] == pair[1][..common]
    })
}
