//! Driving a [`ReplicaService`] from a tokio task
//!
//! The replica itself is synchronous. [`ReplicaRunner`] owns it in a single
//! task, feeds it events from an unbounded channel in arrival order and
//! publishes a [`ConsensusStateSnapshot`] after each of them.
use std::collections::BTreeMap;
use std::time::Duration;

use ordo_util_error::fmt::FmtCompact as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::LOG_TARGET;
use crate::env::{Timer, TimerEvent, TimerHandle};
use crate::replica::{ReplicaError, ReplicaEvent, ReplicaResult, ReplicaService};
use crate::shared_state::ConsensusStateSnapshot;

/// [`Timer`] delivering fired events back into the replica's queue
#[derive(Debug)]
pub struct TokioTimer {
    events_tx: mpsc::UnboundedSender<ReplicaEvent>,
    next_handle: u64,
    pending: BTreeMap<TimerHandle, JoinHandle<()>>,
}

impl TokioTimer {
    pub fn new(events_tx: mpsc::UnboundedSender<ReplicaEvent>) -> Self {
        Self {
            events_tx,
            next_handle: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl Timer for TokioTimer {
    fn schedule(&mut self, after: Duration, event: TimerEvent) -> TimerHandle {
        self.pending.retain(|_, task| !task.is_finished());

        let handle = TimerHandle::from(self.next_handle);
        self.next_handle += 1;
        let events_tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Receiver gone means the replica stopped
            let _ = events_tx.send(ReplicaEvent::Timeout(event));
        });
        self.pending.insert(handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.pending.remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        for task in self.pending.values() {
            task.abort();
        }
    }
}

/// Event queue of a replica that is not running yet
///
/// Created first, so the [`TokioTimer`] and the network layer can hold a
/// sender before the replica is built.
pub struct ReplicaRunner {
    events_tx: mpsc::UnboundedSender<ReplicaEvent>,
    events_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
}

impl Default for ReplicaRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaRunner {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx,
        }
    }

    pub fn events_tx(&self) -> mpsc::UnboundedSender<ReplicaEvent> {
        self.events_tx.clone()
    }

    pub fn timer(&self) -> TokioTimer {
        TokioTimer::new(self.events_tx())
    }

    /// Start the replica and process events until shutdown or a fatal error
    pub fn spawn(self, replica: ReplicaService) -> ReplicaHandle {
        let (snapshot_tx, snapshot_rx) = watch::channel(replica.snapshot());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run(
            replica,
            self.events_rx,
            snapshot_tx,
            shutdown_rx,
        ));
        ReplicaHandle {
            events_tx: self.events_tx,
            snapshot_rx,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn run(
        mut replica: ReplicaService,
        mut events_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
        snapshot_tx: watch::Sender<ConsensusStateSnapshot>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> ReplicaResult<()> {
        let node_name = replica.state().node_name().to_owned();
        info!(target: LOG_TARGET, %node_name, "Starting replica");
        replica.start()?;
        snapshot_tx.send_replace(replica.snapshot());

        loop {
            let event = tokio::select! {
                _ = &mut shutdown_rx => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let res = replica.handle_event(event);
            snapshot_tx.send_replace(replica.snapshot());
            match res {
                Ok(()) => {}
                Err(err @ ReplicaError::Fatal { .. }) => return Err(err),
                Err(err) => {
                    warn!(target: LOG_TARGET, %node_name, err = %err.fmt_compact(), "Event rejected");
                }
            }
        }
        debug!(target: LOG_TARGET, %node_name, "Replica stopped");
        Ok(())
    }
}

/// Handle of a replica running in a tokio task
pub struct ReplicaHandle {
    events_tx: mpsc::UnboundedSender<ReplicaEvent>,
    snapshot_rx: watch::Receiver<ConsensusStateSnapshot>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<ReplicaResult<()>>,
}

impl ReplicaHandle {
    /// Queue an event; `false` once the replica stopped
    pub fn submit(&self, event: ReplicaEvent) -> bool {
        self.events_tx.send(event).is_ok()
    }

    pub fn events_tx(&self) -> mpsc::UnboundedSender<ReplicaEvent> {
        self.events_tx.clone()
    }

    pub fn snapshot(&self) -> ConsensusStateSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsensusStateSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Stop after the event being processed and wait for the task
    pub async fn shutdown(mut self) -> ReplicaResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        match (&mut self.task).await {
            Ok(res) => res,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // Aborted
            Err(_) => Ok(()),
        }
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ordo_consensus_core::digest::RequestId;
    use ordo_consensus_core::msg::ConsensusMessage;
    use ordo_consensus_core::peer::PeerIdx;
    use ordo_consensus_core::signed::Signed;
    use ordo_consensus_core::view::SeqNo;

    use super::ReplicaRunner;
    use crate::env::{Executor, FaultEvidence, Network, NodeEvent, NodeSupervisor, RequestOutcome};
    use crate::replica::{ReplicaEvent, ReplicaService};
    use crate::testing::{Fixture, INST, requests};

    struct Nop;

    impl Network for Nop {
        fn broadcast(&mut self, _msg: Signed<ConsensusMessage>) {}
        fn send(&mut self, _peer_idx: PeerIdx, _msg: Signed<ConsensusMessage>) {}
    }

    impl Executor for Nop {
        fn apply_ordered_batch(
            &mut self,
            _seq: SeqNo,
            requests: &[RequestId],
        ) -> Vec<RequestOutcome> {
            vec![RequestOutcome::Applied; requests.len()]
        }
    }

    impl NodeSupervisor for Nop {
        fn report_fault(&mut self, _evidence: FaultEvidence) {}
        fn on_event(&mut self, _event: NodeEvent) {}
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn runner_orders_and_publishes_snapshots() {
        let fx = Fixture::new(1);
        let runner = ReplicaRunner::new();
        let replica = ReplicaService::builder()
            .config(fx.config.clone())
            .instance_id(INST)
            .node_name("solo")
            .validators(fx.validators.clone())
            .signer(Box::new(fx.seckey(0)))
            .network(Box::new(Nop))
            .executor(Box::new(Nop))
            .timer(Box::new(runner.timer()))
            .supervisor(Box::new(Nop))
            .build()
            .expect("valid replica");
        let handle = runner.spawn(replica);
        let mut snapshots = handle.subscribe();

        assert!(handle.submit(ReplicaEvent::ClientBatch(requests("a"))));
        snapshots
            .wait_for(|s| s.last_ordered == SeqNo::new(1))
            .await
            .expect("running");

        // Freshness batches keep the idle log moving
        tokio::time::sleep(fx.config.freshness_interval() * 3 + Duration::from_millis(1)).await;
        assert!(handle.snapshot().last_ordered > SeqNo::new(1));

        handle.shutdown().await.expect("clean shutdown");
    }
}
