//! Deterministic in-memory cluster of replicas
//!
//! Messages go through a single shared queue and are delivered only when a
//! test says so; timers fire only when a test fires them. This makes it
//! possible to crash or isolate replicas and to reorder delivery at will.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ordo_consensus::env::{
    Executor, FaultEvidence, Network, NodeEvent, NodeSupervisor, RequestOutcome, Timer,
    TimerEvent, TimerHandle,
};
use ordo_consensus::{ConsensusConfig, ReplicaEvent, ReplicaResult, ReplicaService};
use ordo_consensus_core::digest::RequestId;
use ordo_consensus_core::msg::{ConsensusMessage, Envelope};
use ordo_consensus_core::peer::{PeerIdx, PeerSeckey};
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::validator_set::ValidatorSet;
use ordo_consensus_core::view::{InstanceId, SeqNo};
use tracing::trace;

pub const INST: InstanceId = InstanceId::new(1);

/// Stops runaway delivery loops in broken tests
const MAX_DELIVERIES: usize = 100_000;

pub fn requests(tag: &str) -> Vec<RequestId> {
    vec![RequestId::from_content(tag.as_bytes())]
}

pub fn config() -> ConsensusConfig {
    ConsensusConfig::builder()
        .checkpoint_interval(4)
        .log_size(12)
        .freshness_stall_ticks(2)
        .build()
}

pub struct InFlight {
    pub from: PeerIdx,
    pub to: PeerIdx,
    pub msg: Signed<ConsensusMessage>,
}

#[derive(Default)]
struct Bus {
    queue: VecDeque<InFlight>,
}

/// Per node view of the outside world
#[derive(Default)]
pub struct NodeRecord {
    pub executed: Vec<(SeqNo, Vec<RequestId>)>,
    pub faults: Vec<FaultEvidence>,
    pub events: Vec<NodeEvent>,
    timers: BTreeMap<TimerHandle, TimerEvent>,
    next_handle: u64,
}

impl NodeRecord {
    pub fn executed_requests(&self) -> Vec<Vec<RequestId>> {
        self.executed.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn armed(&self) -> Vec<TimerEvent> {
        self.timers.values().copied().collect()
    }
}

#[derive(Clone)]
struct NodeEnv {
    our_idx: PeerIdx,
    num_peers: u8,
    bus: Arc<Mutex<Bus>>,
    record: Arc<Mutex<NodeRecord>>,
}

impl NodeEnv {
    fn record(&self) -> std::sync::MutexGuard<'_, NodeRecord> {
        self.record.lock().expect("Locking failed")
    }
}

impl Network for NodeEnv {
    fn broadcast(&mut self, msg: Signed<ConsensusMessage>) {
        let mut bus = self.bus.lock().expect("Locking failed");
        for to in (0..self.num_peers).map(PeerIdx::new) {
            if to != self.our_idx {
                bus.queue.push_back(InFlight {
                    from: self.our_idx,
                    to,
                    msg: msg.clone(),
                });
            }
        }
    }

    fn send(&mut self, to: PeerIdx, msg: Signed<ConsensusMessage>) {
        self.bus
            .lock()
            .expect("Locking failed")
            .queue
            .push_back(InFlight {
                from: self.our_idx,
                to,
                msg,
            });
    }
}

impl Executor for NodeEnv {
    fn apply_ordered_batch(&mut self, seq: SeqNo, requests: &[RequestId]) -> Vec<RequestOutcome> {
        self.record().executed.push((seq, requests.to_vec()));
        vec![RequestOutcome::Applied; requests.len()]
    }
}

impl Timer for NodeEnv {
    fn schedule(&mut self, _after: Duration, event: TimerEvent) -> TimerHandle {
        let mut record = self.record();
        record.next_handle += 1;
        let handle = TimerHandle::from(record.next_handle);
        record.timers.insert(handle, event);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.record().timers.remove(&handle);
    }
}

impl NodeSupervisor for NodeEnv {
    fn report_fault(&mut self, evidence: FaultEvidence) {
        self.record().faults.push(evidence);
    }

    fn on_event(&mut self, event: NodeEvent) {
        self.record().events.push(event);
    }
}

pub struct Node {
    pub replica: ReplicaService,
    env: NodeEnv,
}

impl Node {
    pub fn record<R>(&self, f: impl FnOnce(&NodeRecord) -> R) -> R {
        f(&self.env.record())
    }
}

type DeliveryFilter = Box<dyn Fn(&InFlight) -> bool>;

pub struct Cluster {
    pub seckeys: Vec<PeerSeckey>,
    pub validators: ValidatorSet,
    pub nodes: Vec<Node>,
    bus: Arc<Mutex<Bus>>,
    crashed: BTreeSet<PeerIdx>,
    /// Messages it returns `false` for are dropped
    filter: Option<DeliveryFilter>,
}

impl Cluster {
    pub fn new(num_peers: u8) -> Self {
        Self::with_config(num_peers, config())
    }

    pub fn with_config(num_peers: u8, config: ConsensusConfig) -> Self {
        let seckeys: Vec<_> = (0..num_peers).map(|_| PeerSeckey::generate()).collect();
        let validators =
            ValidatorSet::new(seckeys.iter().map(|s| s.pubkey()).collect()).expect("Valid");
        let bus = Arc::new(Mutex::new(Bus::default()));

        let nodes = (0..num_peers)
            .map(|i| {
                let env = NodeEnv {
                    our_idx: PeerIdx::new(i),
                    num_peers,
                    bus: bus.clone(),
                    record: Arc::default(),
                };
                let mut replica = ReplicaService::builder()
                    .config(config.clone())
                    .instance_id(INST)
                    .node_name(format!("node-{i}"))
                    .validators(validators.clone())
                    .signer(Box::new(seckeys[usize::from(i)]))
                    .network(Box::new(env.clone()))
                    .executor(Box::new(env.clone()))
                    .timer(Box::new(env.clone()))
                    .supervisor(Box::new(env.clone()))
                    .build()
                    .expect("Valid replica");
                replica.start().expect("Running");
                Node { replica, env }
            })
            .collect();

        Self {
            seckeys,
            validators,
            nodes,
            bus,
            crashed: BTreeSet::new(),
            filter: None,
        }
    }

    pub fn node(&self, i: u8) -> &Node {
        &self.nodes[usize::from(i)]
    }

    pub fn replica(&mut self, i: u8) -> &mut ReplicaService {
        &mut self.nodes[usize::from(i)].replica
    }

    pub fn live(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|node| !self.crashed.contains(&node.replica.our_idx()))
    }

    /// A crashed replica neither sends nor receives anything
    pub fn crash(&mut self, i: u8) {
        self.crashed.insert(PeerIdx::new(i));
    }

    pub fn set_filter(&mut self, filter: impl Fn(&InFlight) -> bool + 'static) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    pub fn submit(&mut self, i: u8, tag: &str) -> ReplicaResult<()> {
        self.replica(i)
            .handle_event(ReplicaEvent::ClientBatch(requests(tag)))
    }

    /// Inject a message as if sent by `from`
    pub fn inject(&mut self, from: u8, to: u8, msg: Signed<ConsensusMessage>) {
        self.bus
            .lock()
            .expect("Locking failed")
            .queue
            .push_back(InFlight {
                from: PeerIdx::new(from),
                to: PeerIdx::new(to),
                msg,
            });
    }

    fn pop(&self) -> Option<InFlight> {
        self.bus.lock().expect("Locking failed").queue.pop_front()
    }

    /// Deliver queued messages until the queue is empty
    ///
    /// Returns the number of messages delivered.
    pub fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(in_flight) = self.pop() {
            assert!(delivered < MAX_DELIVERIES, "Delivery does not settle");
            if self.crashed.contains(&in_flight.from) || self.crashed.contains(&in_flight.to) {
                continue;
            }
            if self.filter.as_ref().is_some_and(|f| !f(&in_flight)) {
                trace!(from = %in_flight.from, to = %in_flight.to, "Filtered out");
                continue;
            }
            delivered += 1;
            let InFlight { from, to, msg } = in_flight;
            let replica = &mut self.nodes[to.as_usize()].replica;
            if replica.halted().is_some() {
                continue;
            }
            replica
                .handle_event(ReplicaEvent::Message(Envelope::new(from, msg)))
                .expect("Replica must not fail on peer input");
        }
        delivered
    }

    /// Fire every armed timer of live replicas that `pred` selects
    pub fn fire_timers(&mut self, pred: impl Fn(&TimerEvent) -> bool) -> usize {
        let mut fired = 0;
        for i in 0..self.nodes.len() {
            let node = &mut self.nodes[i];
            if self.crashed.contains(&node.replica.our_idx()) {
                continue;
            }
            let due: Vec<_> = {
                let mut record = node.env.record();
                let handles: Vec<_> = record
                    .timers
                    .iter()
                    .filter(|(_, event)| pred(event))
                    .map(|(handle, _)| *handle)
                    .collect();
                handles
                    .into_iter()
                    .filter_map(|handle| record.timers.remove(&handle))
                    .collect()
            };
            for event in due {
                fired += 1;
                node.replica
                    .handle_event(ReplicaEvent::Timeout(event))
                    .expect("Timers never fail a replica");
            }
        }
        fired
    }

    /// Fire all freshness timers and deliver the consequences, `ticks` times
    pub fn tick(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.fire_timers(|event| *event == TimerEvent::Freshness);
            self.deliver_all();
        }
    }
}
