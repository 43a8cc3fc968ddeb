//! Composition root of a consensus replica
//!
//! [`ReplicaService`] owns the shared state and all services, and is the only
//! place where the state gets mutated. Every call goes through the same
//! cycle:
//!
//! 1. validate and route the input to a service,
//! 2. apply the [`Internal`](crate::ctx::Internal) events the services raised,
//! 3. flush outgoing messages, timer commands and fault evidence,
//! 4. replay stashed messages that became ready, until nothing changes.
//!
//! A [`FatalError`] halts the replica for good.
mod dispatch;
mod effects;
mod getters;

use std::collections::BTreeMap;
use std::fmt;

use ordo_consensus_core::cert::{CheckpointCertificate, InvalidCertificateError};
use ordo_consensus_core::digest::RequestId;
use ordo_consensus_core::msg::Envelope;
use ordo_consensus_core::peer::PeerPubkey;
use ordo_consensus_core::validator_set::ValidatorSet;
use ordo_consensus_core::view::InstanceId;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::{debug, error, info, instrument};

use crate::LOG_TARGET;
use crate::checkpoint::CheckpointService;
use crate::config::{ConfigError, ConsensusConfig};
use crate::ctx::{Ctx, Outbox};
use crate::env::{Executor, Network, NodeEvent, NodeSupervisor, Signer, Timer, TimerEvent, TimerHandle};
use crate::error::FatalError;
use crate::freshness::FreshnessChecker;
use crate::message_req::MessageRequestService;
use crate::ordering::{OrderingService, SubmitBatchError};
use crate::shared_state::{ReplicaIdentity, SharedConsensusState};
use crate::stasher::MessageStasher;
use crate::view_change::ViewChangeService;

/// Input of a replica
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    Message(Envelope),
    ClientBatch(Vec<RequestId>),
    Timeout(TimerEvent),
}

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("Invalid consensus config"))]
    InvalidConfig { source: ConfigError },
    #[snafu(display("Own key {pubkey} is not in the validator set"))]
    NotAValidator { pubkey: PeerPubkey },
}

pub type InitResult<T> = Result<T, InitError>;

#[derive(Debug, Snafu)]
pub enum ReplicaError {
    #[snafu(transparent)]
    Fatal { source: FatalError },
    #[snafu(transparent)]
    SubmitBatch { source: SubmitBatchError },
    #[snafu(display("Invalid catch-up checkpoint"))]
    InvalidCatchup { source: InvalidCertificateError },
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Services sharing a [`Ctx`] within a single call
#[derive(Debug)]
pub(crate) struct Services {
    pub(crate) ordering: OrderingService,
    pub(crate) checkpoints: CheckpointService,
    pub(crate) view_change: ViewChangeService,
    pub(crate) requests: MessageRequestService,
    pub(crate) freshness: FreshnessChecker,
}

pub struct ReplicaService {
    config: ConsensusConfig,
    state: SharedConsensusState,
    services: Services,
    stasher: MessageStasher,

    signer: Box<dyn Signer>,
    network: Box<dyn Network>,
    executor: Box<dyn Executor>,
    timer: Box<dyn Timer>,
    supervisor: Box<dyn NodeSupervisor>,

    /// Effects of the call in progress
    out: Outbox,
    /// Armed timers
    timers: BTreeMap<TimerEvent, TimerHandle>,
    halted: Option<FatalError>,
}

impl fmt::Debug for ReplicaService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaService").finish_non_exhaustive()
    }
}

#[bon::bon]
impl ReplicaService {
    #[builder]
    pub fn new(
        #[builder(default)] config: ConsensusConfig,
        #[builder(default)] instance_id: InstanceId,
        #[builder(into)] node_name: String,
        validators: ValidatorSet,
        signer: Box<dyn Signer>,
        network: Box<dyn Network>,
        executor: Box<dyn Executor>,
        timer: Box<dyn Timer>,
        supervisor: Box<dyn NodeSupervisor>,
    ) -> InitResult<Self> {
        config.validate().context(InvalidConfigSnafu)?;
        let pubkey = signer.pubkey();
        let our_idx = validators
            .find_idx(pubkey)
            .context(NotAValidatorSnafu { pubkey })?;

        info!(
            target: LOG_TARGET,
            %node_name,
            %our_idx,
            num_peers = %validators.num_peers(),
            %instance_id,
            "Creating replica"
        );
        let state = SharedConsensusState::new(
            ReplicaIdentity {
                instance_id,
                node_name,
                validators,
                our_idx,
            },
            config.log_size,
        );
        Ok(Self {
            services: Services {
                ordering: OrderingService::new(),
                checkpoints: CheckpointService::new(),
                view_change: ViewChangeService::new(),
                requests: MessageRequestService::new(),
                freshness: FreshnessChecker::new(config.freshness_stall_ticks),
            },
            stasher: MessageStasher::new(config.max_stash_per_sender),
            config,
            state,
            signer,
            network,
            executor,
            timer,
            supervisor,
            out: Outbox::default(),
            timers: BTreeMap::new(),
            halted: None,
        })
    }
}

impl ReplicaService {
    /// Arm the periodic timers
    pub fn start(&mut self) -> ReplicaResult<()> {
        self.ensure_running()?;
        let interval = self.config.freshness_interval();
        self.with_ctx(|_, ctx| ctx.schedule(interval, TimerEvent::Freshness));
        self.finish_call()
    }

    #[instrument(skip_all, fields(node = %self.state.node_name()))]
    pub fn handle_event(&mut self, event: ReplicaEvent) -> ReplicaResult<()> {
        self.ensure_running()?;
        let res = match event {
            ReplicaEvent::Message(envelope) => self.dispatch(envelope).map_err(Into::into),
            ReplicaEvent::ClientBatch(requests) => self
                .with_ctx(|s, ctx| s.ordering.on_client_batch(ctx, requests))
                .map(|_| ())
                .map_err(Into::into),
            ReplicaEvent::Timeout(event) => self.handle_timeout(event).map_err(Into::into),
        };
        self.complete(res)
    }

    /// Continue from a checkpoint obtained by state transfer
    ///
    /// Everything up to `cert.seq_end` is considered ordered and executed.
    #[instrument(skip_all, fields(node = %self.state.node_name(), seq = %cert.seq_end))]
    pub fn apply_catchup(&mut self, cert: CheckpointCertificate) -> ReplicaResult<()> {
        self.ensure_running()?;
        cert.verify(self.state.instance_id(), self.state.validators())
            .context(InvalidCatchupSnafu)?;
        if cert.seq_end <= self.state.stable_seq() {
            debug!(target: LOG_TARGET, "Catch-up checkpoint not above the stable one");
            return Ok(());
        }
        self.services.checkpoints.apply_catchup(&cert);
        let res = self.stabilize(cert).map_err(Into::into);
        self.complete(res)
    }

    fn ensure_running(&self) -> ReplicaResult<()> {
        if self.halted.is_some() {
            return Err(FatalError::Halted.into());
        }
        Ok(())
    }

    /// Halt on a fatal error
    fn check_fatal(&mut self, res: ReplicaResult<()>) -> ReplicaResult<()> {
        if let Err(ReplicaError::Fatal { source }) = &res {
            self.halt(source.clone());
        }
        res
    }

    /// Apply pending effects and replay the stash
    fn finish_call(&mut self) -> ReplicaResult<()> {
        let res = self.flush().and_then(|()| self.drain_stash());
        self.check_fatal(res.map_err(Into::into))
    }

    /// End a call that produced `res`
    fn complete(&mut self, res: ReplicaResult<()>) -> ReplicaResult<()> {
        let res = self.check_fatal(res);
        if self.halted.is_none() {
            self.finish_call()?;
        }
        res
    }

    fn halt(&mut self, err: FatalError) {
        error!(target: LOG_TARGET, node = %self.state.node_name(), %err, "Replica halted");
        self.out = Outbox::default();
        for (_, handle) in std::mem::take(&mut self.timers) {
            self.timer.cancel(handle);
        }
        self.supervisor.on_event(NodeEvent::Halted {
            reason: err.to_string(),
        });
        self.halted = Some(err);
    }

    fn with_ctx<R>(&mut self, f: impl FnOnce(&mut Services, &mut Ctx) -> R) -> R {
        let mut ctx = Ctx::new(
            &self.state,
            &self.config,
            self.signer.as_ref(),
            &mut self.out,
        );
        f(&mut self.services, &mut ctx)
    }
}
