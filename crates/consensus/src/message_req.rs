//! Anti-entropy: asking peers for three-phase messages we missed
use std::collections::BTreeSet;

use ordo_consensus_core::msg::{Envelope, MessageKind, MessageRep, MessageReq};
use ordo_consensus_core::peer::PeerIdx;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::view::{InstanceId, SeqNo, ThreePhaseKey, ViewNo};
use snafu::{OptionExt as _, Snafu, ensure};
use tracing::{Level, debug, instrument};

use crate::LOG_TARGET;
use crate::ctx::{Ctx, Processed};
use crate::env::FaultKind;
use crate::error::AsFault;
use crate::ordering::OrderingService;

#[derive(Debug, Snafu)]
pub enum MessageReqError {
    #[snafu(display("Reply with {kind} for {key} that was never requested"))]
    UnsolicitedReply {
        kind: MessageKind,
        key: ThreePhaseKey,
    },
    #[snafu(display("Reply relaying a message of unknown author {author}"))]
    UnknownAuthor { author: PeerIdx },
    #[snafu(display("Reply relaying a message not signed by {author}"))]
    InvalidRelayedSignature { author: PeerIdx },
    #[snafu(display("Reply relaying a {kind} for {key} that {author} could not have authored"))]
    WrongAuthor {
        kind: MessageKind,
        key: ThreePhaseKey,
        author: PeerIdx,
    },
    #[snafu(display("Reply relaying a message of instance {received}"))]
    RelayedWrongInstance { received: InstanceId },
}

pub type MessageReqResult<T> = Result<T, MessageReqError>;

impl AsFault for MessageReqError {
    fn fault_kind(&self) -> FaultKind {
        match self {
            MessageReqError::UnsolicitedReply { .. } => FaultKind::UnsolicitedReply,
            MessageReqError::InvalidRelayedSignature { .. } => FaultKind::InvalidSignature,
            MessageReqError::UnknownAuthor { .. }
            | MessageReqError::WrongAuthor { .. }
            | MessageReqError::RelayedWrongInstance { .. } => FaultKind::MalformedMessage,
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageRequestService {
    outstanding: BTreeSet<(MessageKind, ThreePhaseKey)>,
}

impl MessageRequestService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_outstanding(&self, kind: MessageKind, key: ThreePhaseKey) -> bool {
        self.outstanding.contains(&(kind, key))
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Ask for `kind` at `key`: the primary for PrePrepares, everyone for votes
    pub(crate) fn request_missing(&mut self, ctx: &mut Ctx, kind: MessageKind, key: ThreePhaseKey) {
        if !self.outstanding.insert((kind, key)) {
            return;
        }
        let req = MessageReq {
            inst_id: ctx.state.instance_id(),
            kind,
            key,
        };
        debug!(target: LOG_TARGET, node = %ctx.state.node_name(), %kind, %key, "Requesting missing message");
        match kind {
            MessageKind::PrePrepare => {
                let primary = ctx.state.primary_for(key.view);
                if primary != ctx.state.our_idx() {
                    ctx.send(primary, req);
                }
            }
            MessageKind::Prepare | MessageKind::Commit => {
                ctx.broadcast(req);
            }
        }
    }

    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, kind = %req.kind, key = %req.key),
        ret(level = Level::TRACE))]
    pub(crate) fn on_message_req(
        &self,
        ctx: &mut Ctx,
        ordering: &OrderingService,
        sender: PeerIdx,
        req: Signed<MessageReq>,
    ) -> Processed {
        let author = match req.kind {
            MessageKind::PrePrepare => ctx.state.primary_for(req.key.view),
            MessageKind::Prepare | MessageKind::Commit => ctx.state.our_idx(),
        };
        let Some(message) = ordering.find_message(req.kind, req.key, author) else {
            return Processed::Stale;
        };
        ctx.send(
            sender,
            MessageRep {
                inst_id: ctx.state.instance_id(),
                author,
                message,
            },
        );
        Processed::Accepted
    }

    /// Check a reply; returns the relayed message as if received from its author
    #[instrument(skip_all,
        fields(node = %ctx.state.node_name(), peer_idx = %sender, author = %rep.author),
        ret(level = Level::TRACE))]
    pub(crate) fn on_message_rep(
        &self,
        ctx: &mut Ctx,
        sender: PeerIdx,
        rep: Signed<MessageRep>,
    ) -> MessageReqResult<Option<Envelope>> {
        let kind = rep.message.kind();
        let key = rep.message.key();
        if key.view < ctx.state.view() || key.seq <= ctx.state.stable_seq() {
            return Ok(None);
        }
        ensure!(
            self.is_outstanding(kind, key),
            UnsolicitedReplySnafu { kind, key }
        );

        let author = rep.author;
        let expected_author = match kind {
            MessageKind::PrePrepare => author == ctx.state.primary_for(key.view),
            MessageKind::Prepare => author != ctx.state.primary_for(key.view),
            MessageKind::Commit => true,
        };
        ensure!(
            expected_author && author != ctx.state.our_idx(),
            WrongAuthorSnafu { kind, key, author }
        );
        let pubkey = ctx
            .state
            .validators()
            .get(author)
            .context(UnknownAuthorSnafu { author })?;

        let msg = rep.inner.message.into_signed_message();
        ensure!(
            msg.inst_id() == ctx.state.instance_id(),
            RelayedWrongInstanceSnafu {
                received: msg.inst_id(),
            }
        );
        msg.verify_sig(pubkey)
            .ok()
            .context(InvalidRelayedSignatureSnafu { author })?;
        Ok(Some(Envelope::new(author, msg)))
    }

    pub(crate) fn gc(&mut self, stable: SeqNo) {
        self.outstanding.retain(|(_, key)| stable < key.seq);
    }

    pub(crate) fn on_view_installed(&mut self, view: ViewNo) {
        self.outstanding.retain(|(_, key)| view <= key.view);
    }
}
