use ordo_consensus_core::digest::RequestId;
use ordo_consensus_core::msg::PrePrepare;
use ordo_consensus_core::signed::Signed;
use ordo_consensus_core::timestamp::Timestamp;
use ordo_consensus_core::view::{SeqNo, ThreePhaseKey};
use snafu::{Snafu, ensure};
use tracing::{debug, instrument};

use super::OrderingService;
use crate::LOG_TARGET;
use crate::ctx::Ctx;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SubmitBatchError {
    #[snafu(display("Next seq {seq} is above the high watermark {high}"))]
    AboveHighWatermark { seq: SeqNo, high: SeqNo },
}

pub type SubmitBatchResult<T> = Result<T, SubmitBatchError>;

impl OrderingService {
    /// Propose `requests` at the next seq, if we are the acting primary
    ///
    /// Returns the key of the proposal, `None` if we are not in a position
    /// to propose.
    #[instrument(skip_all, fields(node = %ctx.state.node_name(), len = requests.len()))]
    pub(crate) fn on_client_batch(
        &mut self,
        ctx: &mut Ctx,
        requests: Vec<RequestId>,
    ) -> SubmitBatchResult<Option<ThreePhaseKey>> {
        if !ctx.state.is_acting_primary() {
            debug!(target: LOG_TARGET, view = %ctx.state.view(), "Not the acting primary, ignoring batch");
            return Ok(None);
        }

        let seq = self
            .last_pre_prepared
            .max(ctx.state.low_watermark())
            .next_expect();
        let high = ctx.state.high_watermark();
        ensure!(seq <= high, AboveHighWatermarkSnafu { seq, high });

        let key = ThreePhaseKey::new(ctx.state.view(), seq);
        let pre_prepare = PrePrepare::new(ctx.state.instance_id(), key, requests, Timestamp::now());
        debug!(target: LOG_TARGET, %key, digest = %pre_prepare.digest, "Proposing");
        let sig = ctx.broadcast(pre_prepare.clone());
        self.accept_pre_prepare(ctx, Signed::new(pre_prepare, sig));
        Ok(Some(key))
    }
}
