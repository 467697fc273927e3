//! Step reconciliation
//!
//! Turns one step's executor result into request state updates and
//! per-client outcomes:
//!
//! - An execution failure aborts every running request and releases its
//!   blocks in the same pass, withdrawing blocks the step never wrote from
//!   the prefix cache; the scheduler stays usable
//! - Requests with no scheduled tokens are carried over untouched
//! - Rejected draft positions are rolled back from the computed count
//! - Sampled tokens are appended one at a time with a stop check after each;
//!   tokens past the stop are dropped from the delta
//! - Grammars advance over kept tokens, end the request once terminated
//!   and filter next-step drafts
//! - Encoder outputs whose placeholders are computed are released

use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

use crate::encoder_cache::EncoderCacheManager;
use crate::executor::{ExecutionFailure, ExecutionResult, ModelRunnerOutput, SampledOutput};
use crate::output::{EngineCoreOutput, SchedulerOutput, StepOutcome};
use crate::request::{Request, RequestArena, RequestStatus};
use crate::spec_decode::{num_rejected_tokens, observe_draft};
use crate::stop::{check_stop, TokenDecoder};
use tessera_kv::KvCacheManager;
use tessera_types::{
    ClientIndex, FinishReason, RequestId, RequestIndex, Result, SpecDecodingStats, TesseraError,
};

/// Mutable scheduler state the reconciler works on
pub struct ReconcileContext<'a> {
    pub requests: &'a mut RequestArena,
    pub running: &'a mut Vec<RequestIndex>,
    pub kv_cache: &'a mut KvCacheManager,
    pub encoder_cache: &'a mut EncoderCacheManager,
    /// Reported to the executor with the next plan
    pub finished_req_ids: &'a mut HashSet<RequestId>,
    pub decoder: Option<&'a dyn TokenDecoder>,
}

impl ReconcileContext<'_> {
    /// Release everything a finished request holds and drop it from the
    /// arena. The caller sets the finished status first.
    pub fn free_request(&mut self, index: RequestIndex) -> Result<Request> {
        let request = self
            .requests
            .get(index)
            .ok_or_else(|| TesseraError::not_found(format!("Request not found: {}", index)))?;
        if !request.is_finished() {
            return Err(TesseraError::invalid_state(format!(
                "request {} freed while {:?}",
                request.request_id, request.status
            )));
        }
        let aborted = request.status == RequestStatus::FinishedAborted;
        self.encoder_cache.free(request);
        self.finished_req_ids.insert(request.request_id.clone());
        self.kv_cache.free(index, aborted)?;
        self.requests
            .remove(index)
            .ok_or_else(|| TesseraError::internal(format!("Request {} vanished", index)))
    }
}

/// Outcomes of one step, grouped by the client that owns each request
#[derive(Debug, Default)]
pub struct ReconcileOutput {
    pub outputs: HashMap<ClientIndex, Vec<EngineCoreOutput>>,
    pub spec_decoding_stats: Option<SpecDecodingStats>,
}

impl ReconcileOutput {
    fn push(&mut self, client: ClientIndex, request_id: RequestId, outcome: StepOutcome) {
        self.outputs
            .entry(client)
            .or_default()
            .push(EngineCoreOutput {
                request_id,
                outcome,
            });
    }

    pub fn num_outcomes(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepReconciler {
    max_model_len: usize,
    num_spec_tokens: usize,
}

impl StepReconciler {
    pub fn new(max_model_len: usize, num_spec_tokens: usize) -> Self {
        Self {
            max_model_len,
            num_spec_tokens,
        }
    }

    /// Apply `result` for `plan`.
    ///
    /// Every request in the running set is visited even when releasing one
    /// fails; those that could not be released stay in the running set and
    /// the first error is returned.
    pub fn reconcile(
        &self,
        ctx: ReconcileContext<'_>,
        plan: &SchedulerOutput,
        result: ExecutionResult,
    ) -> Result<ReconcileOutput> {
        match result {
            ExecutionResult::Ok(output) => self.apply(ctx, plan, output),
            ExecutionResult::Failed(failure) => self.abort_running(ctx, plan, failure),
        }
    }

    fn abort_running(
        &self,
        mut ctx: ReconcileContext<'_>,
        plan: &SchedulerOutput,
        failure: ExecutionFailure,
    ) -> Result<ReconcileOutput> {
        let cause = TesseraError::from(failure);
        let running = std::mem::take(ctx.running);
        warn!(
            "Model execution failed, aborting {} running requests: {}",
            running.len(),
            cause
        );

        let mut out = ReconcileOutput::default();
        let mut retained = Vec::new();
        let mut first_error = None;
        for index in running {
            let Some(request) = ctx.requests.get_mut(index) else {
                error!("Running request {} missing from the arena", index);
                continue;
            };
            request.status = RequestStatus::FinishedAborted;
            let client = request.client_index;
            // Blocks published for this step's tokens hold no KV.
            let num_written = request
                .num_computed_tokens
                .saturating_sub(plan.num_scheduled_tokens(index));
            ctx.kv_cache.uncache_unwritten_blocks(index, num_written);
            match ctx.free_request(index) {
                Ok(request) => out.push(
                    client,
                    request.request_id,
                    StepOutcome::Aborted {
                        cause: cause.clone(),
                    },
                ),
                Err(e) => {
                    error!("Failed to release aborted request {}: {}", index, e);
                    retained.push(index);
                    first_error.get_or_insert(e);
                }
            }
        }
        *ctx.running = retained;
        first_error.map_or(Ok(out), Err)
    }

    fn apply(
        &self,
        mut ctx: ReconcileContext<'_>,
        plan: &SchedulerOutput,
        output: ModelRunnerOutput,
    ) -> Result<ReconcileOutput> {
        let ModelRunnerOutput {
            mut sampled,
            mut draft_token_ids,
        } = output;
        let running = std::mem::take(ctx.running);
        let mut still_running = Vec::with_capacity(running.len());
        let mut out = ReconcileOutput::default();
        let mut first_error = None;

        for index in running {
            if plan.num_scheduled_tokens(index) == 0 {
                still_running.push(index);
                continue;
            }
            let Some(request) = ctx.requests.get_mut(index) else {
                error!("Running request {} missing from the arena", index);
                continue;
            };
            let SampledOutput {
                token_ids: mut new_token_ids,
                logprobs,
            } = sampled.remove(&index).unwrap_or_default();

            if let Some(drafts) = plan
                .scheduled_spec_decode_tokens
                .get(&index)
                .filter(|d| !d.is_empty())
            {
                let rejected = num_rejected_tokens(drafts.len(), new_token_ids.len());
                request.num_computed_tokens = request.num_computed_tokens.saturating_sub(rejected);
                observe_draft(
                    &mut out.spec_decoding_stats,
                    self.num_spec_tokens,
                    drafts.len(),
                    new_token_ids.len(),
                );
            }

            if request.has_encoder_inputs() {
                ctx.encoder_cache.free_computed_inputs(request);
            }

            let mut stopped = false;
            let mut num_kept = new_token_ids.len();
            for (i, &token) in new_token_ids.iter().enumerate() {
                request.append_output_token_ids(&[token]);
                stopped = check_stop(request, self.max_model_len, ctx.decoder);
                if let Some(grammar) = request.grammar.as_mut() {
                    if !grammar.accept_tokens(&request.request_id, &[token]) {
                        error!(
                            "Grammar rejected token {} of request {}",
                            token, request.request_id
                        );
                    }
                    if !stopped && grammar.is_terminated() {
                        request.status = RequestStatus::FinishedStopped;
                        stopped = true;
                    }
                }
                if stopped {
                    num_kept = i + 1;
                    break;
                }
            }
            new_token_ids.truncate(num_kept);

            let new_logprobs = request
                .sampling_params
                .logprobs
                .and(logprobs)
                .map(|l| l.truncated(new_token_ids.len()));

            if let Some(drafts) = draft_token_ids.as_mut().and_then(|d| d.remove(&index)) {
                request.spec_token_ids = match request.grammar.as_ref() {
                    Some(grammar) => grammar.validate_tokens(&drafts),
                    None => drafts,
                };
            }

            let client = request.client_index;
            if stopped {
                let reason = request.finish_reason().unwrap_or(FinishReason::Stop);
                let stop_reason = request.stop_reason.clone();
                let num_cached_tokens = request.num_cached_tokens.unwrap_or(0);
                match ctx.free_request(index) {
                    Ok(request) => {
                        debug!(
                            "Request {} finished ({}) after {} output tokens",
                            request.request_id,
                            reason,
                            request.num_output_tokens()
                        );
                        out.push(
                            client,
                            request.request_id,
                            StepOutcome::Finished {
                                new_token_ids,
                                new_logprobs,
                                reason,
                                stop_reason,
                                num_cached_tokens,
                            },
                        );
                    }
                    Err(e) => {
                        error!("Failed to release finished request {}: {}", index, e);
                        still_running.push(index);
                        first_error.get_or_insert(e);
                    }
                }
            } else {
                // Partial prefills sample nothing and report nothing.
                if !new_token_ids.is_empty() {
                    out.push(
                        client,
                        request.request_id.clone(),
                        StepOutcome::Continue {
                            new_token_ids,
                            new_logprobs,
                        },
                    );
                }
                still_running.push(index);
            }
        }

        *ctx.running = still_running;
        first_error.map_or(Ok(out), Err)
    }
}
