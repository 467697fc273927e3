//! Continuous batching scheduler
//!
//! Every step the scheduler picks which requests run and how many tokens
//! each computes:
//!
//! - Running requests first, in admission order; when the pool runs dry the
//!   most recently admitted running request is preempted and recomputed later
//! - Waiting requests next, reusing prefix-cached blocks where possible, and
//!   only if nothing was preempted this step
//! - Long prefills are chunked by `long_prefill_token_threshold` and by the
//!   step's token budget
//! - Encoder inputs are scheduled alongside the tokens that consume them

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::encoder_cache::{compute_encoder_budget, EncoderCacheManager};
use crate::executor::ExecutionResult;
use crate::output::{CachedRequestData, EngineCoreOutputs, NewRequestData, SchedulerOutput};
use crate::reconciler::{ReconcileContext, StepReconciler};
use crate::request::{Request, RequestArena, RequestStatus};
use crate::stop::TokenDecoder;
use tessera_kv::{KvCacheBlocks, KvCacheConfig, KvCacheManager, SlotRequest};
use tessera_types::{
    ClientIndex, EngineCoreConfig, RequestId, RequestIndex, Result, SchedulerConfig,
    SchedulerStats, SpecDecodingStats, TesseraError,
};

pub struct Scheduler {
    config: SchedulerConfig,
    kv_cache_manager: KvCacheManager,
    encoder_cache: EncoderCacheManager,
    max_encoder_budget: usize,
    requests: RequestArena,
    waiting: VecDeque<RequestIndex>,
    running: Vec<RequestIndex>,
    finished_req_ids: HashSet<RequestId>,
    reconciler: StepReconciler,
    decoder: Option<Arc<dyn TokenDecoder>>,
    block_size: usize,
    num_lookahead_tokens: usize,
    num_preemptions: u64,
}

/// Requests admitted or resumed in this step
struct Admitted {
    index: RequestIndex,
    resumed: bool,
}

impl Scheduler {
    pub fn new(config: &EngineCoreConfig, kv_cache_config: &KvCacheConfig) -> Result<Self> {
        config.validate()?;
        let kv_cache_manager = KvCacheManager::new(
            kv_cache_config,
            config.scheduler.max_model_len,
            config.cache.enable_prefix_caching,
            config.use_eagle(),
            config.scheduler.log_stats,
        )?;
        let max_encoder_budget = compute_encoder_budget(&config.scheduler);
        let num_lookahead_tokens = config.num_lookahead_tokens();

        info!(
            "Scheduler ready: max_num_seqs={}, max_num_batched_tokens={}, max_model_len={}, lookahead={}",
            config.scheduler.max_num_seqs,
            config.scheduler.max_num_batched_tokens,
            config.scheduler.max_model_len,
            num_lookahead_tokens
        );

        Ok(Self {
            config: config.scheduler.clone(),
            block_size: kv_cache_manager.block_size(),
            kv_cache_manager,
            encoder_cache: EncoderCacheManager::new(max_encoder_budget),
            max_encoder_budget,
            requests: RequestArena::new(),
            waiting: VecDeque::new(),
            running: Vec::new(),
            finished_req_ids: HashSet::new(),
            reconciler: StepReconciler::new(config.scheduler.max_model_len, num_lookahead_tokens),
            decoder: None,
            num_lookahead_tokens,
            num_preemptions: 0,
        })
    }

    /// Enable stop-string matching
    pub fn with_token_decoder(mut self, decoder: Arc<dyn TokenDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_model_len(&self) -> usize {
        self.config.max_model_len
    }

    pub fn kv_cache_manager(&self) -> &KvCacheManager {
        &self.kv_cache_manager
    }

    pub fn encoder_cache(&self) -> &EncoderCacheManager {
        &self.encoder_cache
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_unfinished_requests(&self) -> usize {
        self.running.len() + self.waiting.len()
    }

    pub fn has_requests(&self) -> bool {
        self.num_unfinished_requests() > 0 || !self.finished_req_ids.is_empty()
    }

    pub fn request(&self, request_id: &RequestId) -> Option<&Request> {
        self.requests
            .lookup(request_id)
            .and_then(|index| self.requests.get(index))
    }

    /// Ids and owning clients of every waiting or running request
    pub fn unfinished_requests(&self) -> Vec<(RequestId, ClientIndex)> {
        self.requests
            .iter()
            .map(|(_, r)| (r.request_id.clone(), r.client_index))
            .collect()
    }

    pub fn add_request(&mut self, request: Request) -> Result<RequestIndex> {
        request.validate(self.config.max_model_len)?;
        if request.block_size() != self.block_size {
            return Err(TesseraError::invalid_parameter(format!(
                "request {} hashes blocks of {} tokens, the cache uses {}",
                request.request_id,
                request.block_size(),
                self.block_size
            )));
        }
        if request.status != RequestStatus::Waiting {
            return Err(TesseraError::invalid_state(format!(
                "request {} added while {:?}",
                request.request_id, request.status
            )));
        }
        let request_id = request.request_id.clone();
        let index = self.requests.insert(request)?;
        self.waiting.push_back(index);
        debug!("Added request {} as {}", request_id, index);
        Ok(index)
    }

    /// Finish requests from outside the step loop, e.g. client aborts.
    ///
    /// Unknown ids are ignored. This also retries requests a failed
    /// reconciliation could not release. Every id is processed; the first
    /// release error is returned after the rest are done. Returns how many
    /// were finished.
    pub fn finish_requests<I>(&mut self, request_ids: I, status: RequestStatus) -> Result<usize>
    where
        I: IntoIterator<Item = RequestId>,
    {
        if !status.is_finished() {
            return Err(TesseraError::invalid_parameter(format!(
                "{:?} is not a finished status",
                status
            )));
        }
        let mut count = 0;
        let mut first_error = None;
        for request_id in request_ids {
            let Some(index) = self.requests.lookup(&request_id) else {
                continue;
            };
            self.running.retain(|&i| i != index);
            self.waiting.retain(|&i| i != index);
            self.requests.expect_mut(index)?.status = status;
            match self.context().free_request(index) {
                Ok(_) => count += 1,
                Err(e) => {
                    warn!("Failed to release request {}: {}", request_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if count > 0 {
            debug!("Finished {} requests with {:?}", count, status);
        }
        first_error.map_or(Ok(count), Err)
    }

    fn context(&mut self) -> ReconcileContext<'_> {
        ReconcileContext {
            requests: &mut self.requests,
            running: &mut self.running,
            kv_cache: &mut self.kv_cache_manager,
            encoder_cache: &mut self.encoder_cache,
            finished_req_ids: &mut self.finished_req_ids,
            decoder: self.decoder.as_deref(),
        }
    }

    /// Plan the next step.
    ///
    /// `num_computed_tokens` of every scheduled request is advanced
    /// optimistically; the reconciler rolls back rejected drafts.
    pub fn schedule(&mut self) -> Result<SchedulerOutput> {
        let mut token_budget = self.config.max_num_batched_tokens;
        let mut encoder_budget = self.max_encoder_budget;
        let threshold = self.config.long_prefill_token_threshold;
        let max_model_len = self.config.max_model_len;

        let mut scheduled_running: Vec<RequestIndex> = Vec::new();
        let mut admitted: Vec<Admitted> = Vec::new();
        let mut preempted: Vec<RequestIndex> = Vec::new();
        let mut new_blocks_by_req: HashMap<RequestIndex, KvCacheBlocks> = HashMap::new();
        let mut num_scheduled_tokens: HashMap<RequestIndex, usize> = HashMap::new();
        let mut scheduled_spec_decode_tokens = HashMap::new();
        let mut scheduled_encoder_inputs = HashMap::new();

        // Running requests.
        let mut req_index = 0;
        while req_index < self.running.len() && token_budget > 0 {
            let index = self.running[req_index];
            let request = self
                .requests
                .get(index)
                .ok_or_else(|| TesseraError::not_found(format!("Request not found: {}", index)))?;

            let mut num_new_tokens = request
                .num_tokens_with_spec()
                .saturating_sub(request.num_computed_tokens);
            if threshold > 0 && threshold < num_new_tokens {
                num_new_tokens = threshold;
            }
            num_new_tokens = num_new_tokens
                .min(token_budget)
                .min(max_model_len.saturating_sub(1 + request.num_computed_tokens));

            let (encoder_inputs, num_new_tokens, new_encoder_budget) = self
                .try_schedule_encoder_inputs(
                    request,
                    request.num_computed_tokens,
                    num_new_tokens,
                    encoder_budget,
                );
            if num_new_tokens == 0 {
                // Waiting on encoder budget, or at the context limit.
                req_index += 1;
                continue;
            }

            let new_blocks = loop {
                let request = self.requests.get(index).ok_or_else(|| {
                    TesseraError::not_found(format!("Request not found: {}", index))
                })?;
                let slot = SlotRequest {
                    request: index,
                    block_hashes: request.block_hashes(),
                    num_tokens: request.num_tokens(),
                    num_computed_tokens: request.num_computed_tokens,
                    num_new_tokens,
                    num_new_computed_tokens: 0,
                    new_computed_blocks: None,
                    num_lookahead_tokens: self.num_lookahead_tokens,
                };
                match self.kv_cache_manager.allocate_slots(slot) {
                    Ok(blocks) => break Some(blocks),
                    Err(e) if e.is_out_of_blocks() => {
                        let Some(victim) = self.running.pop() else {
                            break None;
                        };
                        self.preempt(victim)?;
                        preempted.push(victim);
                        if victim == index {
                            break None;
                        }
                    }
                    Err(e) => return Err(e),
                }
            };
            let Some(new_blocks) = new_blocks else {
                break;
            };

            let request = self.requests.expect_mut(index)?;
            if !request.spec_token_ids.is_empty() {
                let num_scheduled_spec = (num_new_tokens + request.num_computed_tokens)
                    .saturating_sub(request.num_tokens());
                let mut drafts = std::mem::take(&mut request.spec_token_ids);
                if num_scheduled_spec > 0 {
                    drafts.truncate(num_scheduled_spec);
                    scheduled_spec_decode_tokens.insert(index, drafts);
                }
            }
            if !encoder_inputs.is_empty() {
                for &input_id in &encoder_inputs {
                    self.encoder_cache.allocate(request, input_id);
                }
                scheduled_encoder_inputs.insert(index, encoder_inputs);
                encoder_budget = new_encoder_budget;
            }

            scheduled_running.push(index);
            new_blocks_by_req.insert(index, new_blocks);
            num_scheduled_tokens.insert(index, num_new_tokens);
            token_budget -= num_new_tokens;
            req_index += 1;
        }

        // Waiting requests, unless this step already had to preempt.
        if preempted.is_empty() {
            while let Some(&index) = self.waiting.front() {
                if token_budget == 0 || self.running.len() >= self.config.max_num_seqs {
                    break;
                }
                let request = self.requests.get(index).ok_or_else(|| {
                    TesseraError::not_found(format!("Request not found: {}", index))
                })?;

                let (computed_blocks, num_new_local_computed_tokens) =
                    if request.num_computed_tokens == 0 {
                        self.kv_cache_manager.get_computed_blocks(
                            request.block_hashes(),
                            request.num_tokens(),
                            false,
                        )?
                    } else {
                        (KvCacheBlocks::empty(self.kv_cache_manager.num_groups()), 0)
                    };
                let num_computed_tokens = request.num_computed_tokens + num_new_local_computed_tokens;

                let mut num_new_tokens = request.num_tokens().saturating_sub(num_computed_tokens);
                if threshold > 0 && threshold < num_new_tokens {
                    num_new_tokens = threshold;
                }
                num_new_tokens = num_new_tokens.min(token_budget);

                let (encoder_inputs, num_new_tokens, new_encoder_budget) = self
                    .try_schedule_encoder_inputs(
                        request,
                        num_computed_tokens,
                        num_new_tokens,
                        encoder_budget,
                    );
                if num_new_tokens == 0 {
                    break;
                }

                let slot = SlotRequest {
                    request: index,
                    block_hashes: request.block_hashes(),
                    num_tokens: request.num_tokens(),
                    num_computed_tokens: request.num_computed_tokens,
                    num_new_tokens,
                    num_new_computed_tokens: num_new_local_computed_tokens,
                    new_computed_blocks: Some(&computed_blocks),
                    num_lookahead_tokens: self.num_lookahead_tokens,
                };
                match self.kv_cache_manager.allocate_slots(slot) {
                    Ok(_) => {}
                    Err(e) if e.is_out_of_blocks() => {
                        warn!(
                            "Deferring request {}: {}",
                            request.request_id, e
                        );
                        break;
                    }
                    Err(e) => return Err(e),
                }

                self.waiting.pop_front();
                self.running.push(index);
                let request = self.requests.expect_mut(index)?;
                admitted.push(Admitted {
                    index,
                    resumed: request.status == RequestStatus::Preempted,
                });
                if !encoder_inputs.is_empty() {
                    for &input_id in &encoder_inputs {
                        self.encoder_cache.allocate(request, input_id);
                    }
                    scheduled_encoder_inputs.insert(index, encoder_inputs);
                    encoder_budget = new_encoder_budget;
                }
                request.status = RequestStatus::Running;
                request.num_computed_tokens = num_computed_tokens;
                request.num_cached_tokens.get_or_insert(num_computed_tokens);
                num_scheduled_tokens.insert(index, num_new_tokens);
                token_budget -= num_new_tokens;
            }
        }

        let total_num_scheduled_tokens: usize = num_scheduled_tokens.values().sum();
        debug_assert!(total_num_scheduled_tokens <= self.config.max_num_batched_tokens);

        let num_common_prefix_blocks = match self.running.first() {
            Some(&first) => self
                .kv_cache_manager
                .get_num_common_prefix_blocks(first, self.running.len()),
            None => vec![0; self.kv_cache_manager.num_groups()],
        };

        let mut scheduled_new_reqs = Vec::new();
        let mut scheduled_cached_reqs = Vec::new();
        for Admitted { index, resumed } in admitted {
            let request = self
                .requests
                .get(index)
                .ok_or_else(|| TesseraError::not_found(format!("Request not found: {}", index)))?;
            let block_ids = self.kv_cache_manager.get_block_ids(index);
            if resumed {
                let num_scheduled = num_scheduled_tokens.get(&index).copied().unwrap_or(0);
                let end = (request.num_computed_tokens + num_scheduled).min(request.num_tokens());
                scheduled_cached_reqs.push(CachedRequestData {
                    request: index,
                    request_id: request.request_id.clone(),
                    resumed_from_preemption: true,
                    new_token_ids: request.all_token_ids()[..end].to_vec(),
                    new_block_ids: block_ids,
                    num_computed_tokens: request.num_computed_tokens,
                });
            } else {
                scheduled_new_reqs.push(NewRequestData::from_request(index, request, block_ids));
            }
        }
        for index in scheduled_running {
            let request = self
                .requests
                .get(index)
                .ok_or_else(|| TesseraError::not_found(format!("Request not found: {}", index)))?;
            let new_block_ids = new_blocks_by_req
                .remove(&index)
                .map(|b| b.blocks)
                .unwrap_or_default();
            scheduled_cached_reqs.push(CachedRequestData {
                request: index,
                request_id: request.request_id.clone(),
                resumed_from_preemption: false,
                new_token_ids: Vec::new(),
                new_block_ids,
                num_computed_tokens: request.num_computed_tokens,
            });
        }

        // Advance optimistically; the plan above carries the old counts.
        for (&index, &num_tokens) in &num_scheduled_tokens {
            self.requests.expect_mut(index)?.num_computed_tokens += num_tokens;
        }

        let plan = SchedulerOutput {
            scheduled_new_reqs,
            scheduled_cached_reqs,
            num_scheduled_tokens,
            total_num_scheduled_tokens,
            scheduled_spec_decode_tokens,
            scheduled_encoder_inputs,
            num_common_prefix_blocks,
            finished_req_ids: std::mem::take(&mut self.finished_req_ids),
            free_encoder_input_ids: self.encoder_cache.take_freed_ids(),
        };
        debug!(
            "Scheduled {} tokens: {} new, {} cached, {} preempted, {} waiting",
            plan.total_num_scheduled_tokens,
            plan.scheduled_new_reqs.len(),
            plan.scheduled_cached_reqs.len(),
            preempted.len(),
            self.waiting.len()
        );
        Ok(plan)
    }

    /// Release a running request's blocks and put it back at the head of
    /// the waiting queue; it will be recomputed from scratch
    fn preempt(&mut self, index: RequestIndex) -> Result<()> {
        let request = self.requests.expect_mut(index)?;
        request.status = RequestStatus::Preempted;
        request.num_computed_tokens = 0;
        request.spec_token_ids.clear();
        request.num_preemptions += 1;
        self.encoder_cache.free(request);
        debug!(
            "Preempted request {} ({} times)",
            request.request_id, request.num_preemptions
        );
        self.kv_cache_manager.free(index, false)?;
        self.num_preemptions += 1;
        self.waiting.push_front(index);
        Ok(())
    }

    /// Encoder inputs needed by the tokens about to be scheduled.
    ///
    /// When an input does not fit in the budget, the token count is cut to
    /// stop right before it.
    fn try_schedule_encoder_inputs(
        &self,
        request: &Request,
        num_computed_tokens: usize,
        mut num_new_tokens: usize,
        mut encoder_budget: usize,
    ) -> (Vec<usize>, usize, usize) {
        let mut scheduled = Vec::new();
        if num_new_tokens == 0 || !request.has_encoder_inputs() {
            return (scheduled, num_new_tokens, encoder_budget);
        }
        for (input_id, input) in request.encoder_inputs.iter().enumerate() {
            if input.start_position >= num_computed_tokens + num_new_tokens {
                break;
            }
            if input.end_position() <= num_computed_tokens {
                // Already in the decoder KV cache.
                continue;
            }
            if self.encoder_cache.has_cache(request, input_id) {
                continue;
            }
            if input.num_tokens > encoder_budget
                || !self.encoder_cache.can_allocate(request, input_id)
            {
                num_new_tokens = input.start_position.saturating_sub(num_computed_tokens);
                break;
            }
            encoder_budget -= input.num_tokens;
            scheduled.push(input_id);
        }
        (scheduled, num_new_tokens, encoder_budget)
    }

    /// Apply the executor's result for `plan`, produced by the last
    /// [`Scheduler::schedule`] call
    pub fn update_from_output(
        &mut self,
        plan: &SchedulerOutput,
        result: ExecutionResult,
    ) -> Result<HashMap<ClientIndex, EngineCoreOutputs>> {
        let reconciler = self.reconciler;
        let reconciled = reconciler.reconcile(self.context(), plan, result)?;

        let mut outputs: HashMap<ClientIndex, EngineCoreOutputs> = reconciled
            .outputs
            .into_iter()
            .map(|(client, outs)| (client, EngineCoreOutputs::new(outs)))
            .collect();
        // Idle steps report nothing and leave the counters for the next one.
        if plan.total_num_scheduled_tokens == 0 && outputs.is_empty() {
            return Ok(outputs);
        }
        if let Some(stats) = self.make_stats(reconciled.spec_decoding_stats) {
            let carrier = outputs.keys().next().copied().unwrap_or_default();
            outputs.entry(carrier).or_default().scheduler_stats = Some(stats);
        }
        Ok(outputs)
    }

    pub fn make_stats(
        &mut self,
        spec_decoding_stats: Option<SpecDecodingStats>,
    ) -> Option<SchedulerStats> {
        if !self.config.log_stats {
            return None;
        }
        Some(SchedulerStats {
            num_running_reqs: self.running.len(),
            num_waiting_reqs: self.waiting.len(),
            kv_cache_usage: self.kv_cache_manager.usage(),
            num_preemptions: self.num_preemptions,
            prefix_cache_stats: self
                .kv_cache_manager
                .make_prefix_cache_stats()
                .unwrap_or_default(),
            spec_decoding_stats,
        })
    }

    /// Drop all cached prefixes; fails while any block is in use
    pub fn reset_prefix_cache(&mut self) -> bool {
        self.kv_cache_manager.reset_prefix_cache()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running.len())
            .field("waiting", &self.waiting.len())
            .field("block_size", &self.block_size)
            .field("num_preemptions", &self.num_preemptions)
            .finish()
    }
}
