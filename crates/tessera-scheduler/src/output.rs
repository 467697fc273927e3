//! Step plans handed to the executor and outcomes handed back to clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::request::Request;
use tessera_types::{
    BlockId, FinishReason, RequestId, RequestIndex, SamplingParams, SchedulerStats, StopReason,
    TesseraError, TokenId,
};

/// First scheduling of a request; the executor sees its full prompt
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequestData {
    pub request: RequestIndex,
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<TokenId>,
    pub sampling_params: SamplingParams,
    /// One block list per allocation group
    pub block_ids: Vec<Vec<BlockId>>,
    pub num_computed_tokens: usize,
}

impl NewRequestData {
    pub fn from_request(index: RequestIndex, request: &Request, block_ids: Vec<Vec<BlockId>>) -> Self {
        Self {
            request: index,
            request_id: request.request_id.clone(),
            prompt_token_ids: request.prompt_token_ids.clone(),
            sampling_params: request.sampling_params.clone(),
            block_ids,
            num_computed_tokens: request.num_computed_tokens,
        }
    }
}

/// A request the executor already knows; only the deltas are sent
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRequestData {
    pub request: RequestIndex,
    pub request_id: RequestId,
    /// The executor dropped its state and must rebuild it from `new_block_ids`
    pub resumed_from_preemption: bool,
    /// Tokens the executor has not seen, only sent on resumption
    pub new_token_ids: Vec<TokenId>,
    pub new_block_ids: Vec<Vec<BlockId>>,
    pub num_computed_tokens: usize,
}

/// Everything the executor needs for one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerOutput {
    pub scheduled_new_reqs: Vec<NewRequestData>,
    pub scheduled_cached_reqs: Vec<CachedRequestData>,
    pub num_scheduled_tokens: HashMap<RequestIndex, usize>,
    pub total_num_scheduled_tokens: usize,
    /// Draft tokens to verify, per request
    pub scheduled_spec_decode_tokens: HashMap<RequestIndex, Vec<TokenId>>,
    /// Encoder inputs to run, by position in the request's input list
    pub scheduled_encoder_inputs: HashMap<RequestIndex, Vec<usize>>,
    /// Leading blocks shared by every running request, per group
    pub num_common_prefix_blocks: Vec<usize>,
    /// Requests finished since the previous step; executor state can go
    pub finished_req_ids: HashSet<RequestId>,
    /// Encoder outputs the executor may drop
    pub free_encoder_input_ids: Vec<(RequestId, usize)>,
}

impl SchedulerOutput {
    pub fn num_scheduled_tokens(&self, request: RequestIndex) -> usize {
        self.num_scheduled_tokens.get(&request).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total_num_scheduled_tokens == 0
    }
}

/// Top logprobs per sampled position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogprobsLists {
    pub token_ids: Vec<Vec<TokenId>>,
    pub logprobs: Vec<Vec<f32>>,
    pub sampled_token_ranks: Vec<usize>,
}

impl LogprobsLists {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Positions `..end`, to match a trimmed token delta
    pub fn truncated(&self, end: usize) -> Self {
        let end = end.min(self.len());
        Self {
            token_ids: self.token_ids[..end].to_vec(),
            logprobs: self.logprobs[..end.min(self.logprobs.len())].to_vec(),
            sampled_token_ranks: self.sampled_token_ranks[..end.min(self.sampled_token_ranks.len())]
                .to_vec(),
        }
    }
}

/// What happened to one request in one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Continue {
        new_token_ids: Vec<TokenId>,
        new_logprobs: Option<LogprobsLists>,
    },
    Finished {
        new_token_ids: Vec<TokenId>,
        new_logprobs: Option<LogprobsLists>,
        reason: FinishReason,
        stop_reason: Option<StopReason>,
        num_cached_tokens: usize,
    },
    Aborted {
        cause: TesseraError,
    },
}

impl StepOutcome {
    pub fn new_token_ids(&self) -> &[TokenId] {
        match self {
            StepOutcome::Continue { new_token_ids, .. }
            | StepOutcome::Finished { new_token_ids, .. } => new_token_ids,
            StepOutcome::Aborted { .. } => &[],
        }
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            StepOutcome::Continue { .. } => None,
            StepOutcome::Finished { reason, .. } => Some(*reason),
            StepOutcome::Aborted { .. } => Some(FinishReason::Abort),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepOutcome::Continue { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCoreOutput {
    pub request_id: RequestId,
    pub outcome: StepOutcome,
}

/// One step's outputs for one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCoreOutputs {
    pub outputs: Vec<EngineCoreOutput>,
    pub scheduler_stats: Option<SchedulerStats>,
    pub timestamp: DateTime<Utc>,
}

impl EngineCoreOutputs {
    pub fn new(outputs: Vec<EngineCoreOutput>) -> Self {
        Self {
            outputs,
            scheduler_stats: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

impl Default for EngineCoreOutputs {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
