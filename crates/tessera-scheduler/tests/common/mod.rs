//! Shared fixtures for scheduler and engine tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tessera_kv::{BlockGeometry, CachePlanner, CacheSpecSet, KvCacheConfig, PlannerConfig};
use tessera_scheduler::{
    EngineCoreOutput, EngineCoreOutputs, ExecutionFailure, ExecutionResult, ModelExecutor,
    ModelRunnerOutput, Request, SampledOutput, Scheduler, SchedulerOutput,
};
use tessera_types::{
    CacheConfig, ClientIndex, DataType, EngineCoreConfig, RequestId, RequestIndex,
    SamplingParams, SchedulerConfig, TokenId,
};

pub const BS: usize = 16;
pub const MAX_MODEL_LEN: usize = 256;

pub fn specs() -> CacheSpecSet {
    CacheSpecSet::from_layers([
        ("layers.0.attn", BlockGeometry::full(BS, 2, 64, DataType::FP16).unwrap()),
        ("layers.1.attn", BlockGeometry::full(BS, 2, 64, DataType::FP16).unwrap()),
    ])
    .unwrap()
}

pub fn kv_config(num_blocks: usize) -> KvCacheConfig {
    let planner = PlannerConfig {
        available_memory_bytes: 1 << 30,
        max_model_len: MAX_MODEL_LEN,
        block_size: BS,
        num_gpu_blocks_override: Some(num_blocks),
    };
    CachePlanner::plan(&specs(), &planner).unwrap()
}

pub fn engine_config(num_blocks: usize) -> EngineCoreConfig {
    EngineCoreConfig {
        cache: CacheConfig {
            block_size: BS,
            num_gpu_blocks_override: Some(num_blocks),
            ..Default::default()
        },
        scheduler: SchedulerConfig {
            max_num_seqs: 8,
            max_num_batched_tokens: 256,
            max_model_len: MAX_MODEL_LEN,
            log_stats: false,
            ..Default::default()
        },
        speculative: None,
    }
}

pub fn scheduler(config: &EngineCoreConfig, num_blocks: usize) -> Scheduler {
    Scheduler::new(config, &kv_config(num_blocks)).unwrap()
}

pub fn seq(start: u32, len: usize) -> Vec<TokenId> {
    (start..start + len as u32).map(TokenId).collect()
}

pub fn request(id: &str, prompt: Vec<TokenId>, max_tokens: usize) -> Request {
    Request::new(
        id,
        prompt,
        SamplingParams::with_max_tokens(max_tokens),
        None,
        BS,
    )
}

pub fn output_for(index: RequestIndex, tokens: &[u32]) -> ModelRunnerOutput {
    let mut sampled = HashMap::new();
    sampled.insert(
        index,
        SampledOutput::tokens(tokens.iter().copied().map(TokenId).collect()),
    );
    ModelRunnerOutput {
        sampled,
        draft_token_ids: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Fail,
    Panic,
}

/// Lets a test steer an executor it no longer owns
#[derive(Clone)]
pub struct MockControl {
    mode: Arc<Mutex<Mode>>,
    steps: Arc<AtomicUsize>,
}

impl MockControl {
    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn num_steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

/// Samples one token per request once its whole sequence is computed
pub struct MockExecutor {
    mode: Arc<Mutex<Mode>>,
    steps: Arc<AtomicUsize>,
    seq_lens: HashMap<RequestIndex, usize>,
    indices: HashMap<RequestId, RequestIndex>,
    next_token: u32,
}

impl MockExecutor {
    pub fn new() -> (Self, MockControl) {
        let mode = Arc::new(Mutex::new(Mode::Normal));
        let steps = Arc::new(AtomicUsize::new(0));
        let control = MockControl {
            mode: Arc::clone(&mode),
            steps: Arc::clone(&steps),
        };
        (
            Self {
                mode,
                steps,
                seq_lens: HashMap::new(),
                indices: HashMap::new(),
                next_token: 1000,
            },
            control,
        )
    }
}

impl ModelExecutor for MockExecutor {
    fn execute_step(&mut self, plan: &SchedulerOutput) -> ExecutionResult {
        self.steps.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock() {
            Mode::Normal => {}
            Mode::Fail => return ExecutionResult::Failed(ExecutionFailure::new("device lost")),
            Mode::Panic => panic!("kernel launch failed"),
        }

        for id in &plan.finished_req_ids {
            if let Some(index) = self.indices.remove(id) {
                self.seq_lens.remove(&index);
            }
        }

        let mut computed = HashMap::new();
        for new in &plan.scheduled_new_reqs {
            self.seq_lens.insert(new.request, new.prompt_token_ids.len());
            self.indices.insert(new.request_id.clone(), new.request);
            computed.insert(new.request, new.num_computed_tokens);
        }
        for cached in &plan.scheduled_cached_reqs {
            if cached.resumed_from_preemption {
                self.seq_lens.insert(cached.request, cached.new_token_ids.len());
                self.indices.insert(cached.request_id.clone(), cached.request);
            }
            computed.insert(cached.request, cached.num_computed_tokens);
        }

        let mut output = ModelRunnerOutput::default();
        for (&index, &num_scheduled) in &plan.num_scheduled_tokens {
            let Some(seq_len) = self.seq_lens.get_mut(&index) else {
                continue;
            };
            let done = computed.get(&index).copied().unwrap_or(0) + num_scheduled;
            if done >= *seq_len {
                let token = TokenId(self.next_token);
                self.next_token += 1;
                *seq_len += 1;
                output
                    .sampled
                    .insert(index, SampledOutput::tokens(vec![token]));
            }
        }
        ExecutionResult::Ok(output)
    }
}

/// Outcomes reported to the default client in one step
pub fn client_outputs(
    outputs: &HashMap<ClientIndex, EngineCoreOutputs>,
) -> Vec<EngineCoreOutput> {
    outputs
        .get(&ClientIndex::default())
        .map(|o| o.outputs.clone())
        .unwrap_or_default()
}

/// Schedule, run on `executor` and reconcile one step
pub fn run_step(
    scheduler: &mut Scheduler,
    executor: &mut MockExecutor,
) -> (SchedulerOutput, Vec<EngineCoreOutput>) {
    let plan = scheduler.schedule().unwrap();
    let result = executor.execute_step(&plan);
    let outputs = scheduler.update_from_output(&plan, result).unwrap();
    (plan, client_outputs(&outputs))
}
