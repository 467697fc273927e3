//! End-to-end: configuration file to engine core to finished requests

use std::collections::HashMap;
use std::path::PathBuf;

use tessera::scheduler::{ExecutionResult, ModelRunnerOutput, SampledOutput, SchedulerOutput};
use tessera::test_utils::init_test_env;
use tessera::types::{DataType, FinishReason, SamplingParams, TesseraError, TokenId};
use tessera::{build_engine_core, BlockGeometry, CacheSpecSet, Config, ModelExecutor, Request};

const CONFIG: &str = r#"
[cache]
block_size = 16
available_memory_bytes = 1073741824
num_gpu_blocks_override = 64

[scheduler]
max_num_seqs = 4
max_num_batched_tokens = 128
max_model_len = 512
long_prefill_token_threshold = 32
log_stats = true

[logging]
level = "warn"
format = "json"
"#;

fn write_config(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("tessera-{}-{}.toml", name, std::process::id()));
    std::fs::write(&path, content).unwrap();
    path
}

fn specs() -> CacheSpecSet {
    let full = BlockGeometry::full(16, 4, 64, DataType::FP16).unwrap();
    let sliding = BlockGeometry::sliding_window(16, 4, 64, DataType::FP16, 64).unwrap();
    CacheSpecSet::from_layers([
        ("model.layers.0.self_attn", full.clone()),
        ("model.layers.1.self_attn", sliding),
        ("model.layers.2.self_attn", full),
    ])
    .unwrap()
}

/// Echoes the last prompt token once the prompt is fully computed
#[derive(Default)]
struct EchoExecutor {
    prompts: HashMap<tessera::types::RequestIndex, (usize, TokenId)>,
}

impl ModelExecutor for EchoExecutor {
    fn execute_step(&mut self, plan: &SchedulerOutput) -> ExecutionResult {
        let mut computed = HashMap::new();
        for new in &plan.scheduled_new_reqs {
            let last = *new.prompt_token_ids.last().unwrap();
            self.prompts
                .insert(new.request, (new.prompt_token_ids.len(), last));
            computed.insert(new.request, new.num_computed_tokens);
        }
        for cached in &plan.scheduled_cached_reqs {
            computed.insert(cached.request, cached.num_computed_tokens);
        }
        let mut output = ModelRunnerOutput::default();
        for (index, &n) in &plan.num_scheduled_tokens {
            let Some(&(prompt_len, last)) = self.prompts.get(index) else {
                continue;
            };
            if computed[index] + n >= prompt_len {
                output.sampled.insert(*index, SampledOutput::tokens(vec![last]));
            }
        }
        ExecutionResult::Ok(output)
    }
}

#[test]
fn config_file_round_trips_into_an_engine() {
    init_test_env();
    let path = write_config("engine", CONFIG);
    let config = Config::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(config.logging.format, "json");
    assert_eq!(config.scheduler.long_prefill_token_threshold, 32);

    let mut core =
        build_engine_core(&config, &specs(), Box::new(EchoExecutor::default())).unwrap();
    assert_eq!(core.kv_cache_config().num_blocks, 64);
    // One group per layer: the smallest type has a single layer.
    assert_eq!(core.kv_cache_config().groups.len(), 3);

    let prompt: Vec<TokenId> = (0..100).map(TokenId).collect();
    let request = Request::new(
        "echo",
        prompt,
        SamplingParams::with_max_tokens(4),
        None,
        core.block_size(),
    );
    core.add_request(request).unwrap();

    let mut tokens = Vec::new();
    let mut finish = None;
    let mut saw_stats = false;
    for _ in 0..16 {
        for outputs in core.step().unwrap().into_values() {
            saw_stats |= outputs.scheduler_stats.is_some();
            for out in outputs.outputs {
                tokens.extend_from_slice(out.outcome.new_token_ids());
                finish = finish.or(out.outcome.finish_reason());
            }
        }
        if finish.is_some() {
            break;
        }
    }
    assert_eq!(tokens, vec![TokenId(99); 4]);
    assert_eq!(finish, Some(FinishReason::Length));
    assert!(saw_stats);
    assert_eq!(core.scheduler().num_unfinished_requests(), 0);
}

#[test]
fn missing_config_file_is_a_config_error() {
    let err = Config::from_file("/nonexistent/tessera.toml").unwrap_err();
    assert!(matches!(err, TesseraError::Config { .. }));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = Config::from_toml_str("[cache\nblock_size = 16").unwrap_err();
    assert!(matches!(err, TesseraError::Config { .. }));

    let err = Config::from_toml_str("[cache]\nblock_size = \"sixteen\"").unwrap_err();
    assert!(matches!(err, TesseraError::Config { .. }));
}

#[test]
fn undersized_memory_budget_fails_at_startup() {
    let mut config = Config::from_toml_str(CONFIG).unwrap();
    config.cache.num_gpu_blocks_override = None;
    config.cache.available_memory_bytes = 4096;
    let err =
        build_engine_core(&config, &specs(), Box::new(EchoExecutor::default())).unwrap_err();
    assert!(err.is_fatal_at_startup());
}
