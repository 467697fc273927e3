//! Step planning and reconciliation against a mock executor

mod common;

use common::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use tessera_scheduler::{
    EncoderInput, ExecutionFailure, ExecutionResult, ModelExecutor, ModelRunnerOutput,
    RequestStatus, SchedulerOutput, StepOutcome, StructuredOutputGrammar,
};
use tessera_types::{
    FinishReason, RequestId, SpeculativeConfig, SpeculativeMethod, StopReason, TesseraError,
    TokenId,
};

#[test]
fn execution_failure_aborts_running_batch_and_frees_blocks() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
        scheduler
            .add_request(request(id, seq(i as u32 * 100, 20), 8))
            .unwrap();
    }

    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.scheduled_new_reqs.len(), 3);
    assert!(scheduler.kv_cache_manager().num_free_blocks() < 16);

    let outputs = scheduler
        .update_from_output(
            &plan,
            ExecutionResult::Failed(ExecutionFailure::new("device lost")),
        )
        .unwrap();
    let outcomes = client_outputs(&outputs);
    assert_eq!(outcomes.len(), 3);
    for out in &outcomes {
        assert!(matches!(
            &out.outcome,
            StepOutcome::Aborted {
                cause: TesseraError::ExecutionFailure { .. }
            }
        ));
    }
    assert_eq!(scheduler.num_running(), 0);
    assert_eq!(scheduler.kv_cache_manager().num_free_blocks(), 16);

    // The same pool serves the next request.
    let (mut executor, _) = MockExecutor::new();
    scheduler.add_request(request("d", seq(500, 20), 8)).unwrap();
    let (plan, outcomes) = run_step(&mut scheduler, &mut executor);
    assert_eq!(plan.finished_req_ids.len(), 3);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].request_id, RequestId::from("d"));
    assert!(matches!(outcomes[0].outcome, StepOutcome::Continue { .. }));
}

#[test]
fn failed_step_leaves_no_prefix_hit_on_unwritten_blocks() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    scheduler.add_request(request("a", seq(0, 48), 8)).unwrap();
    let plan = scheduler.schedule().unwrap();
    scheduler
        .update_from_output(
            &plan,
            ExecutionResult::Failed(ExecutionFailure::new("device lost")),
        )
        .unwrap();

    let mut prompt = seq(0, 48);
    prompt.push(TokenId(999));
    scheduler.add_request(request("b", prompt, 8)).unwrap();
    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.scheduled_new_reqs.len(), 1);
    assert_eq!(plan.scheduled_new_reqs[0].num_computed_tokens, 0);
    assert_eq!(plan.num_scheduled_tokens(plan.scheduled_new_reqs[0].request), 49);
}

#[test]
fn failed_step_keeps_prefix_written_by_earlier_steps() {
    let mut config = engine_config(16);
    config.scheduler.long_prefill_token_threshold = 32;
    let mut scheduler = scheduler(&config, 16);
    let (mut executor, _) = MockExecutor::new();
    scheduler.add_request(request("a", seq(0, 48), 8)).unwrap();

    let (plan, _) = run_step(&mut scheduler, &mut executor);
    assert_eq!(plan.total_num_scheduled_tokens, 32);
    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.total_num_scheduled_tokens, 16);
    scheduler
        .update_from_output(
            &plan,
            ExecutionResult::Failed(ExecutionFailure::new("device lost")),
        )
        .unwrap();
    assert_eq!(scheduler.kv_cache_manager().num_free_blocks(), 16);

    let mut prompt = seq(0, 48);
    prompt.push(TokenId(999));
    scheduler.add_request(request("b", prompt, 8)).unwrap();
    let plan = scheduler.schedule().unwrap();
    // Two blocks came from the successful chunk; the third was never written.
    assert_eq!(plan.scheduled_new_reqs[0].num_computed_tokens, 32);
}

#[test]
fn rejected_drafts_roll_back_computed_tokens() {
    let mut config = engine_config(32);
    config.scheduler.log_stats = true;
    config.speculative = Some(SpeculativeConfig {
        method: SpeculativeMethod::Ngram,
        num_speculative_tokens: 4,
    });
    let mut scheduler = scheduler(&config, 32);
    let index = scheduler.add_request(request("r", seq(0, 8), 64)).unwrap();

    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.num_scheduled_tokens(index), 8);
    let mut output = output_for(index, &[100]);
    output.draft_token_ids = Some(HashMap::from([(
        index,
        vec![TokenId(101), TokenId(102), TokenId(103), TokenId(104)],
    )]));
    scheduler
        .update_from_output(&plan, ExecutionResult::Ok(output))
        .unwrap();

    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.num_scheduled_tokens(index), 5);
    assert_eq!(plan.scheduled_spec_decode_tokens[&index].len(), 4);

    // One draft accepted plus the bonus token: three positions rejected.
    let outputs = scheduler
        .update_from_output(&plan, ExecutionResult::Ok(output_for(index, &[101, 200])))
        .unwrap();
    let request = scheduler.request(&RequestId::from("r")).unwrap();
    assert_eq!(request.num_tokens(), 11);
    assert_eq!(request.num_computed_tokens, 10);

    let stats = outputs
        .values()
        .find_map(|o| o.scheduler_stats.clone())
        .unwrap();
    let spec = stats.spec_decoding_stats.unwrap();
    assert_eq!(spec.num_drafts, 1);
    assert_eq!(spec.num_draft_tokens, 4);
    assert_eq!(spec.num_accepted_tokens, 1);
}

#[test]
fn step_with_nothing_scheduled_changes_nothing() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let (mut executor, _) = MockExecutor::new();
    let index = scheduler.add_request(request("r", seq(0, 20), 8)).unwrap();
    run_step(&mut scheduler, &mut executor);

    let before = scheduler.request(&RequestId::from("r")).unwrap();
    let (tokens, computed) = (before.num_tokens(), before.num_computed_tokens);
    let free = scheduler.kv_cache_manager().num_free_blocks();

    let outputs = scheduler
        .update_from_output(
            &SchedulerOutput::default(),
            ExecutionResult::Ok(output_for(index, &[7])),
        )
        .unwrap();
    assert!(outputs.is_empty());

    let after = scheduler.request(&RequestId::from("r")).unwrap();
    assert_eq!(after.num_tokens(), tokens);
    assert_eq!(after.num_computed_tokens, computed);
    assert_eq!(scheduler.kv_cache_manager().num_free_blocks(), free);
    assert_eq!(scheduler.num_running(), 1);
}

#[test]
fn stop_token_trims_the_delta() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let mut req = request("r", seq(0, 20), 32);
    req.sampling_params.stop_token_ids = vec![TokenId(7)];
    let index = scheduler.add_request(req).unwrap();

    let plan = scheduler.schedule().unwrap();
    let outputs = scheduler
        .update_from_output(&plan, ExecutionResult::Ok(output_for(index, &[5, 7, 9])))
        .unwrap();
    let outcomes = client_outputs(&outputs);
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0].outcome {
        StepOutcome::Finished {
            new_token_ids,
            reason,
            stop_reason,
            ..
        } => {
            assert_eq!(new_token_ids, &vec![TokenId(5), TokenId(7)]);
            assert_eq!(*reason, FinishReason::Stop);
            assert_eq!(stop_reason, &Some(StopReason::Token(TokenId(7))));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(scheduler.num_running(), 0);
    assert_eq!(scheduler.kv_cache_manager().num_free_blocks(), 16);
}

struct EvenOnly {
    accepted: Arc<Mutex<Vec<TokenId>>>,
}

impl StructuredOutputGrammar for EvenOnly {
    fn accept_tokens(&mut self, _request_id: &RequestId, tokens: &[TokenId]) -> bool {
        self.accepted.lock().extend_from_slice(tokens);
        tokens.iter().all(|t| t.0 % 2 == 0)
    }

    fn validate_tokens(&self, tokens: &[TokenId]) -> Vec<TokenId> {
        tokens.iter().copied().take_while(|t| t.0 % 2 == 0).collect()
    }

    fn is_terminated(&self) -> bool {
        false
    }
}

/// Accepts anything and terminates after a closing token
struct EndsAt(TokenId, bool);

impl StructuredOutputGrammar for EndsAt {
    fn accept_tokens(&mut self, _request_id: &RequestId, tokens: &[TokenId]) -> bool {
        self.1 |= tokens.contains(&self.0);
        true
    }

    fn validate_tokens(&self, tokens: &[TokenId]) -> Vec<TokenId> {
        tokens.to_vec()
    }

    fn is_terminated(&self) -> bool {
        self.1
    }
}

#[test]
fn terminated_grammar_finishes_request() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let req = request("json", seq(0, 20), 32).with_grammar(Box::new(EndsAt(TokenId(125), false)));
    let index = scheduler.add_request(req).unwrap();

    let plan = scheduler.schedule().unwrap();
    let outputs = scheduler
        .update_from_output(&plan, ExecutionResult::Ok(output_for(index, &[123])))
        .unwrap();
    assert!(matches!(
        client_outputs(&outputs)[0].outcome,
        StepOutcome::Continue { .. }
    ));

    // Tokens after the closing one are dropped.
    let plan = scheduler.schedule().unwrap();
    let outputs = scheduler
        .update_from_output(
            &plan,
            ExecutionResult::Ok(output_for(index, &[124, 125, 126])),
        )
        .unwrap();
    let outcomes = client_outputs(&outputs);
    assert_eq!(outcomes[0].outcome.new_token_ids(), &[TokenId(124), TokenId(125)]);
    assert_eq!(outcomes[0].outcome.finish_reason(), Some(FinishReason::Stop));
    assert_eq!(scheduler.num_unfinished_requests(), 0);
}

#[test]
fn grammar_sees_kept_tokens_and_filters_drafts() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let req = request("r", seq(0, 20), 32).with_grammar(Box::new(EvenOnly {
        accepted: Arc::clone(&accepted),
    }));
    let index = scheduler.add_request(req).unwrap();

    let plan = scheduler.schedule().unwrap();
    let mut output = output_for(index, &[2]);
    output.draft_token_ids = Some(HashMap::from([(
        index,
        vec![TokenId(4), TokenId(6), TokenId(7), TokenId(8)],
    )]));
    scheduler
        .update_from_output(&plan, ExecutionResult::Ok(output))
        .unwrap();

    assert_eq!(*accepted.lock(), vec![TokenId(2)]);
    let request = scheduler.request(&RequestId::from("r")).unwrap();
    assert_eq!(request.spec_token_ids, vec![TokenId(4), TokenId(6)]);
}

#[test]
fn encoder_outputs_are_released_once_computed() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let (mut executor, _) = MockExecutor::new();
    let budget = scheduler.encoder_cache().cache_size();
    let req = request("mm", seq(0, 32), 8).with_encoder_inputs(vec![EncoderInput::new(4, 10)]);
    let index = scheduler.add_request(req).unwrap();

    let (plan, _) = run_step(&mut scheduler, &mut executor);
    assert_eq!(plan.scheduled_encoder_inputs[&index], vec![0]);
    assert_eq!(scheduler.encoder_cache().num_free_slots(), budget);

    let (plan, _) = run_step(&mut scheduler, &mut executor);
    assert_eq!(
        plan.free_encoder_input_ids,
        vec![(RequestId::from("mm"), 0)]
    );
}

#[test]
fn exhausted_pool_preempts_the_newest_running_request() {
    let mut config = engine_config(4);
    config.scheduler.log_stats = true;
    let mut scheduler = scheduler(&config, 4);
    let (mut executor, _) = MockExecutor::new();
    let a = scheduler.add_request(request("a", seq(0, 32), 16)).unwrap();
    let b = scheduler.add_request(request("b", seq(100, 32), 16)).unwrap();

    let (plan, outcomes) = run_step(&mut scheduler, &mut executor);
    assert_eq!(plan.scheduled_new_reqs.len(), 2);
    assert_eq!(outcomes.len(), 2);
    assert_eq!(scheduler.kv_cache_manager().num_free_blocks(), 0);

    // Both now need a third block; only one can have it.
    let (plan, _) = run_step(&mut scheduler, &mut executor);
    assert_eq!(plan.num_scheduled_tokens(a), 1);
    assert_eq!(plan.num_scheduled_tokens(b), 0);
    assert_eq!(scheduler.num_running(), 1);
    assert_eq!(scheduler.num_waiting(), 1);
    let preempted = scheduler.request(&RequestId::from("b")).unwrap();
    assert_eq!(preempted.status, RequestStatus::Preempted);
    assert_eq!(preempted.num_computed_tokens, 0);
    assert_eq!(preempted.num_preemptions, 1);

    // Once the pool frees up the request resumes with its whole sequence.
    scheduler
        .finish_requests([RequestId::from("a")], RequestStatus::FinishedAborted)
        .unwrap();
    let (plan, _) = run_step(&mut scheduler, &mut executor);
    let resumed = plan
        .scheduled_cached_reqs
        .iter()
        .find(|r| r.request == b)
        .unwrap();
    assert!(resumed.resumed_from_preemption);
    assert_eq!(resumed.new_token_ids.len(), 33);
    assert_eq!(
        resumed.num_computed_tokens + plan.num_scheduled_tokens(b),
        33
    );
}

#[test]
fn client_abort_releases_blocks_and_is_reported_to_the_executor() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let (mut executor, _) = MockExecutor::new();
    scheduler.add_request(request("r", seq(0, 40), 8)).unwrap();
    run_step(&mut scheduler, &mut executor);
    assert!(scheduler.kv_cache_manager().num_free_blocks() < 16);

    let finished = scheduler
        .finish_requests(
            [RequestId::from("r"), RequestId::from("unknown")],
            RequestStatus::FinishedAborted,
        )
        .unwrap();
    assert_eq!(finished, 1);
    assert_eq!(scheduler.kv_cache_manager().num_free_blocks(), 16);
    assert!(scheduler.request(&RequestId::from("r")).is_none());

    let plan = scheduler.schedule().unwrap();
    assert!(plan.is_empty());
    assert!(plan.finished_req_ids.contains(&RequestId::from("r")));
    assert!(scheduler.schedule().unwrap().finished_req_ids.is_empty());
}

#[test]
fn finish_requests_rejects_unfinished_status() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    scheduler.add_request(request("r", seq(0, 8), 8)).unwrap();
    assert!(scheduler
        .finish_requests([RequestId::from("r")], RequestStatus::Running)
        .is_err());
}

#[test]
fn long_prefill_is_chunked() {
    let mut config = engine_config(16);
    config.scheduler.long_prefill_token_threshold = 16;
    let mut scheduler = scheduler(&config, 16);
    let (mut executor, _) = MockExecutor::new();
    let index = scheduler.add_request(request("r", seq(0, 40), 8)).unwrap();

    let mut chunks = Vec::new();
    let mut emitted = Vec::new();
    for _ in 0..3 {
        let (plan, outcomes) = run_step(&mut scheduler, &mut executor);
        chunks.push(plan.num_scheduled_tokens(index));
        emitted.push(outcomes.len());
    }
    assert_eq!(chunks, vec![16, 16, 8]);
    // Partial prefills sample nothing.
    assert_eq!(emitted, vec![0, 0, 1]);
}

#[test]
fn token_budget_is_shared_across_requests() {
    let mut config = engine_config(32);
    config.scheduler.max_num_batched_tokens = 48;
    let mut scheduler = scheduler(&config, 32);
    let a = scheduler.add_request(request("a", seq(0, 40), 8)).unwrap();
    let b = scheduler.add_request(request("b", seq(100, 40), 8)).unwrap();

    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.total_num_scheduled_tokens, 48);
    assert_eq!(plan.num_scheduled_tokens(a), 40);
    assert_eq!(plan.num_scheduled_tokens(b), 8);
}

#[test]
fn shared_prompt_is_served_from_the_prefix_cache() {
    let config = engine_config(32);
    let mut scheduler = scheduler(&config, 32);
    let (mut executor, _) = MockExecutor::new();
    scheduler.add_request(request("first", seq(0, 48), 1)).unwrap();
    let (_, outcomes) = run_step(&mut scheduler, &mut executor);
    assert_eq!(outcomes[0].outcome.finish_reason(), Some(FinishReason::Length));

    let mut prompt = seq(0, 48);
    prompt.push(TokenId(999));
    scheduler.add_request(request("second", prompt, 1)).unwrap();
    let (plan, outcomes) = run_step(&mut scheduler, &mut executor);
    assert_eq!(plan.scheduled_new_reqs[0].num_computed_tokens, 48);
    assert_eq!(plan.total_num_scheduled_tokens, 1);
    match &outcomes[0].outcome {
        StepOutcome::Finished {
            num_cached_tokens, ..
        } => assert_eq!(*num_cached_tokens, 48),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn requests_with_the_wrong_block_size_are_rejected() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let req = tessera_scheduler::Request::new(
        "r",
        seq(0, 8),
        Default::default(),
        None,
        BS * 2,
    );
    assert!(scheduler.add_request(req).is_err());
    assert!(scheduler
        .add_request(request("long", seq(0, MAX_MODEL_LEN), 8))
        .is_err());
}

struct Unused;

impl ModelExecutor for Unused {
    fn execute_step(&mut self, _plan: &SchedulerOutput) -> ExecutionResult {
        ExecutionResult::Ok(ModelRunnerOutput::default())
    }
}

#[test]
fn duplicate_request_ids_are_rejected() {
    let config = engine_config(16);
    let mut scheduler = scheduler(&config, 16);
    let mut executor = Unused;
    scheduler.add_request(request("r", seq(0, 8), 8)).unwrap();
    assert!(scheduler.add_request(request("r", seq(0, 8), 8)).is_err());

    let plan = scheduler.schedule().unwrap();
    let result = executor.execute_step(&plan);
    let outputs = scheduler.update_from_output(&plan, result).unwrap();
    assert!(client_outputs(&outputs).is_empty());
    assert_eq!(scheduler.num_running(), 1);
}

#[test]
fn idle_step_keeps_stats_for_the_next_real_step() {
    let mut config = engine_config(16);
    config.scheduler.log_stats = true;
    let mut scheduler = scheduler(&config, 16);
    let (mut executor, _) = MockExecutor::new();
    assert!(scheduler.reset_prefix_cache());

    let plan = scheduler.schedule().unwrap();
    assert_eq!(plan.total_num_scheduled_tokens, 0);
    let outputs = scheduler
        .update_from_output(&plan, ExecutionResult::Ok(ModelRunnerOutput::default()))
        .unwrap();
    assert!(outputs.is_empty());

    scheduler.add_request(request("r", seq(0, 20), 4)).unwrap();
    let plan = scheduler.schedule().unwrap();
    let result = executor.execute_step(&plan);
    let outputs = scheduler.update_from_output(&plan, result).unwrap();
    let stats = outputs
        .values()
        .find_map(|o| o.scheduler_stats.clone())
        .unwrap();
    assert!(stats.prefix_cache_stats.reset);
    assert_eq!(stats.num_running_reqs, 1);
}
