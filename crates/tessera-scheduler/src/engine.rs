//! Engine core and its background loop
//!
//! [`EngineCore`] owns the scheduler and the executor and runs one step at a
//! time through `&mut self`. [`EngineCoreHandle`] drives a core on a tokio
//! task: commands come in over a channel, per-client outputs go out over
//! per-client channels.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionFailure, ExecutionResult, ModelExecutor, ModelRunnerOutput};
use crate::output::{EngineCoreOutput, EngineCoreOutputs, SchedulerOutput, StepOutcome};
use crate::request::{Request, RequestStatus};
use crate::scheduler::Scheduler;
use crate::stop::TokenDecoder;
use tessera_kv::{CachePlanner, CacheSpecSet, KvCacheConfig, PlannerConfig};
use tessera_types::{
    ClientIndex, EngineCoreConfig, RequestId, RequestIndex, Result, SchedulerStats, TesseraError,
};

pub struct EngineCore {
    scheduler: Scheduler,
    executor: Box<dyn ModelExecutor>,
    kv_cache_config: KvCacheConfig,
    step_count: u64,
    num_failed_steps: u64,
}

impl EngineCore {
    /// Plan the KV cache for `specs` and build the scheduler on top of it.
    /// Geometry and capacity errors surface here.
    pub fn new(
        config: EngineCoreConfig,
        specs: &CacheSpecSet,
        executor: Box<dyn ModelExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let planner_config = PlannerConfig::from_configs(&config.cache, &config.scheduler);
        let kv_cache_config = CachePlanner::plan(specs, &planner_config)?;
        Self::with_kv_cache_config(config, kv_cache_config, executor)
    }

    /// Build on an already planned cache layout
    pub fn with_kv_cache_config(
        config: EngineCoreConfig,
        kv_cache_config: KvCacheConfig,
        executor: Box<dyn ModelExecutor>,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(&config, &kv_cache_config)?;
        info!(
            "Engine core ready: {} blocks of {} tokens, {} group(s)",
            kv_cache_config.num_blocks,
            kv_cache_config.block_size(),
            kv_cache_config.groups.len()
        );
        Ok(Self {
            scheduler,
            executor,
            kv_cache_config,
            step_count: 0,
            num_failed_steps: 0,
        })
    }

    pub fn with_token_decoder(mut self, decoder: Arc<dyn TokenDecoder>) -> Self {
        self.scheduler = self.scheduler.with_token_decoder(decoder);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn kv_cache_config(&self) -> &KvCacheConfig {
        &self.kv_cache_config
    }

    pub fn block_size(&self) -> usize {
        self.scheduler.block_size()
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Steps whose execution failed and aborted the running batch
    pub fn num_failed_steps(&self) -> u64 {
        self.num_failed_steps
    }

    pub fn has_requests(&self) -> bool {
        self.scheduler.has_requests()
    }

    pub fn add_request(&mut self, request: Request) -> Result<RequestIndex> {
        self.scheduler.add_request(request)
    }

    /// Client-initiated aborts; blocks are released before this returns
    pub fn abort_requests<I>(&mut self, request_ids: I) -> Result<usize>
    where
        I: IntoIterator<Item = RequestId>,
    {
        self.scheduler
            .finish_requests(request_ids, RequestStatus::FinishedAborted)
    }

    /// Abort every unfinished request with `cause`, reporting each to its client
    pub fn abort_all(&mut self, cause: &TesseraError) -> Result<HashMap<ClientIndex, EngineCoreOutputs>> {
        let unfinished = self.scheduler.unfinished_requests();
        let mut outputs: HashMap<ClientIndex, EngineCoreOutputs> = HashMap::new();
        for (request_id, client) in unfinished {
            self.scheduler
                .finish_requests([request_id.clone()], RequestStatus::FinishedAborted)?;
            outputs
                .entry(client)
                .or_default()
                .outputs
                .push(EngineCoreOutput {
                    request_id,
                    outcome: StepOutcome::Aborted {
                        cause: cause.clone(),
                    },
                });
        }
        Ok(outputs)
    }

    pub fn reset_prefix_cache(&mut self) -> bool {
        self.scheduler.reset_prefix_cache()
    }

    /// Schedule, execute and reconcile one step.
    ///
    /// The executor is skipped when there is nothing to run and nothing to
    /// report to it. A panicking executor fails the step like any other
    /// execution failure.
    pub fn step(&mut self) -> Result<HashMap<ClientIndex, EngineCoreOutputs>> {
        if !self.scheduler.has_requests() {
            return Ok(HashMap::new());
        }
        let plan = self.scheduler.schedule()?;
        let result = if plan.is_empty()
            && plan.finished_req_ids.is_empty()
            && plan.free_encoder_input_ids.is_empty()
        {
            ExecutionResult::Ok(ModelRunnerOutput::default())
        } else {
            self.execute(&plan)
        };
        self.step_count += 1;
        if result.is_failed() {
            self.num_failed_steps += 1;
        }
        self.scheduler.update_from_output(&plan, result)
    }

    fn execute(&mut self, plan: &SchedulerOutput) -> ExecutionResult {
        let executor = &mut self.executor;
        match panic::catch_unwind(AssertUnwindSafe(|| executor.execute_step(plan))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Model executor panicked: {}", message);
                ExecutionResult::Failed(ExecutionFailure::new(format!(
                    "executor panicked: {}",
                    message
                )))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("scheduler", &self.scheduler)
            .field("step_count", &self.step_count)
            .finish()
    }
}

/// Commands accepted by the background loop
#[derive(Debug)]
pub enum EngineCommand {
    AddRequest(Request),
    Abort(Vec<RequestId>),
    ResetPrefixCache,
    Shutdown,
}

/// Loop counters shared with the handle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineLoopStats {
    pub num_steps: u64,
    pub num_failed_steps: u64,
    pub num_running_reqs: usize,
    pub num_waiting_reqs: usize,
    pub kv_cache_usage: f64,
    pub last_scheduler_stats: Option<SchedulerStats>,
    pub last_step_at: Option<DateTime<Utc>>,
}

type Subscribers = Arc<RwLock<HashMap<ClientIndex, mpsc::UnboundedSender<EngineCoreOutputs>>>>;

/// Drives an [`EngineCore`] on a tokio task
pub struct EngineCoreHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    subscribers: Subscribers,
    stats: Arc<RwLock<EngineLoopStats>>,
    task: JoinHandle<EngineCore>,
}

impl EngineCoreHandle {
    /// Start the loop. Must be called inside a tokio runtime.
    pub fn spawn(core: EngineCore) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(RwLock::new(EngineLoopStats::default()));
        let task = tokio::spawn(run_loop(
            core,
            receiver,
            Arc::clone(&subscribers),
            Arc::clone(&stats),
        ));
        Self {
            commands,
            subscribers,
            stats,
            task,
        }
    }

    /// Receive every output batch addressed to `client`. A second
    /// subscription for the same client replaces the first.
    pub fn subscribe(&self, client: ClientIndex) -> mpsc::UnboundedReceiver<EngineCoreOutputs> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().insert(client, tx);
        rx
    }

    pub fn add_request(&self, request: Request) -> Result<()> {
        self.send(EngineCommand::AddRequest(request))
    }

    pub fn abort(&self, request_ids: Vec<RequestId>) -> Result<()> {
        self.send(EngineCommand::Abort(request_ids))
    }

    pub fn reset_prefix_cache(&self) -> Result<()> {
        self.send(EngineCommand::ResetPrefixCache)
    }

    pub fn stats(&self) -> EngineLoopStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and take the core back
    pub async fn shutdown(self) -> Result<EngineCore> {
        // The loop may already be gone; the join below reports that.
        let _ = self.commands.send(EngineCommand::Shutdown);
        self.task
            .await
            .map_err(|e| TesseraError::internal(format!("Engine loop task failed: {}", e)))
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TesseraError::invalid_state("Engine loop is not running"))
    }
}

impl std::fmt::Debug for EngineCoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCoreHandle")
            .field("subscribers", &self.subscribers.read().len())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

async fn run_loop(
    mut core: EngineCore,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    subscribers: Subscribers,
    stats: Arc<RwLock<EngineLoopStats>>,
) -> EngineCore {
    info!("Starting engine core loop");

    'outer: loop {
        // Park while idle.
        if !core.has_requests() {
            match commands.recv().await {
                Some(command) => {
                    if !apply_command(&mut core, command, &subscribers) {
                        break;
                    }
                }
                None => break,
            }
        }
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !apply_command(&mut core, command, &subscribers) {
                        break 'outer;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'outer,
            }
        }

        let outputs = match core.step() {
            Ok(outputs) => outputs,
            Err(e) => {
                // Only invariant violations get here; drop all work so the
                // loop cannot spin on the same state.
                error!("Engine step failed, aborting all requests: {}", e);
                match core.abort_all(&e) {
                    Ok(outputs) => outputs,
                    Err(e) => {
                        error!("Could not abort requests after a failed step: {}", e);
                        break;
                    }
                }
            }
        };
        {
            let mut stats = stats.write();
            stats.num_steps = core.step_count();
            stats.num_failed_steps = core.num_failed_steps();
            stats.num_running_reqs = core.scheduler().num_running();
            stats.num_waiting_reqs = core.scheduler().num_waiting();
            stats.kv_cache_usage = core.scheduler().kv_cache_manager().usage();
            stats.last_step_at = Some(Utc::now());
            if let Some(s) = outputs.values().find_map(|o| o.scheduler_stats.clone()) {
                stats.last_scheduler_stats = Some(s);
            }
        }
        dispatch(&subscribers, outputs);

        tokio::task::yield_now().await;
    }

    info!("Engine core loop stopped after {} steps", core.step_count());
    core
}

/// Returns false on shutdown
fn apply_command(core: &mut EngineCore, command: EngineCommand, subscribers: &Subscribers) -> bool {
    match command {
        EngineCommand::AddRequest(request) => {
            let request_id = request.request_id.clone();
            let client = request.client_index;
            if let Err(cause) = core.add_request(request) {
                warn!("Rejected request {}: {}", request_id, cause);
                let mut outputs = HashMap::new();
                outputs.insert(
                    client,
                    EngineCoreOutputs::new(vec![EngineCoreOutput {
                        request_id,
                        outcome: StepOutcome::Aborted { cause },
                    }]),
                );
                dispatch(subscribers, outputs);
            }
        }
        EngineCommand::Abort(request_ids) => match core.abort_requests(request_ids) {
            Ok(n) => debug!("Aborted {} requests on client request", n),
            Err(e) => error!("Abort failed: {}", e),
        },
        EngineCommand::ResetPrefixCache => {
            if !core.reset_prefix_cache() {
                warn!("Prefix cache reset refused while blocks are in use");
            }
        }
        EngineCommand::Shutdown => {
            info!("Shutting down engine core loop");
            return false;
        }
    }
    true
}

fn dispatch(subscribers: &Subscribers, outputs: HashMap<ClientIndex, EngineCoreOutputs>) {
    let subscribers = subscribers.read();
    for (client, batch) in outputs {
        match subscribers.get(&client) {
            Some(tx) => {
                if tx.send(batch).is_err() {
                    debug!("Client {} stopped listening", client);
                }
            }
            None => debug!("No subscriber for client {}", client),
        }
    }
}
