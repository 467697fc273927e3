//! # Tessera Scheduler
//!
//! Continuous batching on top of the paged KV cache:
//!
//! - [`Scheduler`] plans each step: chunked prefill, prefix cache reuse,
//!   recompute preemption and encoder input budgeting
//! - [`StepReconciler`] applies executor results, stops finished requests and
//!   contains execution failures to the step that produced them
//! - [`EngineCore`] ties the scheduler to a [`ModelExecutor`];
//!   [`EngineCoreHandle`] runs it on a tokio task

pub mod encoder_cache;
pub mod engine;
pub mod executor;
pub mod grammar;
pub mod output;
pub mod reconciler;
pub mod request;
pub mod scheduler;
pub mod spec_decode;
pub mod stop;

pub use encoder_cache::{compute_encoder_budget, EncoderCacheManager};
pub use engine::{EngineCommand, EngineCore, EngineCoreHandle, EngineLoopStats};
pub use executor::{
    ExecutionFailure, ExecutionResult, ModelExecutor, ModelRunnerOutput, SampledOutput,
};
pub use grammar::StructuredOutputGrammar;
pub use output::{
    CachedRequestData, EngineCoreOutput, EngineCoreOutputs, LogprobsLists, NewRequestData,
    SchedulerOutput, StepOutcome,
};
pub use reconciler::{ReconcileContext, ReconcileOutput, StepReconciler};
pub use request::{EncoderInput, Request, RequestArena, RequestStatus};
pub use scheduler::Scheduler;
pub use stop::{check_stop, TokenDecoder};
