//! The model executor seam

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::output::{LogprobsLists, SchedulerOutput};
use tessera_types::{RequestIndex, TesseraError, TokenId};

/// Tokens sampled for one request in one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampledOutput {
    /// Empty while the request is still prefilling; with draft tokens,
    /// the accepted drafts plus one bonus token
    pub token_ids: Vec<TokenId>,
    pub logprobs: Option<LogprobsLists>,
}

impl SampledOutput {
    pub fn tokens(token_ids: Vec<TokenId>) -> Self {
        Self {
            token_ids,
            logprobs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRunnerOutput {
    pub sampled: HashMap<RequestIndex, SampledOutput>,
    /// Draft proposals for the next step, when a drafter is configured
    pub draft_token_ids: Option<HashMap<RequestIndex, Vec<TokenId>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ExecutionFailure> for TesseraError {
    fn from(failure: ExecutionFailure) -> Self {
        TesseraError::execution_failure(failure.message)
    }
}

/// Result of running one step on the model
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Ok(ModelRunnerOutput),
    Failed(ExecutionFailure),
}

impl ExecutionResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionResult::Failed(_))
    }
}

/// Runs the model for a step plan. Called synchronously once per step.
pub trait ModelExecutor: Send {
    fn execute_step(&mut self, scheduler_output: &SchedulerOutput) -> ExecutionResult;
}
