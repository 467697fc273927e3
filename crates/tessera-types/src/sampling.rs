//! Generation limits and stop conditions

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, TesseraError, TokenId};

/// Per-request generation parameters that the core inspects.
///
/// Sampling knobs such as temperature are consumed by the executor and are
/// not modelled here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Number of tokens generated before EOS or stop tokens take effect
    pub min_tokens: usize,
    /// Keep generating past the EOS token
    pub ignore_eos: bool,
    /// Token ids that end generation
    pub stop_token_ids: Vec<TokenId>,
    /// Strings that end generation once they appear in the decoded output
    pub stop: Vec<String>,
    /// Number of logprobs to return per generated token
    pub logprobs: Option<usize>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 16,
            min_tokens: 0,
            ignore_eos: false,
            stop_token_ids: Vec::new(),
            stop: Vec::new(),
            logprobs: None,
        }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    /// Validate generation parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(TesseraError::invalid_parameter(
                "max_tokens must be at least 1",
            ));
        }
        if self.min_tokens > self.max_tokens {
            return Err(TesseraError::invalid_parameter(format!(
                "min_tokens ({}) must not exceed max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        if self.stop.iter().any(|s| s.is_empty()) {
            return Err(TesseraError::invalid_parameter(
                "stop strings must not be empty",
            ));
        }
        Ok(())
    }
}

/// Why a request stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// EOS, a stop token or a stop string was produced
    Stop,
    /// max_tokens or the model's context length was reached
    Length,
    /// Aborted by the client or by an execution failure
    Abort,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::Abort => write!(f, "abort"),
        }
    }
}

/// The stop condition that matched, when it was not EOS or a length limit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    Token(TokenId),
    String(String),
}
