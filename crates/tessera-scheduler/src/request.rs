//! Request state owned by the scheduler

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::grammar::StructuredOutputGrammar;
use tessera_kv::{update_block_hashes, BlockHash};
use tessera_types::{
    ClientIndex, FinishReason, RequestId, RequestIndex, Result, SamplingParams, StopReason,
    TesseraError, TokenId,
};

/// Request lifecycle as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Waiting,
    Running,
    /// Blocks released; waits to be recomputed from scratch
    Preempted,
    FinishedStopped,
    FinishedLengthCapped,
    FinishedAborted,
}

impl RequestStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RequestStatus::FinishedStopped
                | RequestStatus::FinishedLengthCapped
                | RequestStatus::FinishedAborted
        )
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            RequestStatus::FinishedStopped => Some(FinishReason::Stop),
            RequestStatus::FinishedLengthCapped => Some(FinishReason::Length),
            RequestStatus::FinishedAborted => Some(FinishReason::Abort),
            _ => None,
        }
    }
}

/// Span of placeholder tokens filled by one encoder output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInput {
    pub start_position: usize,
    pub num_tokens: usize,
}

impl EncoderInput {
    pub fn new(start_position: usize, num_tokens: usize) -> Self {
        Self {
            start_position,
            num_tokens,
        }
    }

    pub fn end_position(&self) -> usize {
        self.start_position + self.num_tokens
    }
}

/// A generation request and its token bookkeeping
pub struct Request {
    pub request_id: RequestId,
    pub client_index: ClientIndex,
    pub prompt_token_ids: Vec<TokenId>,
    pub output_token_ids: Vec<TokenId>,
    all_token_ids: Vec<TokenId>,
    pub sampling_params: SamplingParams,
    pub eos_token_id: Option<TokenId>,
    pub status: RequestStatus,
    /// Tokens whose KV entries exist, or are being computed this step
    pub num_computed_tokens: usize,
    /// Draft tokens to verify in the next step
    pub spec_token_ids: Vec<TokenId>,
    block_hashes: Vec<BlockHash>,
    block_size: usize,
    pub cache_salt: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub num_preemptions: usize,
    /// Tokens served from the prefix cache on first admission
    pub num_cached_tokens: Option<usize>,
    pub arrival_time: DateTime<Utc>,
    pub encoder_inputs: Vec<EncoderInput>,
    pub grammar: Option<Box<dyn StructuredOutputGrammar>>,
}

impl Request {
    pub fn new(
        request_id: impl Into<RequestId>,
        prompt_token_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
        eos_token_id: Option<TokenId>,
        block_size: usize,
    ) -> Self {
        let mut request = Self {
            request_id: request_id.into(),
            client_index: ClientIndex::default(),
            all_token_ids: prompt_token_ids.clone(),
            prompt_token_ids,
            output_token_ids: Vec::new(),
            sampling_params,
            eos_token_id,
            status: RequestStatus::Waiting,
            num_computed_tokens: 0,
            spec_token_ids: Vec::new(),
            block_hashes: Vec::new(),
            block_size,
            cache_salt: None,
            stop_reason: None,
            num_preemptions: 0,
            num_cached_tokens: None,
            arrival_time: Utc::now(),
            encoder_inputs: Vec::new(),
            grammar: None,
        };
        request.update_block_hashes();
        request
    }

    pub fn with_client(mut self, client_index: ClientIndex) -> Self {
        self.client_index = client_index;
        self
    }

    /// Separate this request's prefix cache entries from other tenants
    pub fn with_cache_salt(mut self, salt: impl Into<String>) -> Self {
        self.cache_salt = Some(salt.into());
        self.block_hashes.clear();
        self.update_block_hashes();
        self
    }

    pub fn with_encoder_inputs(mut self, inputs: Vec<EncoderInput>) -> Self {
        self.encoder_inputs = inputs;
        self
    }

    pub fn with_grammar(mut self, grammar: Box<dyn StructuredOutputGrammar>) -> Self {
        self.grammar = Some(grammar);
        self
    }

    /// Reject requests the engine can never serve
    pub fn validate(&self, max_model_len: usize) -> Result<()> {
        self.sampling_params.validate()?;
        if self.prompt_token_ids.is_empty() {
            return Err(TesseraError::invalid_parameter(format!(
                "request {} has an empty prompt",
                self.request_id
            )));
        }
        if self.prompt_token_ids.len() >= max_model_len {
            return Err(TesseraError::invalid_parameter(format!(
                "prompt of request {} has {} tokens, max_model_len is {}",
                self.request_id,
                self.prompt_token_ids.len(),
                max_model_len
            )));
        }
        if let Some(input) = self
            .encoder_inputs
            .iter()
            .find(|i| i.end_position() > self.prompt_token_ids.len())
        {
            return Err(TesseraError::invalid_parameter(format!(
                "encoder input at {}..{} lies outside the prompt of request {}",
                input.start_position,
                input.end_position(),
                self.request_id
            )));
        }
        Ok(())
    }

    pub fn all_token_ids(&self) -> &[TokenId] {
        &self.all_token_ids
    }

    pub fn block_hashes(&self) -> &[BlockHash] {
        &self.block_hashes
    }

    /// Tokens per hashed block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_tokens(&self) -> usize {
        self.all_token_ids.len()
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn num_output_tokens(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn num_tokens_with_spec(&self) -> usize {
        self.all_token_ids.len() + self.spec_token_ids.len()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.status.finish_reason()
    }

    pub fn has_encoder_inputs(&self) -> bool {
        !self.encoder_inputs.is_empty()
    }

    /// Append sampled tokens and hash any block they complete
    pub fn append_output_token_ids(&mut self, token_ids: &[TokenId]) {
        self.output_token_ids.extend_from_slice(token_ids);
        self.all_token_ids.extend_from_slice(token_ids);
        self.update_block_hashes();
    }

    fn update_block_hashes(&mut self) {
        update_block_hashes(
            &mut self.block_hashes,
            &self.all_token_ids,
            self.block_size,
            self.cache_salt.as_deref(),
        );
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("client_index", &self.client_index)
            .field("status", &self.status)
            .field("num_prompt_tokens", &self.num_prompt_tokens())
            .field("num_output_tokens", &self.num_output_tokens())
            .field("num_computed_tokens", &self.num_computed_tokens)
            .field("spec_token_ids", &self.spec_token_ids)
            .field("num_preemptions", &self.num_preemptions)
            .field("has_grammar", &self.grammar.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Generational slab of live requests with a lookup by external id.
///
/// Indices stay valid until the request is removed; a reused slot bumps its
/// generation so stale indices resolve to nothing.
#[derive(Debug, Default)]
pub struct RequestArena {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    by_id: HashMap<RequestId, RequestIndex>,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: Request) -> Result<RequestIndex> {
        if self.by_id.contains_key(&request.request_id) {
            return Err(TesseraError::already_exists(format!(
                "Request {} already exists",
                request.request_id
            )));
        }
        let request_id = request.request_id.clone();
        let index = match self.free_slots.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.request = Some(request);
                RequestIndex::new(slot, entry.generation)
            }
            None => {
                let slot = u32::try_from(self.slots.len()).map_err(|_| {
                    TesseraError::internal("request arena exceeded u32::MAX slots")
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    request: Some(request),
                });
                RequestIndex::new(slot, 0)
            }
        };
        self.by_id.insert(request_id, index);
        Ok(index)
    }

    pub fn get(&self, index: RequestIndex) -> Option<&Request> {
        self.slots
            .get(index.slot as usize)
            .filter(|s| s.generation == index.generation)
            .and_then(|s| s.request.as_ref())
    }

    pub fn get_mut(&mut self, index: RequestIndex) -> Option<&mut Request> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|s| s.generation == index.generation)
            .and_then(|s| s.request.as_mut())
    }

    /// Like [`RequestArena::get_mut`] but a missing request is an error
    pub fn expect_mut(&mut self, index: RequestIndex) -> Result<&mut Request> {
        self.get_mut(index)
            .ok_or_else(|| TesseraError::not_found(format!("Request not found: {}", index)))
    }

    pub fn remove(&mut self, index: RequestIndex) -> Option<Request> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        if slot.generation != index.generation {
            return None;
        }
        let request = slot.request.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(index.slot);
        self.by_id.remove(&request.request_id);
        Some(request)
    }

    pub fn lookup(&self, request_id: &RequestId) -> Option<RequestIndex> {
        self.by_id.get(request_id).copied()
    }

    pub fn contains(&self, index: RequestIndex) -> bool {
        self.get(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RequestIndex, &Request)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.request
                .as_ref()
                .map(|r| (RequestIndex::new(slot as u32, s.generation), r))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, prompt_len: u32) -> Request {
        Request::new(
            id,
            (0..prompt_len).map(TokenId).collect(),
            SamplingParams::default(),
            Some(TokenId(2)),
            4,
        )
    }

    #[test]
    fn test_block_hashes_follow_tokens() {
        let mut r = request("a", 6);
        assert_eq!(r.block_hashes().len(), 1);
        r.append_output_token_ids(&[TokenId(10), TokenId(11)]);
        assert_eq!(r.block_hashes().len(), 2);
        assert_eq!(r.num_tokens(), 8);
        assert_eq!(r.num_output_tokens(), 2);
    }

    #[test]
    fn test_cache_salt_rehashes() {
        let plain = request("a", 8);
        let salted = request("b", 8).with_cache_salt("s");
        assert_eq!(salted.block_hashes().len(), 2);
        assert_ne!(plain.block_hashes()[0], salted.block_hashes()[0]);
    }

    #[test]
    fn test_validate() {
        assert!(request("a", 8).validate(16).is_ok());
        assert!(request("a", 16).validate(16).is_err());
        assert!(request("a", 0).validate(16).is_err());
        let bad = request("a", 8).with_encoder_inputs(vec![EncoderInput::new(6, 4)]);
        assert!(bad.validate(16).is_err());
    }

    #[test]
    fn test_status_finish_reason() {
        assert!(!RequestStatus::Preempted.is_finished());
        assert_eq!(
            RequestStatus::FinishedLengthCapped.finish_reason(),
            Some(FinishReason::Length)
        );
        assert_eq!(RequestStatus::Running.finish_reason(), None);
    }

    #[test]
    fn test_arena_generations() {
        let mut arena = RequestArena::new();
        let a = arena.insert(request("a", 4)).unwrap();
        assert!(arena.insert(request("a", 4)).is_err());
        assert_eq!(arena.lookup(&RequestId::from("a")), Some(a));

        let removed = arena.remove(a).unwrap();
        assert_eq!(removed.request_id.as_str(), "a");
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());

        // The slot is reused with a new generation.
        let b = arena.insert(request("b", 4)).unwrap();
        assert_eq!(b.slot, a.slot);
        assert_ne!(b.generation, a.generation);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.iter().count(), 1);
    }
}
