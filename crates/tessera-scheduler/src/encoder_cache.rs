//! Budget for cached encoder outputs of multimodal inputs

use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::request::Request;
use tessera_types::{RequestId, SchedulerConfig};

/// Tracks which encoder outputs are held by the executor and how many
/// encoder tokens of space remain
#[derive(Debug)]
pub struct EncoderCacheManager {
    cache_size: usize,
    num_free_slots: usize,
    cached: HashMap<RequestId, HashSet<usize>>,
    freed: Vec<(RequestId, usize)>,
}

impl EncoderCacheManager {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache_size,
            num_free_slots: cache_size,
            cached: HashMap::new(),
            freed: Vec::new(),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn num_free_slots(&self) -> usize {
        self.num_free_slots
    }

    pub fn has_cache(&self, request: &Request, input_id: usize) -> bool {
        self.cached
            .get(&request.request_id)
            .is_some_and(|ids| ids.contains(&input_id))
    }

    pub fn can_allocate(&self, request: &Request, input_id: usize) -> bool {
        request
            .encoder_inputs
            .get(input_id)
            .is_some_and(|input| input.num_tokens <= self.num_free_slots)
    }

    pub fn allocate(&mut self, request: &Request, input_id: usize) {
        let Some(input) = request.encoder_inputs.get(input_id) else {
            return;
        };
        if self
            .cached
            .entry(request.request_id.clone())
            .or_default()
            .insert(input_id)
        {
            self.num_free_slots = self.num_free_slots.saturating_sub(input.num_tokens);
        }
    }

    pub fn cached_input_ids(&self, request: &Request) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .cached
            .get(&request.request_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn free_encoder_input(&mut self, request: &Request, input_id: usize) {
        let Some(ids) = self.cached.get_mut(&request.request_id) else {
            return;
        };
        if !ids.remove(&input_id) {
            return;
        }
        if ids.is_empty() {
            self.cached.remove(&request.request_id);
        }
        if let Some(input) = request.encoder_inputs.get(input_id) {
            self.num_free_slots = (self.num_free_slots + input.num_tokens).min(self.cache_size);
        }
        trace!(
            "Freed encoder input {} of request {}",
            input_id,
            request.request_id
        );
        self.freed.push((request.request_id.clone(), input_id));
    }

    /// Free every encoder output of a request
    pub fn free(&mut self, request: &Request) {
        for input_id in self.cached_input_ids(request) {
            self.free_encoder_input(request, input_id);
        }
    }

    /// Free outputs whose placeholder range is fully computed; the decoder KV
    /// cache holds them from then on
    pub fn free_computed_inputs(&mut self, request: &Request) {
        for input_id in self.cached_input_ids(request) {
            let computed = request
                .encoder_inputs
                .get(input_id)
                .is_some_and(|input| input.end_position() <= request.num_computed_tokens);
            if computed {
                self.free_encoder_input(request, input_id);
            }
        }
    }

    /// Inputs freed since the last call, for the executor to drop
    pub fn take_freed_ids(&mut self) -> Vec<(RequestId, usize)> {
        std::mem::take(&mut self.freed)
    }
}

/// Encoder tokens that may run in one step; also the encoder cache size
pub fn compute_encoder_budget(config: &SchedulerConfig) -> usize {
    config
        .max_num_encoder_input_tokens
        .min(config.encoder_cache_size)
}
