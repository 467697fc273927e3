//! Statistics reported by the cache and the scheduler

use serde::{Deserialize, Serialize};

/// Prefix cache lookups since the last snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefixCacheStats {
    /// The prefix cache was reset during the interval
    pub reset: bool,
    /// Requests that performed a lookup
    pub requests: u64,
    /// Tokens looked up
    pub queries: u64,
    /// Tokens served from cache
    pub hits: u64,
}

impl PrefixCacheStats {
    pub fn record(&mut self, num_tokens: usize, num_hits: usize) {
        self.requests += 1;
        self.queries += num_tokens as u64;
        self.hits += num_hits as u64;
    }

    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.hits as f64 / self.queries as f64
        }
    }
}

/// Draft acceptance counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecDecodingStats {
    pub num_drafts: u64,
    pub num_draft_tokens: u64,
    pub num_accepted_tokens: u64,
    /// Accepted count per draft position
    pub num_accepted_tokens_per_pos: Vec<u64>,
}

impl SpecDecodingStats {
    pub fn new(num_spec_tokens: usize) -> Self {
        Self {
            num_accepted_tokens_per_pos: vec![0; num_spec_tokens],
            ..Default::default()
        }
    }

    pub fn observe_draft(&mut self, num_draft_tokens: usize, num_accepted_tokens: usize) {
        self.num_drafts += 1;
        self.num_draft_tokens += num_draft_tokens as u64;
        self.num_accepted_tokens += num_accepted_tokens as u64;
        if self.num_accepted_tokens_per_pos.len() < num_accepted_tokens {
            self.num_accepted_tokens_per_pos
                .resize(num_accepted_tokens, 0);
        }
        for count in self
            .num_accepted_tokens_per_pos
            .iter_mut()
            .take(num_accepted_tokens)
        {
            *count += 1;
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.num_draft_tokens == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_draft_tokens as f64
        }
    }
}

/// Scheduler snapshot attached to step outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub num_running_reqs: usize,
    pub num_waiting_reqs: usize,
    /// Fraction of usable blocks currently referenced
    pub kv_cache_usage: f64,
    pub num_preemptions: u64,
    pub prefix_cache_stats: PrefixCacheStats,
    pub spec_decoding_stats: Option<SpecDecodingStats>,
}
