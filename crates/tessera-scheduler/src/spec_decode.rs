//! Bookkeeping for speculative decoding

use tessera_types::SpecDecodingStats;

/// Positions computed optimistically for drafts the model rejected.
///
/// A step verifying `num_draft_tokens` drafts computes `num_draft_tokens + 1`
/// positions and yields the accepted drafts plus one bonus token.
pub fn num_rejected_tokens(num_draft_tokens: usize, num_generated_tokens: usize) -> usize {
    (num_draft_tokens + 1).saturating_sub(num_generated_tokens)
}

/// Record one verified draft into the step's stats, creating them on first use
pub fn observe_draft(
    stats: &mut Option<SpecDecodingStats>,
    num_spec_tokens: usize,
    num_draft_tokens: usize,
    num_generated_tokens: usize,
) {
    stats
        .get_or_insert_with(|| SpecDecodingStats::new(num_spec_tokens))
        .observe_draft(num_draft_tokens, num_generated_tokens.saturating_sub(1));
}
