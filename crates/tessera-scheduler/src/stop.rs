//! Per-token stop checks

use crate::request::{Request, RequestStatus};
use tessera_types::{StopReason, TokenId};

/// Turns token ids into text for stop-string matching
pub trait TokenDecoder: Send + Sync {
    fn decode(&self, token_ids: &[TokenId]) -> String;
}

/// Check whether the last appended token ends the request, updating its
/// status and stop reason when it does.
///
/// Length limits apply first; EOS, stop tokens and stop strings only after
/// `min_tokens` outputs.
pub fn check_stop(
    request: &mut Request,
    max_model_len: usize,
    decoder: Option<&dyn TokenDecoder>,
) -> bool {
    if request.num_tokens() >= max_model_len
        || request.num_output_tokens() >= request.sampling_params.max_tokens
    {
        request.status = RequestStatus::FinishedLengthCapped;
        return true;
    }

    if request.num_output_tokens() < request.sampling_params.min_tokens {
        return false;
    }
    let Some(&last_token) = request.output_token_ids.last() else {
        return false;
    };

    if !request.sampling_params.ignore_eos && request.eos_token_id == Some(last_token) {
        request.status = RequestStatus::FinishedStopped;
        return true;
    }
    if request.sampling_params.stop_token_ids.contains(&last_token) {
        request.status = RequestStatus::FinishedStopped;
        request.stop_reason = Some(StopReason::Token(last_token));
        return true;
    }
    if let Some(decoder) = decoder {
        if let Some(stop) = find_stop_string(request, decoder) {
            request.status = RequestStatus::FinishedStopped;
            request.stop_reason = Some(StopReason::String(stop));
            return true;
        }
    }
    false
}

/// Extra tokens decoded before the stop-string window, for tokens that only
/// decode cleanly together with their neighbours
const STOP_WINDOW_MARGIN: usize = 4;

/// A stop string that ends inside the text of the last output token.
///
/// Every token decodes to at least one byte, so a match ending in the last
/// token starts within the last `max(stop.len())` tokens; only that tail is
/// decoded.
fn find_stop_string(request: &Request, decoder: &dyn TokenDecoder) -> Option<String> {
    let stops = &request.sampling_params.stop;
    let longest = stops.iter().map(String::len).max()?;
    let outputs = &request.output_token_ids;
    let window = longest + STOP_WINDOW_MARGIN;
    let tail = &outputs[outputs.len().saturating_sub(window)..];
    let text = decoder.decode(tail);
    let prev_len = decoder.decode(&tail[..tail.len() - 1]).len();

    stops
        .iter()
        .find(|stop| {
            // Earliest start for a match that ends past the previous text.
            let from = floor_char_boundary(&text, (prev_len + 1).saturating_sub(stop.len()));
            text[from..].contains(stop.as_str())
        })
        .cloned()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
