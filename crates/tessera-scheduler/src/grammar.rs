//! Structured output constraints

use tessera_types::{RequestId, TokenId};

/// Grammar state machine attached to a request.
///
/// The reconciler advances it one kept token at a time, finishes the request
/// once it terminates, and trims draft tokens to the prefix it accepts.
/// Drafts are only validated, never accepted, so rejected drafts leave the
/// grammar untouched.
pub trait StructuredOutputGrammar: Send {
    /// Advance over `tokens`; false if any token is rejected
    fn accept_tokens(&mut self, request_id: &RequestId, tokens: &[TokenId]) -> bool;

    /// Longest prefix of `tokens` the grammar would accept, without advancing
    fn validate_tokens(&self, tokens: &[TokenId]) -> Vec<TokenId>;

    /// The grammar reached an accepting end state
    fn is_terminated(&self) -> bool;
}
