//! Identity provider boundary
//!
//! The orchestrator needs a bearer token to authenticate the signaling
//! session. Credential issuance itself lives outside this crate; callers
//! inject a provider. Failure to produce a token is fatal for the current
//! session attempt.

/// One-shot callback carrying the token fetch outcome
pub type TokenSink = Box<dyn FnOnce(Result<String, String>) + Send + 'static>;

pub trait TokenProvider: Send + Sync {
    /// Fetch a bearer token. Never blocks: the outcome is delivered on the
    /// sink when ready.
    fn fetch_token(&self, sink: TokenSink);
}

/// Provider backed by a preissued token (CLI / config supplied)
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn fetch_token(&self, sink: TokenSink) {
        sink(Ok(self.token.clone()));
    }
}
