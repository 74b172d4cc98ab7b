use futures::stream::BoxStream;
use thiserror::Error;

use crate::{model::ModelMetadata, params::Sampling};

/// One element of an engine's output sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub text: String,
    /// Set on the last element when the engine stops on its own
    /// (end-of-sequence or budget reached).
    pub is_final: bool,
}

impl GeneratedToken {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prefix: String,
    pub sampling: Sampling,
    /// Maximum number of tokens the returned stream may yield.
    pub budget: usize,
}

/// Lazy, single-use token sequence. Dropping it cancels generation.
pub type TokenStream = BoxStream<'static, Result<GeneratedToken, EngineError>>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("model artifact missing: {0}")]
    Artifact(String),
}

/// The token generator behind a model name.
///
/// Implementations must bound the stream by `request.budget` and must not
/// restart it: once consumed, further text needs a new `generate` call.
pub trait GenerationEngine: Send + Sync {
    fn metadata(&self) -> ModelMetadata;

    /// Number of tokens `text` occupies in this model's vocabulary.
    fn count_tokens(&self, text: &str) -> Result<usize, EngineError>;

    fn generate(&self, request: EngineRequest) -> TokenStream;
}
