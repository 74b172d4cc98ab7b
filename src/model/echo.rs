use crate::model::{
    EngineError, EngineRequest, GeneratedToken, GenerationEngine, ModelMetadata, TokenStream,
};

/// Deterministic built-in engine: whitespace tokenisation, and generation
/// that replays the words of the prefix in order, wrapping around.
///
/// Sampling parameters are accepted but have no effect.
#[derive(Debug, Clone)]
pub struct EchoEngine {
    name: String,
}

impl EchoEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl GenerationEngine for EchoEngine {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.name.clone(),
            backend: "echo".to_string(),
            size_bytes: None,
        }
    }

    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(text.split_whitespace().count())
    }

    fn generate(&self, request: EngineRequest) -> TokenStream {
        let words: Vec<String> = request
            .prefix
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let budget = request.budget;

        Box::pin(async_stream::stream! {
            if words.is_empty() {
                return;
            }
            for (step, word) in words.iter().cycle().take(budget).enumerate() {
                // Let cancellation and other sessions in between tokens.
                tokio::task::yield_now().await;
                yield Ok::<_, EngineError>(GeneratedToken::new(
                    format!(" {word}"),
                    step + 1 == budget,
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::params::Sampling;

    #[tokio::test]
    async fn replays_prefix_words_up_to_budget() {
        let engine = EchoEngine::new("echo");
        let tokens: Vec<_> = engine
            .generate(EngineRequest {
                prefix: "a b".into(),
                sampling: Sampling::Greedy,
                budget: 3,
            })
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            tokens,
            vec![
                GeneratedToken::new(" a", false),
                GeneratedToken::new(" b", false),
                GeneratedToken::new(" a", true),
            ]
        );
        assert_eq!(engine.count_tokens(" a b  c\n").unwrap(), 3);
    }
}
