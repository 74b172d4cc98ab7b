#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream};
use llm_session_service::{
    AppConfig, AppState, EchoEngine, GenerationEngine, ModelRegistry,
    model::{EngineError, EngineRequest, GeneratedToken, ModelMetadata, TokenStream},
};

/// Emits one good token, then fails.
pub struct FailingEngine;

impl GenerationEngine for FailingEngine {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: "broken".into(),
            backend: "test".into(),
            size_bytes: None,
        }
    }

    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(text.split_whitespace().count())
    }

    fn generate(&self, _request: EngineRequest) -> TokenStream {
        stream::iter(vec![
            Ok(GeneratedToken::new(" partial", false)),
            Err(EngineError::Inference("CUDA out of memory".into())),
        ])
        .boxed()
    }
}

/// Never finishes a cycle on its own.
pub struct SlowEngine;

impl GenerationEngine for SlowEngine {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: "slow".into(),
            backend: "test".into(),
            size_bytes: None,
        }
    }

    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(text.split_whitespace().count())
    }

    fn generate(&self, request: EngineRequest) -> TokenStream {
        Box::pin(async_stream::stream! {
            for _ in 0..request.budget {
                tokio::time::sleep(Duration::from_millis(200)).await;
                yield Ok::<_, EngineError>(GeneratedToken::new(" z", false));
            }
        })
    }
}

/// Counts produced tokens and records when its stream is dropped.
#[derive(Clone, Default)]
pub struct TrackedEngine {
    pub produced: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl TrackedEngine {
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl GenerationEngine for TrackedEngine {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: "tracked".into(),
            backend: "test".into(),
            size_bytes: None,
        }
    }

    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(text.split_whitespace().count())
    }

    fn generate(&self, request: EngineRequest) -> TokenStream {
        let guard = DropFlag(self.dropped.clone());
        let produced = self.produced.clone();
        Box::pin(async_stream::stream! {
            let _guard = guard;
            for _ in 0..request.budget {
                tokio::time::sleep(Duration::from_millis(20)).await;
                produced.fetch_add(1, Ordering::SeqCst);
                yield Ok::<_, EngineError>(GeneratedToken::new(" t", false));
            }
        })
    }
}

pub fn config(idle_timeout: Duration) -> AppConfig {
    AppConfig {
        models: vec!["echo".into(), "broken".into(), "slow".into()],
        default_model: "echo".into(),
        session_idle_timeout: idle_timeout,
        ..AppConfig::default()
    }
}

pub fn state_with(config: AppConfig) -> AppState {
    state_with_engines(config, Vec::new())
}

pub fn state_with_engines(
    config: AppConfig,
    extra: Vec<(String, Arc<dyn GenerationEngine>)>,
) -> AppState {
    let builtin: [(&str, Arc<dyn GenerationEngine>); 3] = [
        ("echo", Arc::new(EchoEngine::new("echo"))),
        ("broken", Arc::new(FailingEngine)),
        ("slow", Arc::new(SlowEngine)),
    ];
    let engines = builtin
        .into_iter()
        .map(|(name, engine)| (name.to_string(), engine))
        .chain(extra);
    let registry = ModelRegistry::from_engines("echo", engines).unwrap();
    AppState::new(Arc::new(config), Arc::new(registry))
}

pub fn state() -> AppState {
    state_with(config(Duration::from_secs(300)))
}
