mod echo;
mod engine;
mod registry;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

pub use echo::EchoEngine;
pub use engine::{EngineError, EngineRequest, GeneratedToken, GenerationEngine, TokenStream};
#[cfg(feature = "tch-backend")]
pub use loader::TorchEngine;
pub use registry::ModelRegistry;
pub use types::ModelMetadata;
