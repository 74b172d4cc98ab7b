use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{GenerationEngine, ModelMetadata},
    params::ValidationError,
};

/// Maps model names to the engines serving them.
pub struct ModelRegistry {
    engines: BTreeMap<String, Arc<dyn GenerationEngine>>,
    default_model: String,
}

impl ModelRegistry {
    /// Builds the registry for the configured models. Without a model
    /// backend compiled in, every configured name is served by
    /// [`EchoEngine`](crate::model::EchoEngine).
    #[cfg(not(feature = "tch-backend"))]
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let engines = config.models.iter().map(|name| {
            let engine: Arc<dyn GenerationEngine> =
                Arc::new(crate::model::EchoEngine::new(name.as_str()));
            (name.clone(), engine)
        });
        Self::from_engines(config.default_model.clone(), engines)
    }

    /// Loads the TorchScript artifact and serves it under the default model
    /// name.
    #[cfg(feature = "tch-backend")]
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let engine = crate::model::TorchEngine::load(&config.default_model, &config.torch)?;
        let engine: Arc<dyn GenerationEngine> = Arc::new(engine);
        Self::from_engines(
            config.default_model.clone(),
            [(config.default_model.clone(), engine)],
        )
    }

    pub fn from_engines<I>(default_model: impl Into<String>, engines: I) -> Result<Self, ServiceError>
    where
        I: IntoIterator<Item = (String, Arc<dyn GenerationEngine>)>,
    {
        let default_model = default_model.into();
        let engines: BTreeMap<_, _> = engines.into_iter().collect();
        if !engines.contains_key(&default_model) {
            return Err(ServiceError::Other(format!(
                "default model {default_model:?} is not registered"
            )));
        }
        Ok(Self {
            engines,
            default_model,
        })
    }

    pub fn list_models(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn metadata(&self) -> Vec<ModelMetadata> {
        self.engines.values().map(|engine| engine.metadata()).collect()
    }

    /// Resolves a requested model name, falling back to the default.
    pub fn resolve(
        &self,
        requested: Option<&str>,
    ) -> Result<(String, Arc<dyn GenerationEngine>), ValidationError> {
        let name = requested.unwrap_or(&self.default_model);
        match self.engines.get(name) {
            Some(engine) => Ok((name.to_string(), engine.clone())),
            None => Err(ValidationError::UnknownModel {
                requested: name.to_string(),
                available: self.list_models().join(", "),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EchoEngine;

    fn registry() -> ModelRegistry {
        let engines = ["m1", "m2"].map(|name| {
            let engine: Arc<dyn GenerationEngine> = Arc::new(EchoEngine::new(name));
            (name.to_string(), engine)
        });
        ModelRegistry::from_engines("m1", engines).unwrap()
    }

    #[test]
    fn resolves_default_and_named_models() {
        let registry = registry();
        assert_eq!(registry.resolve(None).unwrap().0, "m1");
        assert_eq!(registry.resolve(Some("m2")).unwrap().0, "m2");
        assert_eq!(registry.list_models(), vec!["m1", "m2"]);
    }

    #[test]
    fn unknown_model_lists_alternatives() {
        let err = registry().resolve(Some("gpt")).err().unwrap();
        assert!(err.to_string().contains("m1, m2"), "{err}");
    }

    #[test]
    fn default_must_be_registered() {
        let engines: [(String, Arc<dyn GenerationEngine>); 0] = [];
        assert!(ModelRegistry::from_engines("m1", engines).is_err());
    }
}
