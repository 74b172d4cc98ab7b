use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub backend: String,
    pub size_bytes: Option<u64>,
}
