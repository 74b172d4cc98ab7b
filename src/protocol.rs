//! Wire messages for both channels.

use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};

use crate::{error::ServiceError, params::RawParameters};

/// Messages accepted on the streaming channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    OpenInferenceSession(OpenSessionRequest),
    Generate(GenerateRequest),
}

/// Must be the first message on a connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_length: Option<i64>,
    #[serde(default)]
    pub max_new_tokens: Option<i64>,
}

impl OpenSessionRequest {
    pub fn parameters(&self) -> RawParameters {
        RawParameters {
            model: self.model.clone(),
            max_length: self.max_length,
            max_new_tokens: self.max_new_tokens,
            ..RawParameters::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(flatten)]
    pub params: RawParameters,
}

/// Body of the one-shot `POST` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpGenerateRequest {
    #[serde(default)]
    pub inputs: Option<String>,
    #[serde(flatten)]
    pub params: RawParameters,
}

/// One incremental unit of a streaming generate cycle. `token_count` is
/// cumulative over the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub outputs: String,
    pub stop: bool,
    pub token_count: usize,
}

/// Successful payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Opened,
    Outputs(String),
    Chunk(Chunk),
}

/// What actually goes on the wire: `{"ok": true, ...}` or
/// `{"ok": false, "traceback": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(Reply),
    Failure { traceback: String },
}

impl Response {
    pub fn failure(err: &ServiceError) -> Self {
        Response::Failure {
            traceback: err.traceback(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Success(_))
    }
}

impl From<Result<Reply, ServiceError>> for Response {
    fn from(result: Result<Reply, ServiceError>) -> Self {
        match result {
            Ok(reply) => Response::Success(reply),
            Err(err) => Response::failure(&err),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Response::Success(Reply::Opened) => {
                let mut state = serializer.serialize_struct("Response", 1)?;
                state.serialize_field("ok", &true)?;
                state.end()
            }
            Response::Success(Reply::Outputs(outputs)) => {
                let mut state = serializer.serialize_struct("Response", 2)?;
                state.serialize_field("ok", &true)?;
                state.serialize_field("outputs", outputs)?;
                state.end()
            }
            Response::Success(Reply::Chunk(chunk)) => {
                let mut state = serializer.serialize_struct("Response", 4)?;
                state.serialize_field("ok", &true)?;
                state.serialize_field("outputs", &chunk.outputs)?;
                state.serialize_field("stop", &chunk.stop)?;
                state.serialize_field("token_count", &chunk.token_count)?;
                state.end()
            }
            Response::Failure { traceback } => {
                let mut state = serializer.serialize_struct("Response", 2)?;
                state.serialize_field("ok", &false)?;
                state.serialize_field("traceback", traceback)?;
                state.end()
            }
        }
    }
}
