pub mod config;
pub mod connection;
pub mod encoder;
pub mod error;
pub mod model;
pub mod params;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::{AppConfig, GenerationDefaults, SlotScope};
pub use connection::{ClientFrame, drive_connection};
pub use error::ServiceError;
pub use model::{EchoEngine, GenerationEngine, ModelRegistry};
pub use protocol::{Reply, Response};
pub use server::{AppState, router, run_one_shot};
pub use session::{InferenceSession, SessionState, SessionTable};
