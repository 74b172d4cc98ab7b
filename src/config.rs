use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

#[cfg(feature = "tch-backend")]
use std::path::PathBuf;

use anyhow::{bail, ensure};
#[cfg(feature = "tch-backend")]
use tch::Device;

/// Where a generation slot is held: for one generate cycle, or for the
/// whole lifetime of a session when the engine needs session affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotScope {
    Cycle,
    Session,
}

/// Process-wide defaults and ceilings applied by the parameter validator.
#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub max_length_ceiling: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_length_ceiling: 2048,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        }
    }
}

#[cfg(feature = "tch-backend")]
#[derive(Debug, Clone)]
pub struct TorchConfig {
    pub module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub eos_token_id: Option<i64>,
    pub device: Device,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub models: Vec<String>,
    pub default_model: String,
    pub generation: GenerationDefaults,
    pub session_idle_timeout: Duration,
    pub generation_slots: usize,
    pub slot_scope: SlotScope,
    #[cfg(feature = "tch-backend")]
    pub torch: TorchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            models: vec!["echo".to_string()],
            default_model: "echo".to_string(),
            generation: GenerationDefaults::default(),
            session_idle_timeout: Duration::from_secs(300),
            generation_slots: 4,
            slot_scope: SlotScope::Cycle,
            #[cfg(feature = "tch-backend")]
            torch: TorchConfig {
                module_path: PathBuf::from("models/model.ts"),
                tokenizer_path: PathBuf::from("models/tokenizer.json"),
                eos_token_id: None,
                device: Device::Cpu,
            },
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let models: Vec<String> = env::var("MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.models);
        ensure!(!models.is_empty(), "MODELS must name at least one model");

        let default_model = env::var("DEFAULT_MODEL").unwrap_or_else(|_| models[0].clone());
        ensure!(
            models.contains(&default_model),
            "DEFAULT_MODEL {default_model:?} is not listed in MODELS"
        );

        let generation = GenerationDefaults {
            max_length_ceiling: parse_var("MAX_LENGTH_CEILING")
                .unwrap_or(defaults.generation.max_length_ceiling),
            temperature: parse_var("TEMPERATURE").unwrap_or(defaults.generation.temperature),
            top_k: parse_var("TOP_K").unwrap_or(defaults.generation.top_k),
            top_p: parse_var("TOP_P").unwrap_or(defaults.generation.top_p),
        };
        ensure!(
            generation.max_length_ceiling > 0,
            "MAX_LENGTH_CEILING must be greater than 0"
        );

        let session_idle_timeout = parse_var("SESSION_IDLE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_idle_timeout);

        let generation_slots = parse_var("GENERATION_SLOTS").unwrap_or(defaults.generation_slots);
        ensure!(generation_slots > 0, "GENERATION_SLOTS must be greater than 0");

        let slot_scope = match env::var("SLOT_SCOPE") {
            Ok(raw) => parse_slot_scope(&raw)?,
            Err(_) => defaults.slot_scope,
        };

        #[cfg(feature = "tch-backend")]
        let torch = TorchConfig {
            module_path: env::var("MODULE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.torch.module_path),
            tokenizer_path: env::var("TOKENIZER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.torch.tokenizer_path),
            eos_token_id: parse_var("EOS_TOKEN_ID"),
            device: parse_device(&env::var("DEVICE").unwrap_or_else(|_| "cpu".into())),
        };

        Ok(Self {
            listen_addr,
            models,
            default_model,
            generation,
            session_idle_timeout,
            generation_slots,
            slot_scope,
            #[cfg(feature = "tch-backend")]
            torch,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_slot_scope(raw: &str) -> anyhow::Result<SlotScope> {
    match raw.trim().to_lowercase().as_str() {
        "cycle" => Ok(SlotScope::Cycle),
        "session" => Ok(SlotScope::Session),
        other => bail!("SLOT_SCOPE must be `cycle` or `session`, got {other:?}"),
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            return Device::Cuda(idx);
        }
    }
    Device::Cpu
}
