use std::{fs, sync::Arc};

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tokio::{sync::mpsc, task};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    config::TorchConfig,
    model::{
        EngineError, EngineRequest, GeneratedToken, GenerationEngine, ModelMetadata, TokenStream,
    },
    params::Sampling,
};

/// Tokens buffered between the decode loop and the consumer.
const CHANNEL_CAPACITY: usize = 16;

/// A traced causal LM (`input_ids -> logits`) run through libtorch.
pub struct TorchEngine {
    name: String,
    size_bytes: u64,
    device: Device,
    eos_token_id: Option<i64>,
    tokenizer: Arc<Tokenizer>,
    module: Arc<Mutex<tch::CModule>>,
}

impl TorchEngine {
    pub fn load(name: &str, config: &TorchConfig) -> Result<Self, EngineError> {
        let module_path = config.module_path.as_path();
        if !module_path.exists() {
            return Err(EngineError::Artifact(module_path.display().to_string()));
        }
        let size_bytes = fs::metadata(module_path)
            .map_err(|e| EngineError::Artifact(e.to_string()))?
            .len();

        let tokenizer = Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;

        let mut module = tch::CModule::load_on_device(module_path, config.device)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        module.set_eval();

        tracing::info!(model = name, size_bytes, device = ?config.device, "loaded TorchScript module");

        Ok(Self {
            name: name.to_string(),
            size_bytes,
            device: config.device,
            eos_token_id: config.eos_token_id,
            tokenizer: Arc::new(tokenizer),
            module: Arc::new(Mutex::new(module)),
        })
    }
}

impl GenerationEngine for TorchEngine {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.name.clone(),
            backend: "torchscript".to_string(),
            size_bytes: Some(self.size_bytes),
        }
    }

    fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().len())
    }

    fn generate(&self, request: EngineRequest) -> TokenStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let decoder = Decoder {
            device: self.device,
            eos_token_id: self.eos_token_id,
            tokenizer: self.tokenizer.clone(),
            module: self.module.clone(),
        };

        task::spawn_blocking(move || {
            if let Err(err) = decoder.run(request, &tx) {
                let _ = tx.blocking_send(Err(err));
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

struct Decoder {
    device: Device,
    eos_token_id: Option<i64>,
    tokenizer: Arc<Tokenizer>,
    module: Arc<Mutex<tch::CModule>>,
}

type TokenSender = mpsc::Sender<Result<GeneratedToken, EngineError>>;

impl Decoder {
    /// Autoregressive decode loop. Returns early, without error, once the
    /// receiving side has been dropped.
    fn run(&self, request: EngineRequest, tx: &TokenSender) -> Result<(), EngineError> {
        let encoding = self
            .tokenizer
            .encode(request.prefix.as_str(), true)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            input_ids.push(0);
        }
        let prompt_len = input_ids.len();
        let mut emitted = String::new();

        no_grad(|| {
            let module = self.module.lock();

            for step in 0..request.budget {
                let input = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);
                let output = module
                    .forward_is(&[IValue::Tensor(input)])
                    .map_err(|e| EngineError::Inference(e.to_string()))?;

                // Traced models return either the logits or a (logits, past) tuple.
                let logits = match output {
                    IValue::Tensor(t) => t,
                    IValue::Tuple(ref items) if !items.is_empty() => match &items[0] {
                        IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(EngineError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(EngineError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                let last_logits = logits.select(1, -1).squeeze().to_kind(Kind::Float);
                let next_token_id = pick_token(&last_logits, request.sampling);
                input_ids.push(next_token_id);

                let is_eos = self.eos_token_id == Some(next_token_id);
                let is_final = is_eos || step + 1 == request.budget;

                // Decode the whole continuation and diff against what was
                // already sent so merged multi-byte pieces come out whole.
                let generated: Vec<u32> = input_ids[prompt_len..]
                    .iter()
                    .map(|&id| id as u32)
                    .collect();
                let decoded = self
                    .tokenizer
                    .decode(&generated, true)
                    .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
                let text = match decoded.strip_prefix(emitted.as_str()) {
                    Some(rest) => rest.to_string(),
                    None => self
                        .tokenizer
                        .decode(&[next_token_id as u32], true)
                        .map_err(|e| EngineError::Tokenizer(e.to_string()))?,
                };
                emitted = decoded;

                if tx
                    .blocking_send(Ok(GeneratedToken::new(text, is_final)))
                    .is_err()
                {
                    tracing::debug!(step, "token receiver dropped, stopping decode loop");
                    return Ok(());
                }
                if is_final {
                    break;
                }
            }

            Ok(())
        })
    }
}

fn pick_token(logits: &Tensor, sampling: Sampling) -> i64 {
    match sampling {
        Sampling::Greedy => logits.argmax(0, false).int64_value(&[]),
        Sampling::Sample {
            temperature,
            top_k,
            top_p,
        } => {
            let mut scores = logits / temperature;
            let vocab = scores.size()[0];

            if top_k > 0 && (top_k as i64) < vocab {
                let (values, _) = scores.topk(top_k as i64, -1, true, true);
                let threshold = values.double_value(&[top_k as i64 - 1]);
                scores = scores.masked_fill(&scores.lt(threshold), f64::NEG_INFINITY);
            }

            if top_p < 1.0 {
                let (sorted, indices) = scores.sort(-1, true);
                let probs = sorted.softmax(-1, Kind::Float);
                let cumulative = probs.cumsum(-1, Kind::Float);
                // Keep the smallest prefix whose mass reaches top_p.
                let remove = (&cumulative - &probs).gt(top_p);
                let sorted = sorted.masked_fill(&remove, f64::NEG_INFINITY);
                scores = scores.scatter(-1, &indices, &sorted);
            }

            scores
                .softmax(-1, Kind::Float)
                .multinomial(1, false)
                .int64_value(&[0])
        }
    }
}
