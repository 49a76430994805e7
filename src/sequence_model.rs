use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, LSTM, LSTMConfig, Linear, RNN, VarBuilder};
use hf_hub::{Repo, RepoType, api::tokio::Api};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::BatchedEngine;
use crate::tokenizer::SequenceEncoder;
use crate::types::{InferenceScore, TokenSequence};

/// Shape of the trained network, read from the artifact's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelShape {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub hidden_size: usize,
}

#[derive(Debug, Clone)]
pub struct SequenceModelConfig {
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub revision: String,
    pub use_pth: bool,
    pub cpu: bool,
}

impl Default for SequenceModelConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            model_path: None,
            revision: "main".to_string(),
            use_pth: false,
            cpu: false,
        }
    }
}

/// Embedding → LSTM → dense sigmoid over the last hidden state. Inputs are
/// left-padded, so the last step always sees real tokens.
pub struct RiskClassifier {
    embedding: Embedding,
    lstm: LSTM,
    head: Linear,
    vocab_size: usize,
}

impl RiskClassifier {
    pub fn load(vb: VarBuilder, shape: &ModelShape) -> candle_core::Result<Self> {
        let embedding =
            candle_nn::embedding(shape.vocab_size, shape.embedding_dim, vb.pp("embedding"))?;
        let lstm = candle_nn::lstm(
            shape.embedding_dim,
            shape.hidden_size,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let head = candle_nn::linear(shape.hidden_size, 1, vb.pp("classifier"))?;
        Ok(Self {
            embedding,
            lstm,
            head,
            vocab_size: shape.vocab_size,
        })
    }

    /// `input_ids` is `(batch, seq_len)`; returns `(batch,)` probabilities.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let embedded = self.embedding.forward(input_ids)?;
        let states = self.lstm.seq(&embedded)?;
        let last = states
            .last()
            .context("cannot classify an empty sequence")?;
        let logits = self.head.forward(last.h())?;
        Ok(candle_nn::ops::sigmoid(&logits)?.squeeze(1)?)
    }

    /// Scores each row; a row with ids outside the vocabulary fails alone.
    fn score_rows(&self, sequences: &[TokenSequence], device: &Device) -> Result<Vec<Result<InferenceScore>>> {
        let mut results: Vec<Option<Result<InferenceScore>>> = Vec::with_capacity(sequences.len());
        let mut valid = Vec::new();

        for (index, sequence) in sequences.iter().enumerate() {
            match sequence
                .ids()
                .iter()
                .find(|&&id| id as usize >= self.vocab_size)
            {
                Some(id) => results.push(Some(Err(anyhow::anyhow!(
                    "token id {id} is outside the model vocabulary of {}",
                    self.vocab_size
                )))),
                None => {
                    results.push(None);
                    valid.push(index);
                }
            }
        }

        if !valid.is_empty() {
            let seq_len = sequences[valid[0]].len();
            if valid.iter().any(|&i| sequences[i].len() != seq_len) {
                bail!("sequences in one batch must share a length");
            }
            let flat: Vec<u32> = valid
                .iter()
                .flat_map(|&i| sequences[i].ids().iter().copied())
                .collect();
            let input_ids = Tensor::from_vec(flat, (valid.len(), seq_len), device)?;
            let probabilities = self
                .forward(&input_ids)?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?;

            for (&index, probability) in valid.iter().zip(probabilities) {
                results[index] = Some(InferenceScore::new(f64::from(probability)));
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(anyhow::anyhow!("sequence was not scored"))))
            .collect())
    }
}

pub struct SequenceModelEngine {
    model: Arc<RiskClassifier>,
    device: Device,
}

impl SequenceModelEngine {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    pub fn new(model: RiskClassifier, device: Device) -> Self {
        Self {
            model: Arc::new(model),
            device,
        }
    }

    /// Loads the classifier and its fitted tokenizer. Any missing or
    /// unreadable artifact is an error; there is no fallback model.
    #[tracing::instrument(skip(config, max_length), fields(model_id = ?config.model_id, cpu = config.cpu))]
    pub async fn load(
        config: SequenceModelConfig,
        max_length: usize,
    ) -> Result<(Self, SequenceEncoder)> {
        let device = Self::device(config.cpu)?;

        let weights_name = if config.use_pth {
            "pytorch_model.bin"
        } else {
            "model.safetensors"
        };

        // Get files from either the HuggingFace API, or from a specified local directory
        let (config_filename, tokenizer_filename, weights_filename) = match &config.model_path {
            Some(base_path) => {
                if !base_path.is_dir() {
                    bail!("Model path {} is not a directory.", base_path.display());
                }
                (
                    base_path.join("config.json"),
                    base_path.join("tokenizer.json"),
                    base_path.join(weights_name),
                )
            }
            None => {
                let Some(model_id) = config.model_id.clone() else {
                    bail!("Either model_id or model_path must be specified");
                };
                let repo = Repo::with_revision(model_id, RepoType::Model, config.revision.clone());
                let api = Api::new()?;
                let api = api.repo(repo);
                (
                    api.get("config.json").await?,
                    api.get("tokenizer.json").await?,
                    api.get(weights_name).await?,
                )
            }
        };

        let shape = std::fs::read_to_string(&config_filename)
            .with_context(|| format!("cannot read {}", config_filename.display()))?;
        let shape: ModelShape = serde_json::from_str(&shape)
            .with_context(|| format!("invalid model config {}", config_filename.display()))?;
        tracing::debug!(?shape, "Model config parsed");

        let encoder = SequenceEncoder::from_file(&tokenizer_filename, max_length)?;

        if !weights_filename.is_file() {
            bail!("Model weights {} not found", weights_filename.display());
        }
        let vb = if config.use_pth {
            VarBuilder::from_pth(&weights_filename, DType::F32, &device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DType::F32, &device)? }
        };
        let model = RiskClassifier::load(vb, &shape).context("model weights do not match config")?;

        Ok((Self::new(model, device), encoder))
    }
}

#[async_trait]
impl BatchedEngine for SequenceModelEngine {
    #[tracing::instrument(skip(self, sequences), fields(batch_size = sequences.len()))]
    async fn score_batch(
        &self,
        sequences: Vec<TokenSequence>,
    ) -> Result<Vec<Result<InferenceScore>>> {
        let model = Arc::clone(&self.model);
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || model.score_rows(&sequences, &device)).await?
    }
}
