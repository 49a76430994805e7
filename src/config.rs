use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::history::HistoryConfig;
use crate::sequence_model::SequenceModelConfig;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Batch size for grouping sequences into one forward pass
    #[arg(long, env = "BATCH_SIZE", default_value = "8")]
    pub batch_size: usize,

    /// Tick duration in milliseconds for batch processing
    #[arg(long, env = "TICK_DURATION_MS", default_value = "10")]
    pub tick_duration_ms: u64,

    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Model ID from Hugging Face Hub
    #[arg(long, env = "MODEL_ID")]
    pub model_id: Option<String>,

    /// Local path to model directory
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Model revision/branch on Hugging Face
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub model_revision: String,

    /// Use PyTorch weights instead of safetensors
    #[arg(long, env = "USE_PTH")]
    pub use_pth: bool,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Padded sequence length the model was trained with
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "200", value_parser = parse_sequence_length)]
    pub max_sequence_length: usize,

    /// Probability at or above which a text is labelled high risk
    #[arg(long, env = "THRESHOLD", default_value = "0.6", value_parser = parse_threshold)]
    pub threshold: f64,

    /// Number of recent predictions kept in memory for GET /history
    #[arg(long, env = "HISTORY_CAPACITY", default_value = "20", value_parser = parse_capacity)]
    pub history_capacity: usize,

    /// Append-only CSV log of every prediction
    #[arg(long, env = "PREDICTION_LOG", default_value = "prediction_logs.csv")]
    pub prediction_log: PathBuf,

    /// Append-only CSV log of user feedback
    #[arg(long, env = "FEEDBACK_LOG", default_value = "feedback_log.csv")]
    pub feedback_log: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub tick_duration: Duration,
}

impl From<&Config> for BatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            tick_duration: Duration::from_millis(config.tick_duration_ms.max(1)),
        }
    }
}

impl From<&Config> for SequenceModelConfig {
    fn from(config: &Config) -> Self {
        Self {
            model_id: config.model_id.clone(),
            model_path: config.model_path.clone(),
            revision: config.model_revision.clone(),
            use_pth: config.use_pth,
            cpu: config.cpu_only,
        }
    }
}

impl From<&Config> for HistoryConfig {
    fn from(config: &Config) -> Self {
        Self {
            path: config.prediction_log.clone(),
            capacity: config.history_capacity,
            default_threshold: config.threshold,
        }
    }
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_threshold(value: &str) -> Result<f64, String> {
    let threshold: f64 = value
        .parse()
        .map_err(|e| format!("`{value}` is not a number: {e}"))?;
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(format!("threshold must be within [0, 1], got {threshold}"))
    }
}

fn parse_capacity(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("history capacity must be at least 1".to_string()),
        Ok(capacity) => Ok(capacity),
        Err(e) => Err(format!("`{value}` is not a valid capacity: {e}")),
    }
}

fn parse_sequence_length(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("max sequence length must be at least 1".to_string()),
        Ok(length) => Ok(length),
        Err(e) => Err(format!("`{value}` is not a valid length: {e}")),
    }
}
