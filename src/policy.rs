use anyhow::{Result, bail};

use crate::types::{Classification, InferenceScore, RiskLabel};

/// The single operating point every prediction is judged against.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationPolicy {
    threshold: f64,
}

impl ClassificationPolicy {
    pub fn new(threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("threshold must be within [0, 1], got {threshold}");
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Inclusive: a score equal to the threshold is high risk.
    pub fn classify(&self, score: InferenceScore) -> Classification {
        let label = if score.value() >= self.threshold {
            RiskLabel::HighRisk
        } else {
            RiskLabel::LowRisk
        };
        Classification {
            label,
            message: label.message().to_string(),
            threshold_used: self.threshold,
        }
    }
}
