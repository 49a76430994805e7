use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token ids normalised to the model's fixed input length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence(Vec<u32>);

impl TokenSequence {
    pub(crate) fn from_padded(ids: Vec<u32>) -> Self {
        Self(ids)
    }

    pub fn ids(&self) -> &[u32] {
        &self.0
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

/// Probability in [0, 1] that a text expresses high-risk content.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct InferenceScore(f64);

impl InferenceScore {
    pub fn new(probability: f64) -> anyhow::Result<Self> {
        if probability.is_finite() && (0.0..=1.0).contains(&probability) {
            Ok(Self(probability))
        } else {
            anyhow::bail!("model produced an invalid probability: {probability}")
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLabel {
    LowRisk,
    HighRisk,
}

impl RiskLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowRisk => "low_risk",
            Self::HighRisk => "high_risk",
        }
    }

    /// Wire value of the `prediction` field.
    pub fn as_flag(self) -> u8 {
        match self {
            Self::LowRisk => 0,
            Self::HighRisk => 1,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::LowRisk),
            1 => Some(Self::HighRisk),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::LowRisk => "Low risk",
            Self::HighRisk => "High risk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: RiskLabel,
    pub message: String,
    pub threshold_used: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub input_text: String,
    pub classification: Classification,
    pub score: InferenceScore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPredictRequest {
    pub texts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub timestamp: DateTime<Utc>,
    pub input_text: String,
    pub prediction: u8,
    pub probability: f64,
    pub message: String,
}

impl From<&PredictionRecord> for PredictResponse {
    fn from(record: &PredictionRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            input_text: record.input_text.clone(),
            prediction: record.classification.label.as_flag(),
            probability: record.score.value(),
            message: record.classification.message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchPredictResponse {
    pub id: String,
    pub results: Vec<BatchItem>,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub text: String,
    #[serde(flatten)]
    pub outcome: BatchItemOutcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Ok { prediction: PredictResponse },
    Error { error: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackEntry {
    pub timestamp: DateTime<Utc>,
    pub feedback: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_rejects_out_of_range_and_nan() {
        assert!(InferenceScore::new(0.0).is_ok());
        assert!(InferenceScore::new(1.0).is_ok());
        assert!(InferenceScore::new(1.0001).is_err());
        assert!(InferenceScore::new(-0.1).is_err());
        assert!(InferenceScore::new(f64::NAN).is_err());
    }

    #[test]
    fn label_flags_are_stable() {
        assert_eq!(RiskLabel::from_flag(0), Some(RiskLabel::LowRisk));
        assert_eq!(RiskLabel::from_flag(1), Some(RiskLabel::HighRisk));
        assert_eq!(RiskLabel::from_flag(2), None);
        assert_eq!(RiskLabel::HighRisk.as_flag(), 1);
    }

    #[test]
    fn batch_item_serializes_with_status_tag() {
        let item = BatchItem {
            index: 2,
            text: String::new(),
            outcome: BatchItemOutcome::Error {
                error: "Input text is empty.".to_string(),
            },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["index"], 2);
        assert_eq!(json["error"], "Input text is empty.");
    }
}
