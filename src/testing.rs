//! Stand-ins for the trained artifacts, shared by unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::str::FromStr;
use tokenizers::Tokenizer;

use crate::engine::{BatchedEngine, Engine};
use crate::tokenizer::SequenceEncoder;
use crate::types::{InferenceScore, TokenSequence};

pub const OOV_ID: u32 = 1;
pub const LOW_SCORE: f64 = 0.1;
pub const HIGH_SCORE: f64 = 0.9;

const VOCAB: &[(&str, u32)] = &[
    ("<OOV>", OOV_ID),
    ("i", 2),
    ("feel", 3),
    ("okay", 4),
    ("today", 5),
    ("hopeless", 6),
    ("poison", 7),
    ("so", 8),
    ("tired", 9),
];

pub fn id(word: &str) -> u32 {
    VOCAB
        .iter()
        .find(|(w, _)| *w == word)
        .map(|(_, id)| *id)
        .unwrap_or_else(|| panic!("`{word}` is not in the test vocabulary"))
}

pub fn tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .map(|(word, id)| (word.to_string(), serde_json::Value::from(*id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<OOV>"
        }
    });
    Tokenizer::from_str(&json.to_string()).expect("test tokenizer json is valid")
}

pub fn encoder(max_length: usize) -> SequenceEncoder {
    SequenceEncoder::new(tokenizer(), max_length)
}

/// Scores by keyword: "hopeless" is high risk, "poison" fails, anything
/// else is low risk.
pub struct ScriptedModel;

impl ScriptedModel {
    fn score_one(sequence: &TokenSequence) -> Result<InferenceScore> {
        let ids = sequence.ids();
        if ids.contains(&id("poison")) {
            anyhow::bail!("scripted failure on poisoned sequence");
        }
        if ids.contains(&id("hopeless")) {
            InferenceScore::new(HIGH_SCORE)
        } else {
            InferenceScore::new(LOW_SCORE)
        }
    }
}

#[async_trait]
impl Engine for ScriptedModel {
    async fn score(&self, sequence: TokenSequence) -> Result<InferenceScore> {
        Self::score_one(&sequence)
    }
}

#[async_trait]
impl BatchedEngine for ScriptedModel {
    async fn score_batch(
        &self,
        sequences: Vec<TokenSequence>,
    ) -> Result<Vec<Result<InferenceScore>>> {
        Ok(sequences.iter().map(Self::score_one).collect())
    }
}
