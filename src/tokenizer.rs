use anyhow::Result;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::types::TokenSequence;

/// Id used for left padding; never assigned to a vocabulary entry.
pub const PAD_ID: u32 = 0;

/// Turns raw text into the fixed-length id sequence the classifier was
/// trained on.
#[derive(Clone)]
pub struct SequenceEncoder {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl SequenceEncoder {
    pub fn new(tokenizer: Tokenizer, max_length: usize) -> Self {
        Self {
            tokenizer,
            max_length,
        }
    }

    pub fn from_file(path: &Path, max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("Cannot load tokenizer from '{}': {e}", path.display())
        })?;
        Ok(Self::new(tokenizer, max_length))
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Out-of-vocabulary words resolve to whatever unknown id the fitted
    /// vocabulary declares.
    pub fn encode(&self, text: &str) -> Result<TokenSequence> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(pad_sequence(encoding.get_ids(), self.max_length))
    }
}

/// Left-pads with [`PAD_ID`] and truncates from the left, keeping the last
/// `max_length` ids.
pub fn pad_sequence(ids: &[u32], max_length: usize) -> TokenSequence {
    let kept = &ids[ids.len().saturating_sub(max_length)..];
    let mut padded = vec![PAD_ID; max_length - kept.len()];
    padded.extend_from_slice(kept);
    TokenSequence::from_padded(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use proptest::prelude::*;

    #[test]
    fn pads_short_sequences_on_the_left() {
        let seq = pad_sequence(&[5, 6, 7], 6);
        assert_eq!(seq.ids(), &[0, 0, 0, 5, 6, 7]);
    }

    #[test]
    fn truncates_long_sequences_from_the_left() {
        let seq = pad_sequence(&[1, 2, 3, 4, 5], 3);
        assert_eq!(seq.ids(), &[3, 4, 5]);
    }

    #[test]
    fn exact_length_is_untouched() {
        let seq = pad_sequence(&[9, 8], 2);
        assert_eq!(seq.ids(), &[9, 8]);
    }

    #[test]
    fn encodes_known_words_and_maps_unknown_to_oov() {
        let encoder = testing::encoder(8);
        let seq = encoder.encode("I feel zzyzx today").unwrap();
        assert_eq!(
            seq.ids(),
            &[0, 0, 0, 0, testing::id("i"), testing::id("feel"), testing::OOV_ID, testing::id("today")]
        );
    }

    #[test]
    fn encoding_is_case_insensitive() {
        let encoder = testing::encoder(8);
        assert_eq!(
            encoder.encode("I FEEL OKAY").unwrap(),
            encoder.encode("i feel okay").unwrap()
        );
    }

    proptest! {
        #[test]
        fn padded_length_is_always_max_length(ids in proptest::collection::vec(1u32..500, 0..400), max_length in 1usize..300) {
            prop_assert_eq!(pad_sequence(&ids, max_length).len(), max_length);
        }

        #[test]
        fn encode_has_fixed_length_and_is_deterministic(text in "\\PC{1,300}") {
            let encoder = testing::encoder(200);
            let first = encoder.encode(&text).unwrap();
            let second = encoder.encode(&text).unwrap();
            prop_assert_eq!(first.len(), 200);
            prop_assert_eq!(first, second);
        }
    }
}
