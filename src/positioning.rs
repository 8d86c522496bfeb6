//! Character-to-token position handling
//!
//! The verb detector works in byte offsets of the input sentence; the
//! patching runner needs token indices. Tokenizing with the offset mapping
//! lets us convert one into the other without tokenizer-specific heuristics,
//! and keeps the mapping valid after the sequence is truncated to fit the
//! model's context window.

/// Encoding result with tokens and their offsets
#[derive(Debug, Clone)]
pub struct EncodingWithOffsets {
    /// Token IDs
    pub ids: Vec<u32>,
    /// Token strings
    pub tokens: Vec<String>,
    /// Byte offset range for each token: (start, end)
    pub offsets: Vec<(usize, usize)>,
}

impl EncodingWithOffsets {
    /// Create a new encoding with offsets
    pub fn new(ids: Vec<u32>, tokens: Vec<String>, offsets: Vec<(usize, usize)>) -> Self {
        Self {
            ids,
            tokens,
            offsets,
        }
    }

    /// Find the token index that contains the given byte position
    pub fn char_to_token(&self, char_pos: usize) -> Option<usize> {
        self.offsets
            .iter()
            .position(|(start, end)| char_pos >= *start && char_pos < *end)
    }

    /// Indices where this encoding and `other` hold different token IDs,
    /// compared over their common length
    pub fn differing_positions(&self, other: &EncodingWithOffsets) -> Vec<usize> {
        self.ids
            .iter()
            .zip(&other.ids)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect()
    }

    /// Keep only the last `max_len` tokens.
    ///
    /// Returns the number of tokens dropped from the start; token indices
    /// into the truncated encoding are the old indices minus that count.
    pub fn keep_last(&mut self, max_len: usize) -> usize {
        let dropped = self.len().saturating_sub(max_len);
        if dropped > 0 {
            self.ids.drain(..dropped);
            self.tokens.drain(..dropped);
            self.offsets.drain(..dropped);
        }
        dropped
    }

    /// Get the number of tokens
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Byte-level BPE style tokenization of "The cat has fur."
    fn encoding() -> EncodingWithOffsets {
        EncodingWithOffsets::new(
            vec![464, 3797, 468, 9230, 13],
            vec![
                "The".into(),
                "Ġcat".into(),
                "Ġhas".into(),
                "Ġfur".into(),
                ".".into(),
            ],
            vec![(0, 3), (3, 7), (7, 11), (11, 15), (15, 16)],
        )
    }

    #[test]
    fn test_char_to_token() {
        let encoding = encoding();

        assert_eq!(encoding.char_to_token(0), Some(0));
        // 'h' of "has" sits inside the token that owns the leading space
        assert_eq!(encoding.char_to_token(8), Some(2));
        assert_eq!(encoding.char_to_token(15), Some(4));
        assert_eq!(encoding.char_to_token(16), None);
    }

    #[test]
    fn test_differing_positions() {
        let good = encoding();
        let mut bad = encoding();
        bad.ids[2] = 423;
        assert_eq!(good.differing_positions(&bad), vec![2]);
        assert!(good.differing_positions(&good).is_empty());

        // Shifted sequences differ almost everywhere
        bad.keep_last(4);
        assert_eq!(good.differing_positions(&bad), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_keep_last() {
        let mut encoding = encoding();

        assert_eq!(encoding.keep_last(10), 0);
        assert_eq!(encoding.len(), 5);

        assert_eq!(encoding.keep_last(3), 2);
        assert_eq!(encoding.ids, vec![468, 9230, 13]);
        // Offsets still refer to the original text
        assert_eq!(encoding.char_to_token(8), Some(0));

        assert_eq!(encoding.keep_last(0), 3);
        assert!(encoding.is_empty());
    }
}
