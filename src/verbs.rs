//! Verb-pair detection
//!
//! Finds the first agreement-bearing verb of a sentence and builds the
//! minimal contrast: the same sentence with the verb's number flipped.

use serde::Serialize;

use crate::error::{AgreementError, Result};

/// Grammatical number of a verb form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Number {
    Singular,
    Plural,
}

/// A singular/plural pairing of one verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerbPair {
    pub singular: &'static str,
    pub plural: &'static str,
}

/// Supported verb pairs, in lookup order
pub const VERB_PAIRS: [VerbPair; 4] = [
    VerbPair::new("has", "have"),
    VerbPair::new("is", "are"),
    VerbPair::new("was", "were"),
    VerbPair::new("does", "do"),
];

impl VerbPair {
    pub const fn new(singular: &'static str, plural: &'static str) -> Self {
        Self { singular, plural }
    }

    /// Find the pair containing `word` (case-insensitive)
    pub fn lookup(word: &str) -> Option<(VerbPair, Number)> {
        VERB_PAIRS
            .iter()
            .find_map(|pair| pair.number_of(word).map(|n| (*pair, n)))
    }

    /// Number of `word` within this pair, if it is one of its forms
    pub fn number_of(&self, word: &str) -> Option<Number> {
        if word.eq_ignore_ascii_case(self.singular) {
            Some(Number::Singular)
        } else if word.eq_ignore_ascii_case(self.plural) {
            Some(Number::Plural)
        } else {
            None
        }
    }

    /// The form carrying `number`
    pub fn form(&self, number: Number) -> &'static str {
        match number {
            Number::Singular => self.singular,
            Number::Plural => self.plural,
        }
    }

    /// The other form of the pair (singular ↔ plural)
    pub fn counterpart(&self, word: &str) -> Option<&'static str> {
        match self.number_of(word)? {
            Number::Singular => Some(self.plural),
            Number::Plural => Some(self.singular),
        }
    }
}

/// A sentence and its number-flipped contrast
#[derive(Debug, Clone, Serialize)]
pub struct SentencePair {
    /// Input as received
    pub original: String,
    /// Input trimmed; the verb keeps the number the user wrote
    pub correct: String,
    /// `correct` with the verb replaced by its counterpart
    pub incorrect: String,
    pub verb_pair: VerbPair,
    /// Verb as written in the sentence
    pub actual: String,
    /// Replacement written into `incorrect`, cased like `actual`
    pub wrong: String,
    /// Number of the verb in `correct`
    pub number: Number,
    /// Byte span of the verb in `correct`
    pub verb_span: (usize, usize),
}

impl SentencePair {
    /// Text of `correct` before the verb, without trailing whitespace
    pub fn prefix(&self) -> &str {
        self.correct[..self.verb_span.0].trim_end()
    }

    /// Canonical lowercase form of the verb in `correct`
    pub fn correct_form(&self) -> &'static str {
        self.verb_pair.form(self.number)
    }

    /// Canonical lowercase form of the verb in `incorrect`
    pub fn wrong_form(&self) -> &'static str {
        match self.number {
            Number::Singular => self.verb_pair.plural,
            Number::Plural => self.verb_pair.singular,
        }
    }
}

/// Split text into words: maximal runs of ASCII letters, with byte spans
fn words(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let bytes = text.as_bytes();
    let mut pos = 0;
    std::iter::from_fn(move || {
        while pos < bytes.len() && !bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        if pos >= bytes.len() {
            return None;
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        Some((start, &text[start..pos]))
    })
}

/// Write `form` with the casing pattern of `like`
pub(crate) fn match_case(form: &str, like: &str) -> String {
    let mut chars = like.chars();
    let first_upper = chars.next().is_some_and(|c| c.is_ascii_uppercase());
    let all_upper = like.len() > 1 && like.chars().all(|c| c.is_ascii_uppercase());

    if all_upper {
        form.to_ascii_uppercase()
    } else if first_upper {
        let mut out = String::with_capacity(form.len());
        let mut fc = form.chars();
        if let Some(c) = fc.next() {
            out.push(c.to_ascii_uppercase());
        }
        out.extend(fc);
        out
    } else {
        form.to_string()
    }
}

/// Detect the first supported verb and build the contrast pair
pub fn detect(sentence: &str) -> Result<SentencePair> {
    let correct = sentence.trim();

    let (start, actual, pair, number) = words(correct)
        .find_map(|(start, word)| VerbPair::lookup(word).map(|(p, n)| (start, word, p, n)))
        .ok_or(AgreementError::UnsupportedVerb)?;

    let end = start + actual.len();
    let replacement = pair.form(match number {
        Number::Singular => Number::Plural,
        Number::Plural => Number::Singular,
    });
    let wrong = match_case(replacement, actual);
    let incorrect = format!("{}{}{}", &correct[..start], wrong, &correct[end..]);

    Ok(SentencePair {
        original: sentence.to_string(),
        correct: correct.to_string(),
        incorrect,
        verb_pair: pair,
        actual: actual.to_string(),
        wrong,
        number,
        verb_span: (start, end),
    })
}
