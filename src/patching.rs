//! Layer-by-layer activation patching
//!
//! For every block of the model, the incorrect sentence is run with that one
//! block's activation replaced by the value captured from the correct
//! sentence, and the probability of the correct verb is read at the final
//! token. Patches never accumulate: each layer is evaluated on its own
//! forward pass from the same clean cache.
//!
//! Patching `resid-post` at every position replays the correct run from that
//! layer on, so every layer would read back the same clean probability. That
//! combination is rejected up front.

use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AgreementError, Result};
use crate::intervention::{HookPoint, PatchPositions, PatchSpec};
use crate::model::AgreementModel;
use crate::positioning::EncodingWithOffsets;
use crate::verbs::{match_case, SentencePair};

/// Which positions of the patched activation are replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchSite {
    /// Only the verb token's row
    #[default]
    Verb,
    /// Every position where the aligned token IDs differ
    Differing,
    /// Every position of the aligned sequences
    All,
}

impl PatchSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchSite::Verb => "verb",
            PatchSite::Differing => "differing",
            PatchSite::All => "all",
        }
    }
}

impl fmt::Display for PatchSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchSite {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "verb" => Ok(PatchSite::Verb),
            "differing" | "diff" => Ok(PatchSite::Differing),
            "all" => Ok(PatchSite::All),
            other => Err(format!(
                "Unknown patch site '{other}' (expected verb, differing or all)"
            )),
        }
    }
}

/// Runner settings
#[derive(Debug, Clone, Default)]
pub struct PatchConfig {
    pub hook: HookPoint,
    pub site: PatchSite,
    /// Scan at most this many layers, starting from layer 0
    pub max_layers: Option<usize>,
}

impl PatchConfig {
    /// Reject settings whose layer sequence is constant by construction
    pub fn validate(&self) -> Result<()> {
        if self.hook == HookPoint::ResidPost && self.site == PatchSite::All {
            return Err(AgreementError::InvalidConfig(
                "patching resid-post at every position reproduces the correct run at every \
                 layer; use attn-z or the verb/differing site"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Next-token probabilities given the text before the verb
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrefixBaseline {
    pub p_actual: f32,
    pub p_wrong: f32,
    pub p_singular: f32,
    pub p_plural: f32,
}

/// Output of one patching run
#[derive(Debug, Clone, Serialize)]
pub struct PatchResult {
    pub prefix: PrefixBaseline,
    /// p(correct verb) at the readout position of the unpatched correct run
    pub clean_correct: f32,
    /// Same readout on the unpatched incorrect run
    pub clean_incorrect: f32,
    /// p(correct verb) after patching layer `i`, indexed by layer
    pub layer_probs: Vec<f32>,
    pub hook: HookPoint,
    /// Site actually patched; `verb` falls back to `differing` when the two
    /// sentences put the verb at different token indices
    pub site: PatchSite,
    /// Verb token index within the aligned sequences
    pub verb_position: Option<usize>,
    /// Token indices overwritten at every layer
    pub patched_positions: Vec<usize>,
    pub readout_position: usize,
    /// Length of the aligned sequences
    pub seq_len: usize,
    /// Whether either sentence exceeded the context window
    pub truncated: bool,
}

impl PatchResult {
    /// (layer, probability) pairs in layer order
    pub fn layers(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.layer_probs.iter().copied().enumerate()
    }
}

/// Correct and incorrect encodings cut to a common window
struct AlignedPair {
    good: EncodingWithOffsets,
    bad: EncodingWithOffsets,
    verb_position: Option<usize>,
    /// Indices where the aligned token IDs differ
    differing: Vec<usize>,
    truncated: bool,
}

/// Runs activation patching for one sentence pair
pub struct PatchingRunner<'a> {
    model: &'a AgreementModel,
    config: PatchConfig,
}

impl<'a> PatchingRunner<'a> {
    pub fn new(model: &'a AgreementModel, config: PatchConfig) -> Self {
        Self { model, config }
    }

    /// Number of layers the runner will scan
    pub fn layers_to_scan(&self) -> usize {
        let depth = self.model.n_layers();
        self.config
            .max_layers
            .map_or(depth, |max| max.clamp(1, depth.max(1)))
    }

    pub fn run(&self, pair: &SentencePair) -> Result<PatchResult> {
        self.config.validate()?;

        let model = self.model;
        let backend = model.backend();
        let hook = self.config.hook;

        let aligned = self.align(pair)?;
        let seq_len = aligned.good.len();
        let readout_position = seq_len - 1;

        if aligned.differing.is_empty() {
            warn!("Aligned sentences are identical, the verb was truncated away");
            return Err(AgreementError::VerbOutsideContext {
                n_ctx: model.n_ctx(),
            });
        }

        let (site, positions) = self.resolve_site(&aligned);

        let prefix = self.prefix_baseline(pair)?;

        // Readout target: the correct verb as it would follow other text
        let correct_token = model.word_token_id(pair.correct_form(), true)?;

        let good_ids = model.input_tensor(&aligned.good.ids)?;
        let bad_ids = model.input_tensor(&aligned.bad.ids)?;

        let (good_logits, cache) = backend
            .forward_with_cache(&good_ids, hook)
            .context("Clean run on the correct sentence failed")?;
        let bad_logits = backend
            .forward(&bad_ids)
            .context("Clean run on the incorrect sentence failed")?;

        let clean_correct = model.token_probs(&good_logits, readout_position, &[correct_token])?[0];
        let clean_incorrect = model.token_probs(&bad_logits, readout_position, &[correct_token])?[0];
        debug!("clean p(correct): correct run {clean_correct:.6}, incorrect run {clean_incorrect:.6}");

        let n_layers = self.layers_to_scan();
        let mut layer_probs = Vec::with_capacity(n_layers);
        for layer in 0..n_layers {
            let spec = PatchSpec {
                layer,
                hook,
                positions: PatchPositions::Specific(positions.clone()),
            };
            let logits = backend
                .forward_with_patch(&bad_ids, &spec, &cache)
                .with_context(|| format!("Patched run at layer {layer} failed"))?;
            let p = model.token_probs(&logits, readout_position, &[correct_token])?[0];
            debug!("layer {layer:02}: p(correct) = {p:.6}");
            layer_probs.push(p);
        }

        info!(
            "Patched {} layers at {} ({} site, {} of {} positions)",
            n_layers,
            hook,
            site,
            positions.len(),
            seq_len
        );

        Ok(PatchResult {
            prefix,
            clean_correct,
            clean_incorrect,
            layer_probs,
            hook,
            site,
            verb_position: aligned.verb_position,
            patched_positions: positions,
            readout_position,
            seq_len,
            truncated: aligned.truncated,
        })
    }

    /// Site and positions actually patched for this pair
    fn resolve_site(&self, aligned: &AlignedPair) -> (PatchSite, Vec<usize>) {
        match (self.config.site, aligned.verb_position) {
            (PatchSite::All, _) => (PatchSite::All, (0..aligned.good.len()).collect()),
            (PatchSite::Verb, Some(pos)) => (PatchSite::Verb, vec![pos]),
            (PatchSite::Verb, None) => {
                warn!(
                    "Verb token index differs between the sentences, patching the {} differing positions",
                    aligned.differing.len()
                );
                (PatchSite::Differing, aligned.differing.clone())
            }
            (PatchSite::Differing, _) => (PatchSite::Differing, aligned.differing.clone()),
        }
    }

    /// Tokenize both sentences and cut them to `min(len_good, len_bad, n_ctx)`
    /// from the start.
    fn align(&self, pair: &SentencePair) -> anyhow::Result<AlignedPair> {
        let n_ctx = self.model.n_ctx();
        let mut good = self.model.tokenize_with_offsets(&pair.correct)?;
        let mut bad = self.model.tokenize_with_offsets(&pair.incorrect)?;
        anyhow::ensure!(
            !good.is_empty() && !bad.is_empty(),
            "Sentence encodes to no tokens"
        );

        let verb_char = pair.verb_span.0;
        let verb_good = good.char_to_token(verb_char);
        let verb_bad = bad.char_to_token(verb_char);

        let truncated = good.len() > n_ctx || bad.len() > n_ctx;
        if truncated {
            warn!(
                "Input longer than the {n_ctx}-token context ({} / {} tokens), keeping the end",
                good.len(),
                bad.len()
            );
        }

        let len = good.len().min(bad.len()).min(n_ctx);
        let dropped_good = good.keep_last(len);
        let dropped_bad = bad.keep_last(len);

        // Both runs must put the verb at the same index for a row patch to make sense
        let verb_position = match (verb_good, verb_bad) {
            (Some(g), Some(b)) if g >= dropped_good && b >= dropped_bad => {
                let (g, b) = (g - dropped_good, b - dropped_bad);
                (g == b).then_some(g)
            }
            _ => None,
        };
        if let Some(pos) = verb_position {
            debug!("verb token {:?} at index {pos}", good.tokens[pos]);
        }

        let differing = good.differing_positions(&bad);

        Ok(AlignedPair {
            good,
            bad,
            verb_position,
            differing,
            truncated,
        })
    }

    /// Score the verb forms after `[BOS] + prefix`, keeping the prefix's last
    /// `n_ctx - 1` tokens
    fn prefix_baseline(&self, pair: &SentencePair) -> anyhow::Result<PrefixBaseline> {
        let model = self.model;
        let prefix = pair.prefix();

        let mut context: Vec<u32> = model.bos_token_id().into_iter().collect();
        let room = model.n_ctx().saturating_sub(context.len());
        if !prefix.is_empty() {
            let prefix_ids = model.encode(prefix)?;
            context.extend_from_slice(&prefix_ids[prefix_ids.len().saturating_sub(room)..]);
        }
        anyhow::ensure!(
            !context.is_empty(),
            "Nothing to score: empty prefix and no beginning-of-text token"
        );

        // Sentence-initial verbs are scored as written, mid-sentence ones in
        // their canonical lowercase form after a space.
        let leading_space = !prefix.is_empty();
        let form = |canonical: &str| {
            if leading_space {
                canonical.to_string()
            } else {
                match_case(canonical, &pair.actual)
            }
        };
        let verbs = pair.verb_pair;
        let token_ids = [
            model.word_token_id(&form(pair.correct_form()), leading_space)?,
            model.word_token_id(&form(pair.wrong_form()), leading_space)?,
            model.word_token_id(&form(verbs.singular), leading_space)?,
            model.word_token_id(&form(verbs.plural), leading_space)?,
        ];

        let probs = model.next_token_probs(&context, &token_ids)?;
        Ok(PrefixBaseline {
            p_actual: probs[0],
            p_wrong: probs[1],
            p_singular: probs[2],
            p_plural: probs[3],
        })
    }
}

/// Run patching on one pair with the given settings
pub fn run_patching(
    model: &AgreementModel,
    pair: &SentencePair,
    config: &PatchConfig,
) -> Result<PatchResult> {
    PatchingRunner::new(model, config.clone()).run(pair)
}
