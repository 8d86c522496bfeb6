//! Result summaries and the plain-text report
//!
//! Turns the per-layer probabilities of a [`PatchResult`] into the compact
//! structure handed to the explanation agent: best layer, and the layers
//! whose patch restored the most probability to the correct verb.

use std::fmt;

use serde::Serialize;

use crate::error::{AgreementError, Result};
use crate::patching::{PatchResult, PrefixBaseline};
use crate::verbs::{SentencePair, VerbPair};

/// Layers listed in the summary, by decreasing restoration
pub const TOP_LAYERS: usize = 6;

/// Effect of patching a single layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LayerDelta {
    pub layer: usize,
    /// `patched_p - clean_incorrect`
    pub delta: f32,
    pub patched_p: f32,
}

/// Compact summary of one patching run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchSummary {
    pub verb_pair: VerbPair,
    pub actual: String,
    pub wrong: String,
    pub baseline: PrefixBaseline,
    pub clean_correct: f32,
    pub clean_incorrect: f32,
    pub best_layer: usize,
    pub best_prob: f32,
    pub top_layers: Vec<LayerDelta>,
}

impl PatchSummary {
    pub fn from_result(pair: &SentencePair, result: &PatchResult) -> Result<Self> {
        validate(result)?;

        let (best_layer, best_prob) = best_layer(&result.layer_probs)
            .ok_or_else(|| AgreementError::MalformedResult("no layers recorded".into()))?;

        let mut deltas = layer_deltas(result);
        deltas.sort_by(|a, b| b.delta.total_cmp(&a.delta).then(a.layer.cmp(&b.layer)));
        deltas.truncate(TOP_LAYERS);

        Ok(Self {
            verb_pair: pair.verb_pair,
            actual: pair.actual.clone(),
            wrong: pair.wrong.clone(),
            baseline: result.prefix,
            clean_correct: result.clean_correct,
            clean_incorrect: result.clean_incorrect,
            best_layer,
            best_prob,
            top_layers: deltas,
        })
    }
}

/// Index and value of the largest probability; ties go to the lowest layer
pub fn best_layer(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (layer, p)| match best {
            Some((_, best_p)) if p <= best_p => best,
            _ => Some((layer, p)),
        })
}

/// Per-layer restoration relative to the unpatched incorrect run
pub fn layer_deltas(result: &PatchResult) -> Vec<LayerDelta> {
    result
        .layers()
        .map(|(layer, patched_p)| LayerDelta {
            layer,
            delta: patched_p - result.clean_incorrect,
            patched_p,
        })
        .collect()
}

fn validate(result: &PatchResult) -> Result<()> {
    if result.layer_probs.is_empty() {
        return Err(AgreementError::MalformedResult("no layers recorded".into()));
    }
    let named = [
        ("clean_correct", result.clean_correct),
        ("clean_incorrect", result.clean_incorrect),
        ("p_actual", result.prefix.p_actual),
        ("p_wrong", result.prefix.p_wrong),
        ("p_singular", result.prefix.p_singular),
        ("p_plural", result.prefix.p_plural),
    ];
    for (name, p) in named {
        check_probability(name, p)?;
    }
    for (layer, p) in result.layers() {
        check_probability(&format!("layer {layer}"), p)?;
    }
    Ok(())
}

fn check_probability(name: &str, p: f32) -> Result<()> {
    if p.is_nan() || !(0.0..=1.0).contains(&p) {
        return Err(AgreementError::MalformedResult(format!(
            "{name} is not a probability: {p}"
        )));
    }
    Ok(())
}

/// Plain-text report of a run, one line per layer
pub struct Report<'a> {
    pub pair: &'a SentencePair,
    pub result: &'a PatchResult,
    pub summary: &'a PatchSummary,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Report {
            pair,
            result,
            summary,
        } = self;
        let base = &result.prefix;

        writeln!(f, "--- Summary ---")?;
        writeln!(f, "Sentence: {}", pair.correct)?;
        writeln!(f, "Prefix used: {:?}", pair.prefix())?;
        writeln!(
            f,
            "Verb pair (singular/plural): {}/{}",
            pair.verb_pair.singular, pair.verb_pair.plural
        )?;
        writeln!(f, "Actual verb: {}", pair.actual)?;
        writeln!(f, "Incorrect sentence: {}", pair.incorrect)?;
        if result.truncated {
            writeln!(f, "Note: input truncated to the last {} tokens", result.seq_len)?;
        }
        writeln!(f)?;
        writeln!(f, "Next-token probabilities after the prefix:")?;
        writeln!(f, " p(actual)   = {:.6}", base.p_actual)?;
        writeln!(f, " p(wrong)    = {:.6}", base.p_wrong)?;
        writeln!(f, " p(singular) = {:.6}", base.p_singular)?;
        writeln!(f, " p(plural)   = {:.6}", base.p_plural)?;
        writeln!(f)?;
        writeln!(f, "Clean p(correct) at the final token:")?;
        writeln!(f, " correct run   = {:.6}", result.clean_correct)?;
        writeln!(f, " incorrect run = {:.6}", result.clean_incorrect)?;
        writeln!(f)?;
        writeln!(
            f,
            "Layer-wise p(correct) after patching {} ({} site, {} layers)",
            result.hook,
            result.site,
            result.layer_probs.len()
        )?;
        for (layer, p) in result.layers() {
            writeln!(f, " layer {layer:02}: p(correct) = {p:.6}")?;
        }
        writeln!(f)?;
        writeln!(f, "Top layers by increase in p(correct):")?;
        for d in &summary.top_layers {
            writeln!(
                f,
                " layer {:02}: Δp = {:+.6} (patched p = {:.6})",
                d.layer, d.delta, d.patched_p
            )?;
        }
        write!(
            f,
            "Best layer: {:02} (p = {:.6})",
            summary.best_layer, summary.best_prob
        )
    }
}
