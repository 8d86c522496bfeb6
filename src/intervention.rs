//! Activation patching interventions
//!
//! A patch replaces one layer's activation at a named hook point with the
//! activation captured from another run of the model, then lets the forward
//! pass continue from the substituted value.
//!
//! ## Hook Points
//!
//! - **ResidPost**: output of the transformer block (residual stream after
//!   attention and MLP)
//! - **AttnZ**: merged per-head attention outputs, before the output projection
//!
//! ## Example
//!
//! ```ignore
//! use agreement_rs::{HookPoint, PatchSpec};
//!
//! // Replace the verb row of block 7's output with the clean run's row
//! let spec = PatchSpec::new(HookPoint::ResidPost).layer(7).position(verb_pos);
//! let logits = backend.forward_with_patch(&bad_ids, &spec, &clean_cache)?;
//! ```

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Where inside a block an activation is captured or replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPoint {
    /// Block output (residual stream after the block)
    #[default]
    ResidPost,
    /// Attention head outputs merged to `d_model`, before the output projection
    AttnZ,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::ResidPost => "resid-post",
            HookPoint::AttnZ => "attn-z",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "resid-post" | "resid" => Ok(HookPoint::ResidPost),
            "attn-z" | "z" => Ok(HookPoint::AttnZ),
            other => Err(format!(
                "unknown hook point '{other}' (expected 'resid-post' or 'attn-z')"
            )),
        }
    }
}

/// Token positions a patch overwrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchPositions {
    /// Every position of the sequence
    All,
    /// Specific positions only
    Specific(Vec<usize>),
}

/// A single-layer activation patch
#[derive(Debug, Clone)]
pub struct PatchSpec {
    /// Layer whose activation is replaced
    pub layer: usize,
    /// Hook point within that layer
    pub hook: HookPoint,
    /// Positions to replace
    pub positions: PatchPositions,
}

impl PatchSpec {
    /// Patch every position of layer 0 at `hook`; narrow it with the builders
    pub fn new(hook: HookPoint) -> Self {
        Self {
            layer: 0,
            hook,
            positions: PatchPositions::All,
        }
    }

    /// Set the target layer
    pub fn layer(mut self, layer: usize) -> Self {
        self.layer = layer;
        self
    }

    /// Restrict the patch to one position (may be called repeatedly)
    pub fn position(mut self, position: usize) -> Self {
        if let PatchPositions::Specific(positions) = &mut self.positions {
            positions.push(position);
        } else {
            self.positions = PatchPositions::Specific(vec![position]);
        }
        self
    }

    /// Patch every position
    pub fn all_positions(mut self) -> Self {
        self.positions = PatchPositions::All;
        self
    }

    /// Check if this layer is patched
    pub fn applies_to_layer(&self, layer: usize) -> bool {
        self.layer == layer
    }

    /// Validate the spec against model depth and sequence length
    pub fn validate(&self, n_layers: usize, seq_len: usize) -> Result<()> {
        if self.layer >= n_layers {
            anyhow::bail!(
                "Layer {} out of range (model has {n_layers} layers)",
                self.layer
            );
        }
        if let PatchPositions::Specific(positions) = &self.positions {
            if positions.is_empty() {
                anyhow::bail!("Patch has no positions");
            }
            for &p in positions {
                if p >= seq_len {
                    anyhow::bail!("Patch position {p} out of range (seq_len is {seq_len})");
                }
            }
        }
        Ok(())
    }
}

/// Overwrite rows of `target` with the same rows of `source`
///
/// `target` is `(1, seq_len, d_model)` as it flows through the model,
/// `source` is the cached `(seq_len, d_model)` activation of the other run.
pub fn apply_patch(target: &Tensor, source: &Tensor, positions: &PatchPositions) -> Result<Tensor> {
    let (_b, seq_len, d_model) = target.dims3()?;
    let (src_len, src_d) = source.dims2()?;
    anyhow::ensure!(
        src_len == seq_len && src_d == d_model,
        "Patch source shape ({src_len}, {src_d}) does not match target ({seq_len}, {d_model})"
    );
    let source = source.to_dtype(target.dtype())?.unsqueeze(0)?;

    let positions = match positions {
        PatchPositions::All => return Ok(source),
        PatchPositions::Specific(positions) => {
            let mut positions = positions.clone();
            positions.sort_unstable();
            positions.dedup();
            positions
        }
    };

    // Alternate untouched target segments with single source rows
    let mut pieces = Vec::with_capacity(positions.len() * 2 + 1);
    let mut cursor = 0;
    for &p in &positions {
        anyhow::ensure!(p < seq_len, "Patch position {p} out of range (seq_len is {seq_len})");
        if p > cursor {
            pieces.push(target.narrow(1, cursor, p - cursor)?);
        }
        pieces.push(source.narrow(1, p, 1)?);
        cursor = p + 1;
    }
    if cursor < seq_len {
        pieces.push(target.narrow(1, cursor, seq_len - cursor)?);
    }

    Ok(Tensor::cat(&pieces, 1)?)
}
