//! Activation cache for storing intermediate transformer states

use anyhow::Result;
use candle_core::Tensor;

use crate::intervention::HookPoint;

/// All-position activations captured at one hook point of every layer.
///
/// Each tensor has shape `(seq_len, d_model)`; index `i` holds layer `i`.
#[derive(Debug)]
pub struct ActivationCache {
    hook: HookPoint,
    activations: Vec<Tensor>,
}

impl ActivationCache {
    /// Create an empty cache with capacity for n_layers
    pub fn with_capacity(hook: HookPoint, n_layers: usize) -> Self {
        Self {
            hook,
            activations: Vec::with_capacity(n_layers),
        }
    }

    /// Hook point the activations were captured at
    pub fn hook(&self) -> HookPoint {
        self.hook
    }

    /// Add a layer's activation to the cache.
    ///
    /// Accepts `(seq_len, d_model)` or a batch of one, `(1, seq_len, d_model)`.
    pub fn push(&mut self, tensor: Tensor) -> Result<()> {
        let tensor = match tensor.rank() {
            2 => tensor,
            3 => {
                anyhow::ensure!(
                    tensor.dim(0)? == 1,
                    "Activation cache holds a single sequence, got batch of {}",
                    tensor.dim(0)?
                );
                tensor.squeeze(0)?
            }
            r => anyhow::bail!("Expected 2D or 3D activation, got {r}D"),
        };
        self.activations.push(tensor);
        Ok(())
    }

    /// Get the full activation tensor for a specific layer, shape `(seq_len, d_model)`
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.activations.get(layer)
    }

    /// Get the number of cached layers
    pub fn n_layers(&self) -> usize {
        self.activations.len()
    }

    /// Get the sequence length (from the first layer's tensor)
    pub fn seq_len(&self) -> Result<usize> {
        let first = self
            .activations
            .first()
            .ok_or_else(|| anyhow::anyhow!("Cache is empty"))?;
        Ok(first.dim(0)?)
    }
}
