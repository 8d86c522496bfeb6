//! AgreementModel wrapper for activation patching
//!
//! Pairs a frozen backend with its tokenizer and exposes the handful of
//! operations the patching runner needs: tokenization with offsets, verb
//! token lookup and next-token probabilities.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::cache::ActivationCache;
use crate::forward_gpt2::PatchGpt2;
use crate::intervention::{HookPoint, PatchSpec};
use crate::positioning::EncodingWithOffsets;

/// Default checkpoint
pub const DEFAULT_MODEL_ID: &str = "openai-community/gpt2";

/// Beginning/end-of-text marker of the GPT-2 vocabulary
const ENDOFTEXT: &str = "<|endoftext|>";

/// A frozen model that supports activation capture and single-layer patching.
///
/// Every method takes `&self`: weights are never mutated after loading, so one
/// backend can serve concurrent requests.
pub trait PatchBackend: Send + Sync {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    /// Maximum sequence length
    fn n_ctx(&self) -> usize;

    // --- Forward passes (all return logits `[batch, seq, vocab]`) ---
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hook: HookPoint,
    ) -> Result<(Tensor, ActivationCache)>;
    fn forward_with_patch(
        &self,
        input_ids: &Tensor,
        spec: &PatchSpec,
        source: &ActivationCache,
    ) -> Result<Tensor>;
}

/// High-level model wrapper used by the patching runner
pub struct AgreementModel {
    backend: Box<dyn PatchBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl AgreementModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let (device, dtype) = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::F32)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend = PatchGpt2::load(model_id, &device, dtype)?;

        Ok(Self::from_parts(
            Box::new(backend),
            tokenizer,
            device,
            model_id,
        ))
    }

    /// Assemble a model from an already-built backend and tokenizer
    pub fn from_parts(
        backend: Box<dyn PatchBackend>,
        tokenizer: Tokenizer,
        device: Device,
        model_id: &str,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            device,
            model_id: model_id.to_string(),
        }
    }

    /// Get the model ID
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The underlying backend
    pub fn backend(&self) -> &dyn PatchBackend {
        self.backend.as_ref()
    }

    /// Number of layers in the model
    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    /// Context window in tokens
    pub fn n_ctx(&self) -> usize {
        self.backend.n_ctx()
    }

    /// Tokenize text and return tokens with byte offsets
    pub fn tokenize_with_offsets(&self, text: &str) -> Result<EncodingWithOffsets> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        Ok(EncodingWithOffsets::new(
            encoding.get_ids().to_vec(),
            encoding.get_tokens().to_vec(),
            encoding.get_offsets().to_vec(),
        ))
    }

    /// Token IDs for text, without special tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.tokenize_with_offsets(text)?.ids)
    }

    /// First token of a word as the model would see it mid-sentence
    /// (`leading_space`) or at the start of the text.
    pub fn word_token_id(&self, word: &str, leading_space: bool) -> Result<u32> {
        let text = if leading_space {
            format!(" {word}")
        } else {
            word.to_string()
        };
        self.encode(&text)?
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("'{word}' encodes to no tokens"))
    }

    /// Beginning-of-text token, used as context for sentence-initial verbs
    pub fn bos_token_id(&self) -> Option<u32> {
        self.tokenizer.token_to_id(ENDOFTEXT)
    }

    /// Build a `[1, seq]` input tensor
    pub fn input_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    /// Next-token distribution at `position`, as f32 probabilities
    pub fn probs_at(&self, logits: &Tensor, position: usize) -> Result<Tensor> {
        let seq_len = logits.dim(1)?;
        anyhow::ensure!(
            position < seq_len,
            "Readout position {position} out of range (seq_len={seq_len})"
        );
        let logits = logits.i((0, position))?.to_dtype(DType::F32)?;
        Ok(candle_nn::ops::softmax_last_dim(&logits)?)
    }

    /// Probabilities of specific tokens at `position`, clamped to [0, 1]
    pub fn token_probs(&self, logits: &Tensor, position: usize, token_ids: &[u32]) -> Result<Vec<f32>> {
        let probs: Vec<f32> = self.probs_at(logits, position)?.to_vec1()?;
        token_ids
            .iter()
            .map(|&id| {
                probs
                    .get(id as usize)
                    .map(|p| p.clamp(0.0, 1.0))
                    .ok_or_else(|| anyhow::anyhow!("Token {id} outside vocabulary of {}", probs.len()))
            })
            .collect()
    }

    /// Next-token probabilities of `token_ids` after the whole of `context`
    pub fn next_token_probs(&self, context: &[u32], token_ids: &[u32]) -> Result<Vec<f32>> {
        anyhow::ensure!(!context.is_empty(), "Empty scoring context");
        let logits = self.backend.forward(&self.input_tensor(context)?)?;
        self.token_probs(&logits, context.len() - 1, token_ids)
    }
}
