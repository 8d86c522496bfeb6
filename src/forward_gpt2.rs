//! GPT-2 forward pass with per-layer activation capture and patching
//!
//! Custom implementation that runs block-by-block so any block's
//! activation can be captured from one run and substituted into another.
//!
//! GPT-2 specifics compared to the rotary decoders:
//! - Learned absolute position embeddings (`wpe`)
//! - LayerNorm with bias instead of RMSNorm
//! - Fused QKV projection stored as `Conv1D` (weight is `[in, out]`)
//! - `gelu_new` (tanh approximation) MLP
//! - lm_head tied to the token embedding

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::init::{Init, DEFAULT_KAIMING_NORMAL};
use candle_nn::{embedding, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::cache::ActivationCache;
use crate::intervention::{apply_patch, HookPoint, PatchSpec};
use crate::masks::create_causal_mask;
use crate::model::PatchBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// What a forward pass does at hook points
enum Hook<'a> {
    /// Plain forward pass
    None,
    /// Record the activation of every block at this hook point
    Capture(HookPoint, &'a mut ActivationCache),
    /// Replace this block's activation with rows of the cached one
    Patch(&'a PatchSpec, &'a Tensor),
}

impl Hook<'_> {
    fn intercept(&mut self, point: HookPoint, activation: Tensor) -> Result<Tensor> {
        match self {
            Hook::Capture(hook, cache) if *hook == point => {
                cache.push(activation.clone())?;
                Ok(activation)
            }
            Hook::Patch(spec, source) if spec.hook == point => {
                apply_patch(&activation, *source, &spec.positions)
            }
            _ => Ok(activation),
        }
    }
}

/// `Conv1D` stores its weight transposed relative to `Linear`
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((in_dim, out_dim), "weight", DEFAULT_KAIMING_NORMAL)?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

/// Multi-head causal self-attention with fused QKV
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let hidden_size = config.n_embd;
        anyhow::ensure!(
            hidden_size % config.n_head == 0,
            "n_embd {hidden_size} is not divisible by n_head {}",
            config.n_head
        );
        let c_attn = conv1d(hidden_size, 3 * hidden_size, vb.pp("c_attn"))?;
        let c_proj = conv1d(hidden_size, hidden_size, vb.pp("c_proj"))?;

        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.n_head,
            head_dim: hidden_size / config.n_head,
            hidden_size,
        })
    }

    fn forward(&self, x: &Tensor, hook: &mut Hook) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * self.hidden_size, self.hidden_size)?
                .reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        // [b, heads, seq, head_dim] -> [b, seq, d_model]
        let z = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.hidden_size))?;
        let z = hook.intercept(HookPoint::AttnZ, z)?;

        Ok(self.c_proj.forward(&z)?)
    }
}

/// MLP block (c_fc -> gelu_new -> c_proj)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    c_fc: Linear,
    c_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            c_fc: conv1d(config.n_embd, config.inner_dim(), vb.pp("c_fc"))?,
            c_proj: conv1d(config.inner_dim(), config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

/// Single pre-norm transformer block
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: candle_nn::layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: candle_nn::layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(&self, x: &Tensor, hook: &mut Hook) -> Result<Tensor> {
        let h = self.ln_1.forward(x)?;
        let h = self.attn.forward(&h, hook)?;
        let x = (x + h)?;

        let h = self.ln_2.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        let x = (x + h)?;

        hook.intercept(HookPoint::ResidPost, x)
    }
}

/// Custom GPT-2 model with per-layer activation capture and patching
pub struct PatchGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Gpt2Config,
}

impl PatchGpt2 {
    /// Load model weights from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading GPT-2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab, {} context",
            config.n_layer, config.n_embd, config.vocab_size, config.n_positions
        );

        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;

        // SAFETY: the file is memory-mapped read-only and is not modified while the model lives
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };

        Self::new(config, vb)
    }

    /// Build the model from a config and a weight source
    ///
    /// Checkpoints saved from `GPT2LMHeadModel` nest every tensor under
    /// `transformer.`; the base `GPT2Model` checkpoint does not.
    pub fn new(config: Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.n_layer);
            }
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }

        let ln_f = candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config,
        })
    }

    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(seq_len > 0, "Empty input sequence");
        anyhow::ensure!(
            seq_len <= self.config.n_positions,
            "Sequence of {seq_len} tokens exceeds context of {}",
            self.config.n_positions
        );
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let tokens = self.wte.forward(input_ids)?;
        let positions = self.wpe.forward(&positions)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    fn run(&self, input_ids: &Tensor, mut hook: Hook) -> Result<Tensor> {
        let mut hidden = self.embed(input_ids)?;

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = match &mut hook {
                Hook::Patch(spec, _) if !spec.applies_to_layer(i) => {
                    block.forward(&hidden, &mut Hook::None)?
                }
                hook => block.forward(&hidden, hook)?,
            };
        }

        let hidden = self.ln_f.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    /// Forward pass returning logits `[batch, seq, vocab]`
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.run(input_ids, Hook::None)
    }

    /// Forward pass capturing every block's activation at `hook`
    pub fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hook: HookPoint,
    ) -> Result<(Tensor, ActivationCache)> {
        let mut cache = ActivationCache::with_capacity(hook, self.config.n_layer);
        let logits = self.run(input_ids, Hook::Capture(hook, &mut cache))?;
        Ok((logits, cache))
    }

    /// Forward pass with one block's activation replaced from `source`
    pub fn forward_with_patch(
        &self,
        input_ids: &Tensor,
        spec: &PatchSpec,
        source: &ActivationCache,
    ) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        spec.validate(self.config.n_layer, seq_len)?;
        anyhow::ensure!(
            source.hook() == spec.hook,
            "Patch targets {} but the cache holds {}",
            spec.hook,
            source.hook()
        );
        anyhow::ensure!(
            source.seq_len()? == seq_len,
            "Cache covers {} tokens but the input has {seq_len}",
            source.seq_len()?
        );
        let layer_source = source
            .get_layer(spec.layer)
            .ok_or_else(|| anyhow::anyhow!("Layer {} not in cache", spec.layer))?;

        self.run(input_ids, Hook::Patch(spec, layer_source))
    }
}

impl PatchBackend for PatchGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn n_ctx(&self) -> usize {
        self.config.n_positions
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward(input_ids)
    }

    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hook: HookPoint,
    ) -> Result<(Tensor, ActivationCache)> {
        self.forward_with_cache(input_ids, hook)
    }

    fn forward_with_patch(
        &self,
        input_ids: &Tensor,
        spec: &PatchSpec,
        source: &ActivationCache,
    ) -> Result<Tensor> {
        self.forward_with_patch(input_ids, spec, source)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 32,
            n_positions: 16,
            n_embd: 16,
            n_layer: 3,
            n_head: 2,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
        }
    }

    /// Randomly initialized GPT-2 small enough to run in unit tests
    pub(crate) fn tiny_model() -> PatchGpt2 {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PatchGpt2::new(tiny_config(), vb).unwrap()
    }

    fn ids(tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let model = tiny_model();
        let logits = model.forward(&ids(&[1, 2, 3, 4])).unwrap();
        assert_eq!(logits.dims(), &[1, 4, 32]);
        assert_eq!(PatchBackend::n_layers(&model), 3);
        assert_eq!(model.n_ctx(), 16);
    }

    #[test]
    fn test_cache_covers_every_layer() {
        let model = tiny_model();
        for hook in [HookPoint::ResidPost, HookPoint::AttnZ] {
            let (_, cache) = model.forward_with_cache(&ids(&[1, 2, 3]), hook).unwrap();
            assert_eq!(cache.n_layers(), 3);
            assert_eq!(cache.hook(), hook);
            assert_eq!(cache.get_layer(2).unwrap().dims(), &[3, 16]);
        }
    }

    #[test]
    fn test_capture_does_not_change_logits() {
        let model = tiny_model();
        let input = ids(&[5, 6, 7, 8]);
        let plain = model.forward(&input).unwrap();
        let (cached, _) = model.forward_with_cache(&input, HookPoint::AttnZ).unwrap();
        assert!(max_abs_diff(&plain, &cached) < 1e-6);
    }

    #[test]
    fn test_patch_last_block_output_restores_source_logits() {
        let model = tiny_model();
        let clean = ids(&[1, 2, 3, 4]);
        let corrupt = ids(&[1, 2, 9, 4]);

        let (clean_logits, cache) = model.forward_with_cache(&clean, HookPoint::ResidPost).unwrap();
        let spec = PatchSpec::new(HookPoint::ResidPost).layer(2);
        let patched = model.forward_with_patch(&corrupt, &spec, &cache).unwrap();

        assert!(max_abs_diff(&clean_logits, &patched) < 1e-5);
    }

    #[test]
    fn test_patch_only_affects_later_positions() {
        let model = tiny_model();
        let clean = ids(&[1, 2, 3, 4]);
        let corrupt = ids(&[1, 2, 9, 4]);

        let (_, cache) = model.forward_with_cache(&clean, HookPoint::AttnZ).unwrap();
        let corrupt_logits = model.forward(&corrupt).unwrap();
        let spec = PatchSpec::new(HookPoint::AttnZ).layer(1).position(2);
        let patched = model.forward_with_patch(&corrupt, &spec, &cache).unwrap();

        // Positions before the patched row cannot see it
        let before = max_abs_diff(
            &corrupt_logits.i((.., 0..2, ..)).unwrap(),
            &patched.i((.., 0..2, ..)).unwrap(),
        );
        assert!(before < 1e-6);
    }

    #[test]
    fn test_patch_rejects_mismatched_hook_and_layer() {
        let model = tiny_model();
        let input = ids(&[1, 2, 3]);
        let (_, cache) = model.forward_with_cache(&input, HookPoint::AttnZ).unwrap();

        let wrong_hook = PatchSpec::new(HookPoint::ResidPost).layer(0);
        assert!(model.forward_with_patch(&input, &wrong_hook, &cache).is_err());

        let wrong_layer = PatchSpec::new(HookPoint::AttnZ).layer(3);
        assert!(model.forward_with_patch(&input, &wrong_layer, &cache).is_err());

        // Cache from a 3-token run cannot patch a 4-token input
        let spec = PatchSpec::new(HookPoint::AttnZ).layer(0).position(0);
        assert!(model.forward_with_patch(&ids(&[1, 2, 3, 4]), &spec, &cache).is_err());
    }

    #[test]
    fn test_context_overflow_is_an_error() {
        let model = tiny_model();
        let too_long: Vec<u32> = (0..17).collect();
        assert!(model.forward(&ids(&too_long)).is_err());
    }
}
