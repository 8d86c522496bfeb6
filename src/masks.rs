//! Causal attention masks shared by every forward pass
//!
//! A patching run re-executes the same sentence once per layer, so the same
//! `(seq_len, device, dtype)` mask is requested many times per request.
//! Masks are memoized process-wide; a cached entry is a shallow clone
//! (Arc bump, no data copy).
//!
//! The server sees every input length up to the context window, so the memo
//! is bounded by bytes and evicts the oldest masks first.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::{HashMap, VecDeque};
use std::sync::{LazyLock, Mutex, MutexGuard};

/// Byte budget of the process-wide mask cache (64 MiB)
pub const MASK_CACHE_BUDGET: usize = 64 << 20;

type MaskKey = (usize, usize, DType);

/// Insertion-ordered mask memo with a byte budget
#[derive(Debug)]
struct MaskCache {
    entries: HashMap<MaskKey, Tensor>,
    order: VecDeque<MaskKey>,
    bytes: usize,
    budget: usize,
}

impl MaskCache {
    fn with_budget(budget: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            bytes: 0,
            budget,
        }
    }

    fn get(&self, key: &MaskKey) -> Option<Tensor> {
        self.entries.get(key).cloned()
    }

    /// Store a mask, evicting the oldest entries until it fits.
    /// Masks larger than the whole budget are not kept.
    fn insert(&mut self, key: MaskKey, mask: Tensor) {
        let size = tensor_bytes(&mask);
        if size > self.budget || self.entries.contains_key(&key) {
            return;
        }
        while self.bytes + size > self.budget {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.bytes -= tensor_bytes(&evicted);
            }
        }
        self.bytes += size;
        self.order.push_back(key);
        self.entries.insert(key, mask);
    }
}

fn tensor_bytes(t: &Tensor) -> usize {
    t.elem_count() * t.dtype().size_in_bytes()
}

/// Cache for causal masks indexed by (seq_len, device kind, dtype)
static CAUSAL_MASK_CACHE: LazyLock<Mutex<MaskCache>> =
    LazyLock::new(|| Mutex::new(MaskCache::with_budget(MASK_CACHE_BUDGET)));

/// Device kind used in the cache key (one device per kind is assumed)
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn lock_cache() -> Result<MutexGuard<'static, MaskCache>> {
    CAUSAL_MASK_CACHE
        .lock()
        .map_err(|e| anyhow::anyhow!("causal mask cache poisoned: {e}"))
}

fn build_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// Returns a tensor of shape `[1, 1, seq_len, seq_len]` holding `0.0` where
/// position `i` may attend to `j` (`j <= i`) and `-inf` elsewhere:
///
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Some(cached) = lock_cache()?.get(&cache_key) {
        return Ok(cached);
    }

    let mask_tensor = build_causal_mask(seq_len, device, dtype)?;
    lock_cache()?.insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}
