// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::similar_names)] // related variables like `good_ids`/`bad_ids`
#![allow(clippy::module_name_repetitions)] // PatchSummary in summary.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns

//! agreement-rs: layer-wise activation patching for subject-verb agreement
//!
//! Given a sentence such as "The cat has fur.", builds its number-flipped
//! twin ("The cat have fur."), patches each GPT-2 block's activation from
//! the grammatical run into the ungrammatical one, and reports which layers
//! restore the correct verb. An optional chat model explains the result.
//!
//! ## Architecture
//!
//! - `verbs`: Verb-pair table and contrast-sentence detection
//! - `forward_gpt2`: GPT-2 forward pass with capture and patch hooks
//! - `model`: AgreementModel wrapper (backend + tokenizer + probabilities)
//! - `cache`: ActivationCache for storing one hook point across layers
//! - `masks`: Cached causal attention masks
//! - `positioning`: Byte offset ↔ token index conversion
//! - `intervention`: Hook points and single-layer patch specs
//! - `patching`: Layer-by-layer patching runner
//! - `summary`: Best layer, top deltas and the text report
//! - `explain`: Chat-completion explanation agent
//! - `pipeline`: detect → patch → summarize → explain
//! - `server`: axum HTTP surface

pub mod cache;
pub mod error;
pub mod explain;
pub mod forward_gpt2;
pub mod intervention;
pub mod masks;
pub mod model;
pub mod patching;
pub mod pipeline;
pub mod positioning;
pub mod server;
pub mod summary;
pub mod verbs;

pub use cache::ActivationCache;
pub use error::AgreementError;
pub use explain::{
    build_prompt, ChatProvider, ExplainError, Explainer, ExplainerConfig, Explanation,
    GroqProvider,
};
pub use forward_gpt2::{Gpt2Config, PatchGpt2};
pub use intervention::{apply_patch, HookPoint, PatchPositions, PatchSpec};
pub use masks::create_causal_mask;
pub use model::{AgreementModel, PatchBackend, DEFAULT_MODEL_ID};
pub use patching::{
    run_patching, PatchConfig, PatchResult, PatchSite, PatchingRunner, PrefixBaseline,
};
pub use pipeline::{AgreementPipeline, Analysis, AnalysisResponse};
pub use positioning::EncodingWithOffsets;
pub use server::{router, serve, ServerConfig};
pub use summary::{best_layer, LayerDelta, PatchSummary, Report};
pub use verbs::{detect, Number, SentencePair, VerbPair, VERB_PAIRS};
