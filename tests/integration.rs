//! Integration tests for agreement-rs
//!
//! Note: Tests marked with #[ignore] require the GPT-2 checkpoint download.
//! Run them explicitly with: cargo test --ignored

use std::str::FromStr;
use std::sync::Arc;

use agreement_rs::{
    detect, run_patching, AgreementError, AgreementModel, AgreementPipeline, Explainer,
    Gpt2Config, HookPoint, PatchBackend, PatchConfig, PatchGpt2, PatchSite, PatchSummary,
    DEFAULT_MODEL_ID, VERB_PAIRS,
};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tokenizers::Tokenizer;

const WORDS: [&str; 24] = [
    "[UNK]", "<|endoftext|>", "The", "the", "cat", "cats", "has", "have", "fur", ".", "is", "are",
    "was", "were", "does", "do", "dog", "dogs", "old", "not", "run", "Is", "Are", "?",
];

/// Randomly initialized 2-layer GPT-2 with a word-level tokenizer
fn small_model() -> AgreementModel {
    let config: Gpt2Config = serde_json::from_value(serde_json::json!({
        "vocab_size": WORDS.len(),
        "n_positions": 12,
        "n_embd": 8,
        "n_layer": 2,
        "n_head": 2
    }))
    .unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backend = PatchGpt2::new(config, vb).unwrap();

    let vocab: serde_json::Map<String, serde_json::Value> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
        .collect();
    let tokenizer = Tokenizer::from_str(
        &serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
        })
        .to_string(),
    )
    .unwrap();

    AgreementModel::from_parts(Box::new(backend), tokenizer, Device::Cpu, "small-gpt2")
}

/// Verb swapping is its own inverse for every pair
#[test]
fn test_verb_pairs_swap_back() {
    for pair in VERB_PAIRS {
        let sentence = format!("The cat {} here", pair.singular);
        let flipped = detect(&sentence).unwrap();
        let back = detect(&flipped.incorrect).unwrap();
        assert_eq!(back.incorrect, sentence);
    }
}

/// Sentences without a table verb are rejected before any model work
#[test]
fn test_unsupported_sentences() {
    for sentence in ["", "Dogs bark.", "This island"] {
        assert!(matches!(
            detect(sentence),
            Err(AgreementError::UnsupportedVerb)
        ));
    }
}

/// Per-layer sequence covers the whole model, best layer in range
#[test]
fn test_patching_small_model() {
    let model = small_model();
    let pair = detect("The cats are old.").unwrap();
    let result = run_patching(&model, &pair, &PatchConfig::default()).unwrap();

    assert_eq!(result.layer_probs.len(), 2);
    assert!(result.layer_probs.iter().all(|p| (0.0..=1.0).contains(p)));

    let summary = PatchSummary::from_result(&pair, &result).unwrap();
    assert!(summary.best_layer < 2);
    assert_eq!(summary.best_prob, result.layer_probs[summary.best_layer]);
}

/// Capturing and patching with the same hook reproduces the clean run
#[test]
fn test_backend_full_patch_is_identity() {
    let model = small_model();
    let backend = model.backend();
    let ids = model.input_tensor(&model.encode("The dog has fur .").unwrap()).unwrap();

    let (clean, cache) = backend.forward_with_cache(&ids, HookPoint::AttnZ).unwrap();
    assert_eq!(cache.n_layers(), backend.n_layers());

    let spec = agreement_rs::PatchSpec::new(HookPoint::AttnZ).layer(1).all_positions();
    let patched = backend.forward_with_patch(&ids, &spec, &cache).unwrap();
    let diff: f32 = (clean - patched)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 1e-4);
}

/// The async pipeline works without an explanation provider
#[tokio::test]
async fn test_pipeline_without_provider() {
    let pipeline = AgreementPipeline::new(
        Arc::new(small_model()),
        PatchConfig {
            hook: HookPoint::AttnZ,
            site: PatchSite::All,
            max_layers: None,
        },
        Explainer::disabled(),
    );
    let response = pipeline.analyze("Is the cat old?").await.unwrap();

    assert_eq!(response.incorrect_sentence, "Are the cat old?");
    assert_eq!(response.patch.layer_probs.len(), 2);
    assert!(response.explanation.is_none());
    assert_eq!(
        response.explanation_error.as_deref(),
        Some("explanation provider not configured")
    );
}

/// Full-sequence resid-post patching is refused before any forward pass
#[test]
fn test_resid_post_all_positions_rejected() {
    let model = small_model();
    let pair = detect("The cats are old.").unwrap();
    let config = PatchConfig {
        hook: HookPoint::ResidPost,
        site: PatchSite::All,
        max_layers: None,
    };
    assert!(matches!(
        run_patching(&model, &pair, &config),
        Err(AgreementError::InvalidConfig(_))
    ));
}

/// Model-dependent test: GPT-2 loading
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    let model = AgreementModel::from_pretrained_with_device(DEFAULT_MODEL_ID, Some(true)).unwrap();
    assert_eq!(model.n_layers(), 12);
    assert_eq!(model.d_model(), 768);
}

/// Model-dependent test: end-to-end patching on GPT-2
#[test]
#[ignore = "requires model download"]
fn test_cat_has_fur_end_to_end() {
    let model = AgreementModel::from_pretrained_with_device(DEFAULT_MODEL_ID, Some(true)).unwrap();
    let pair = detect("The cat has fur.").unwrap();
    assert_eq!(pair.incorrect, "The cat have fur.");

    let result = run_patching(&model, &pair, &PatchConfig::default()).unwrap();
    assert_eq!(result.layer_probs.len(), 12);
    assert!(result.layer_probs.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(!result.truncated);

    let summary = PatchSummary::from_result(&pair, &result).unwrap();
    assert!(summary.best_layer < 12);
    // GPT-2 prefers "has" after "The cat"
    assert!(result.prefix.p_actual > result.prefix.p_wrong);
}

/// Model-dependent test: attn-z patched at every position
#[test]
#[ignore = "requires model download"]
fn test_attn_z_all_positions_end_to_end() {
    let model = AgreementModel::from_pretrained_with_device(DEFAULT_MODEL_ID, Some(true)).unwrap();
    let pair = detect("The keys to the cabinet are on the table.").unwrap();
    let config = PatchConfig {
        hook: HookPoint::AttnZ,
        site: PatchSite::All,
        max_layers: None,
    };
    let result = run_patching(&model, &pair, &config).unwrap();
    assert_eq!(result.layer_probs.len(), 12);
    assert_eq!(result.site, PatchSite::All);
}
