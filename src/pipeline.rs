//! End-to-end analysis of one sentence
//!
//! detect → patch (on a blocking worker) → summarize → explain.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::{AgreementError, Result};
use crate::explain::{Explainer, Explanation};
use crate::model::AgreementModel;
use crate::patching::{run_patching, PatchConfig, PatchResult};
use crate::summary::{PatchSummary, Report};
use crate::verbs::{detect, Number, SentencePair, VerbPair};

/// Numeric outcome of one analysis, before any explanation
#[derive(Debug, Clone)]
pub struct Analysis {
    pub pair: SentencePair,
    pub result: PatchResult,
    pub summary: PatchSummary,
}

impl Analysis {
    pub fn report(&self) -> Report<'_> {
        Report {
            pair: &self.pair,
            result: &self.result,
            summary: &self.summary,
        }
    }
}

/// Body of a successful `/predict` response
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub model_id: String,
    pub sentence: String,
    pub incorrect_sentence: String,
    pub prefix: String,
    pub verb_pair: VerbPair,
    pub actual_verb: String,
    pub wrong_verb: String,
    pub number: Number,
    pub truncated: bool,
    pub patch: PatchResult,
    pub summary: PatchSummary,
    pub explanation: Option<String>,
    pub explanation_error: Option<String>,
}

/// Shared, read-only analysis pipeline
pub struct AgreementPipeline {
    model: Arc<AgreementModel>,
    patch: PatchConfig,
    explainer: Explainer,
}

impl AgreementPipeline {
    pub fn new(model: Arc<AgreementModel>, patch: PatchConfig, explainer: Explainer) -> Self {
        Self {
            model,
            patch,
            explainer,
        }
    }

    pub fn model(&self) -> &AgreementModel {
        &self.model
    }

    /// Detect, patch and summarize, without the explanation call
    pub async fn patch(&self, sentence: &str) -> Result<Analysis> {
        let pair = detect(sentence)?;
        info!(
            "Analyzing {:?}: {} -> {}",
            pair.correct, pair.actual, pair.wrong
        );

        let model = Arc::clone(&self.model);
        let config = self.patch.clone();
        let worker_pair = pair.clone();
        let result = tokio::task::spawn_blocking(move || run_patching(&model, &worker_pair, &config))
            .await
            .map_err(|e| AgreementError::Worker(e.to_string()))??;

        let summary = PatchSummary::from_result(&pair, &result)?;
        info!(
            "Best layer {} (p = {:.6}) over {} layers",
            summary.best_layer,
            summary.best_prob,
            result.layer_probs.len()
        );

        Ok(Analysis {
            pair,
            result,
            summary,
        })
    }

    /// Ask the explanation agent about a finished analysis
    pub async fn explain(&self, analysis: &Analysis) -> Explanation {
        self.explainer.explain(&analysis.summary).await
    }

    /// Full analysis; an explanation failure only fills `explanation_error`
    pub async fn analyze(&self, sentence: &str) -> Result<AnalysisResponse> {
        let analysis = self.patch(sentence).await?;
        let (explanation, explanation_error) = self.explain(&analysis).await.into_fields();

        let Analysis {
            pair,
            result,
            summary,
        } = analysis;

        Ok(AnalysisResponse {
            model_id: self.model.model_id().to_string(),
            prefix: pair.prefix().to_string(),
            sentence: pair.correct,
            incorrect_sentence: pair.incorrect,
            verb_pair: pair.verb_pair,
            actual_verb: pair.actual,
            wrong_verb: pair.wrong,
            number: pair.number,
            truncated: result.truncated,
            patch: result,
            summary,
            explanation,
            explanation_error,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::explain::{ChatProvider, ExplainError};
    use crate::model::tests::tiny_agreement_model;
    use async_trait::async_trait;

    pub(crate) struct FixedProvider(pub std::result::Result<&'static str, u16>);

    #[async_trait]
    impl ChatProvider for FixedProvider {
        fn id(&self) -> &'static str {
            "fixed"
        }

        async fn complete(
            &self,
            _system: &str,
            user: &str,
        ) -> std::result::Result<String, ExplainError> {
            assert!(user.contains("best_layer"));
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(status) => Err(ExplainError::ApiError {
                    status,
                    message: "unavailable".into(),
                }),
            }
        }
    }

    pub(crate) fn tiny_pipeline(explainer: Explainer) -> AgreementPipeline {
        AgreementPipeline::new(
            Arc::new(tiny_agreement_model()),
            PatchConfig::default(),
            explainer,
        )
    }

    #[tokio::test]
    async fn test_analyze_cat_has_fur() {
        let pipeline = tiny_pipeline(Explainer::with_provider(Box::new(FixedProvider(Ok(
            "Late layers carry number.",
        )))));
        let response = pipeline.analyze("The cat has fur.").await.unwrap();

        assert_eq!(response.verb_pair, VerbPair::new("has", "have"));
        assert_eq!(response.incorrect_sentence, "The cat have fur.");
        assert_eq!(response.prefix, "The cat");
        assert_eq!(response.patch.layer_probs.len(), pipeline.model().n_layers());
        assert!(response.summary.best_layer < pipeline.model().n_layers());
        assert_eq!(response.explanation.as_deref(), Some("Late layers carry number."));
        assert!(response.explanation_error.is_none());
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_numbers() {
        let pipeline = tiny_pipeline(Explainer::with_provider(Box::new(FixedProvider(Err(503)))));
        let response = pipeline.analyze("The dogs are big.").await.unwrap();

        assert_eq!(response.patch.layer_probs.len(), pipeline.model().n_layers());
        assert!(response.explanation.is_none());
        assert_eq!(
            response.explanation_error.as_deref(),
            Some("API error 503: unavailable")
        );
    }

    #[tokio::test]
    async fn test_unsupported_sentence() {
        let pipeline = tiny_pipeline(Explainer::disabled());
        let err = pipeline.analyze("The cat sat on a mat.").await.unwrap_err();
        assert!(matches!(err, AgreementError::UnsupportedVerb));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_report_from_analysis() {
        let pipeline = tiny_pipeline(Explainer::disabled());
        let analysis = pipeline.patch("The cat is old.").await.unwrap();
        let text = analysis.report().to_string();
        assert!(text.contains("Incorrect sentence: The cat are old."));
        assert!(text.contains(" layer 02: p(correct) = "));
    }
}
