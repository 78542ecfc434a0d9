use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::arithmetic::{AggregationMetadata, HomomorphicEngine};
use crate::error::{EngineError, EngineResult};
use crate::vault::CiphertextHandle;

/// Plaintext input owned by the caller until it is encrypted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComplianceMetric {
    pub category: String,
    pub value: f64,
    /// Falls back to the scorer's weight for the category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl ComplianceMetric {
    pub fn new(category: impl Into<String>, value: f64) -> Self {
        Self {
            category: category.into(),
            value,
            weight: None,
        }
    }

    pub fn weighted(category: impl Into<String>, value: f64, weight: f64) -> Self {
        Self {
            weight: Some(weight),
            ..Self::new(category, value)
        }
    }
}

pub fn default_category_weights() -> BTreeMap<String, f64> {
    [
        ("data_protection", 0.30),
        ("user_rights", 0.25),
        ("security", 0.25),
        ("documentation", 0.20),
    ]
    .into_iter()
    .map(|(category, weight)| (category.to_owned(), weight))
    .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptedScore {
    pub score: CiphertextHandle,
    /// One handle per input metric, in input order.
    pub inputs: Vec<CiphertextHandle>,
    pub metadata: AggregationMetadata,
}

/// Turns plaintext metrics into one encrypted weighted score.
pub struct ComplianceScorer {
    engine: Arc<HomomorphicEngine>,
    category_weights: BTreeMap<String, f64>,
}

impl ComplianceScorer {
    pub fn new(engine: Arc<HomomorphicEngine>) -> Self {
        Self {
            engine,
            category_weights: default_category_weights(),
        }
    }

    pub fn with_category_weight(mut self, category: impl Into<String>, weight: f64) -> Self {
        self.category_weights.insert(category.into(), weight);
        self
    }

    /// Weights for `metrics`, normalised to sum to one.
    pub fn resolve_weights(&self, metrics: &[ComplianceMetric]) -> EngineResult<Vec<f64>> {
        let raw = metrics
            .iter()
            .map(|metric| {
                let weight = metric
                    .weight
                    .or_else(|| self.category_weights.get(&metric.category).copied())
                    .ok_or_else(|| {
                        EngineError::InvalidParameters(format!("no weight for category `{}`", metric.category))
                    })?;
                if !weight.is_finite() || weight < 0.0 {
                    return Err(EngineError::InvalidParameters(format!(
                        "weight for `{}` must be finite and non-negative",
                        metric.category
                    )));
                }
                Ok(weight)
            })
            .collect::<EngineResult<Vec<f64>>>()?;
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return Err(EngineError::InvalidParameters("weights sum to zero".into()));
        }
        if (total - 1.0).abs() < 1e-9 {
            return Ok(raw);
        }
        Ok(raw.into_iter().map(|w| w / total).collect())
    }

    pub fn score_metrics(&self, metrics: &[ComplianceMetric]) -> EngineResult<EncryptedScore> {
        if metrics.is_empty() {
            return Err(EngineError::InvalidParameters("no metrics to score".into()));
        }
        let weights = self.resolve_weights(metrics)?;
        let inputs = metrics
            .iter()
            .map(|metric| self.engine.encrypt(&[metric.value]))
            .collect::<EngineResult<Vec<_>>>()?;
        let (score, metadata) = self.engine.weighted_aggregate(&inputs, &weights)?;
        info!(metrics = metrics.len(), %score, "compliance score computed");
        Ok(EncryptedScore {
            score,
            inputs,
            metadata,
        })
    }
}
