//! Versioned policy thresholds and severity classification over encrypted
//! values.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::comparison::{ComparisonOp, ComparisonOutcome, Operand, SecureComparator};
use crate::config::{load_document, ConfigError, ConfigFormat};
use crate::error::{EngineError, EngineResult};
use crate::vault::CiphertextHandle;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    HigherIsWorse,
    LowerIsWorse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricThresholds {
    pub warn: f64,
    pub critical: f64,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyThresholdTable {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub thresholds: BTreeMap<String, MetricThresholds>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub metric: String,
    pub severity: Severity,
    pub table: String,
    pub table_version: u32,
    pub comparisons: Vec<ComparisonOutcome>,
}

impl PolicyThresholdTable {
    pub fn load(path: &Path, format: ConfigFormat) -> Result<Self, ConfigError> {
        let table: Self = load_document(path, format)?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (metric, limits) in &self.thresholds {
            if !(limits.warn.is_finite() && limits.critical.is_finite()) {
                return Err(ConfigError::Validation(format!("{metric}: thresholds must be finite")));
            }
            let ordered = match limits.direction {
                Direction::HigherIsWorse => limits.warn <= limits.critical,
                Direction::LowerIsWorse => limits.warn >= limits.critical,
            };
            if !ordered {
                return Err(ConfigError::Validation(format!(
                    "{metric}: warn must come before critical"
                )));
            }
        }
        Ok(())
    }

    pub fn sample() -> Self {
        let thresholds = [
            (
                "risk_score",
                MetricThresholds {
                    warn: 50.0,
                    critical: 75.0,
                    direction: Direction::HigherIsWorse,
                },
            ),
            (
                "compliance_score",
                MetricThresholds {
                    warn: 80.0,
                    critical: 60.0,
                    direction: Direction::LowerIsWorse,
                },
            ),
        ]
        .into_iter()
        .map(|(metric, limits)| (metric.to_owned(), limits))
        .collect();
        Self {
            version: 1,
            name: "baseline".into(),
            thresholds,
        }
    }

    /// Severity of the encrypted `handle` for `metric`. Reaching a limit
    /// counts as crossing it; at most two comparisons are run.
    pub fn classify(
        &self,
        metric: &str,
        handle: CiphertextHandle,
        comparator: &SecureComparator,
    ) -> EngineResult<Classification> {
        let limits = self
            .thresholds
            .get(metric)
            .ok_or_else(|| EngineError::InvalidParameters(format!("no thresholds for metric `{metric}`")))?;
        // "Not below" (or "not above") the limit, so the tolerance band
        // around a limit counts as reaching it.
        let safe_side = match limits.direction {
            Direction::HigherIsWorse => ComparisonOp::Less,
            Direction::LowerIsWorse => ComparisonOp::Greater,
        };
        let mut comparisons = Vec::with_capacity(2);
        let critical = comparator.compare(handle, Operand::Plain(limits.critical), safe_side)?;
        let reached_critical = !critical.result;
        comparisons.push(critical);
        let severity = if reached_critical {
            Severity::High
        } else {
            let warn = comparator.compare(handle, Operand::Plain(limits.warn), safe_side)?;
            let reached_warn = !warn.result;
            comparisons.push(warn);
            if reached_warn {
                Severity::Medium
            } else {
                Severity::Low
            }
        };
        info!(metric, severity = ?severity, table = %self.name, version = self.version, "severity classified");
        Ok(Classification {
            metric: metric.to_owned(),
            severity,
            table: self.name.clone(),
            table_version: self.version,
            comparisons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_document;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_and_validates_tables() {
        let toml = r#"
            version = 3
            name = "gdpr"

            [thresholds.risk_score]
            warn = 40.0
            critical = 70.0

            [thresholds.consent_rate]
            warn = 90.0
            critical = 75.0
            direction = "lower-is-worse"
        "#;
        let table: PolicyThresholdTable = parse_document(toml, ConfigFormat::Toml).unwrap();
        table.validate().unwrap();
        assert_eq!(table.version, 3);
        assert_eq!(table.thresholds["risk_score"].direction, Direction::HigherIsWorse);
        assert_eq!(table.thresholds["consent_rate"].direction, Direction::LowerIsWorse);

        let mut broken = table.clone();
        broken.thresholds.insert(
            "x".into(),
            MetricThresholds {
                warn: 10.0,
                critical: 5.0,
                direction: Direction::HigherIsWorse,
            },
        );
        assert!(broken.validate().is_err());
        PolicyThresholdTable::sample().validate().unwrap();
    }
}
