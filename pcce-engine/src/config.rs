use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use pcce_lattice::CkksParameters;
use pcce_telemetry::TelemetryConfig;
use pcce_zk::ProofScheme;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditAggregation;
use crate::psi::{EncodingScheme, RevealMode};
use crate::refresh::RefreshPolicy;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub psi: PsiSection,
    #[serde(default)]
    pub proof: ProofSection,
    #[serde(default)]
    pub comparison: ComparisonSection,
    #[serde(default)]
    pub workers: WorkerSection,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContextSection {
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_scaling_bits")]
    pub scaling_bits: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_ring_dimension")]
    pub min_ring_dimension: usize,
    #[serde(default)]
    pub refresh: RefreshPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuditSection {
    #[serde(default = "default_participants")]
    pub participants: usize,
    /// Explicit `t`; when absent it is derived from `threshold-ratio`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_round_deadline_ms")]
    pub round_deadline_ms: u64,
    #[serde(default = "default_deadline_extension_ms")]
    pub deadline_extension_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub aggregation: AuditAggregation,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PsiSection {
    #[serde(default)]
    pub encoding: EncodingScheme,
    #[serde(default)]
    pub reveal: RevealMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProofSection {
    #[serde(default)]
    pub scheme: ProofScheme,
    #[serde(default = "default_fixed_point_scale")]
    pub fixed_point_scale: u32,
    #[serde(default = "default_range_bits")]
    pub range_bits: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComparisonSection {
    /// Band around zero treated as equality.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerSection {
    /// Worker threads for lattice arithmetic; 0 uses every available core.
    #[serde(default)]
    pub pool_size: usize,
}

const fn default_depth() -> usize {
    3
}

const fn default_scaling_bits() -> u32 {
    40
}

const fn default_batch_size() -> usize {
    8
}

const fn default_min_ring_dimension() -> usize {
    8192
}

const fn default_participants() -> usize {
    5
}

const fn default_threshold_ratio() -> f64 {
    0.75
}

const fn default_pass_threshold() -> f64 {
    80.0
}

const fn default_round_deadline_ms() -> u64 {
    5_000
}

const fn default_deadline_extension_ms() -> u64 {
    2_500
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_fixed_point_scale() -> u32 {
    100
}

const fn default_range_bits() -> u32 {
    32
}

const fn default_tolerance() -> f64 {
    0.01
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            scaling_bits: default_scaling_bits(),
            batch_size: default_batch_size(),
            min_ring_dimension: default_min_ring_dimension(),
            refresh: RefreshPolicy::default(),
        }
    }
}

impl ContextSection {
    pub fn parameters(&self) -> CkksParameters {
        CkksParameters::new(self.depth, self.scaling_bits, self.batch_size)
            .with_min_ring_dimension(self.min_ring_dimension)
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            participants: default_participants(),
            threshold: None,
            threshold_ratio: default_threshold_ratio(),
            pass_threshold: default_pass_threshold(),
            round_deadline_ms: default_round_deadline_ms(),
            deadline_extension_ms: default_deadline_extension_ms(),
            max_retries: default_max_retries(),
            aggregation: AuditAggregation::default(),
        }
    }
}

impl AuditSection {
    /// `t` for the configured participant count.
    pub fn resolved_threshold(&self) -> usize {
        self.threshold
            .unwrap_or_else(|| (self.threshold_ratio * self.participants as f64).ceil() as usize)
    }
}

impl Default for ProofSection {
    fn default() -> Self {
        Self {
            scheme: ProofScheme::default(),
            fixed_point_scale: default_fixed_point_scale(),
            range_bits: default_range_bits(),
        }
    }
}

impl Default for ComparisonSection {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ctx = &self.context;
        if ctx.depth == 0 || ctx.depth > pcce_lattice::context::MAX_DEPTH {
            return Err(ConfigError::Validation(format!(
                "depth must be within 1..={}",
                pcce_lattice::context::MAX_DEPTH
            )));
        }
        if !(20..=50).contains(&ctx.scaling_bits) {
            return Err(ConfigError::Validation(
                "scaling bits must be within 20..=50".into(),
            ));
        }
        if ctx.batch_size == 0 || !ctx.batch_size.is_power_of_two() {
            return Err(ConfigError::Validation(
                "batch size must be a power of two".into(),
            ));
        }
        if !ctx.min_ring_dimension.is_power_of_two() {
            return Err(ConfigError::Validation(
                "minimum ring dimension must be a power of two".into(),
            ));
        }

        let audit = &self.audit;
        if audit.participants == 0 || audit.participants > u8::MAX as usize {
            return Err(ConfigError::Validation(
                "participant count must be within 1..=255".into(),
            ));
        }
        if audit.threshold.is_none()
            && !(audit.threshold_ratio > 0.0 && audit.threshold_ratio <= 1.0)
        {
            return Err(ConfigError::Validation(
                "threshold ratio must be within (0, 1]".into(),
            ));
        }
        let t = audit.resolved_threshold();
        if t == 0 || t > audit.participants {
            return Err(ConfigError::Validation(format!(
                "threshold {t} invalid for {} participants",
                audit.participants
            )));
        }
        if !audit.pass_threshold.is_finite() {
            return Err(ConfigError::Validation(
                "pass threshold must be finite".into(),
            ));
        }
        if audit.round_deadline_ms == 0 {
            return Err(ConfigError::Validation(
                "round deadline must be greater than zero".into(),
            ));
        }

        if self.proof.fixed_point_scale == 0 {
            return Err(ConfigError::Validation(
                "fixed-point scale must be greater than zero".into(),
            ));
        }
        if self.proof.range_bits == 0 || self.proof.range_bits > pcce_zk::range::MAX_RANGE_BITS {
            return Err(ConfigError::Validation(format!(
                "range bits must be within 1..={}",
                pcce_zk::range::MAX_RANGE_BITS
            )));
        }
        if !(self.comparison.tolerance.is_finite() && self.comparison.tolerance >= 0.0) {
            return Err(ConfigError::Validation(
                "comparison tolerance must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            audit: AuditSection {
                threshold: Some(3),
                ..AuditSection::default()
            },
            telemetry: TelemetryConfig::sample("pcce-engine"),
            ..Self::default()
        }
    }

    /// Sample configuration as TOML, as printed by `pcce sample-config`.
    pub fn sample_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::sample())
            .map_err(|err| ConfigError::Validation(err.to_string()))
    }
}

/// Reads and validates an engine configuration.
pub fn load_config(path: &Path, format: ConfigFormat) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = load_document(path, format)?;
    config.validate()?;
    Ok(config)
}

/// Reads any serde document (engine config, policy table) as TOML or YAML.
pub fn load_document<T: DeserializeOwned>(path: &Path, format: ConfigFormat) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(&contents, resolve_format(path, format))
}

pub fn parse_document<T: DeserializeOwned>(contents: &str, format: ConfigFormat) -> Result<T, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
