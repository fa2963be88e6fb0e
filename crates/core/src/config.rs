//! Configuration management for QLAFS.
//!
//! Every section has defaults so a partial TOML file only needs to name the
//! values it overrides.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QlafsConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
    pub registry: RegistryConfig,
    pub transparency: TransparencyConfig,
    pub trust: TrustConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    /// Hex seed of the log signing key. A fresh key is generated when absent.
    pub log_signing_seed: Option<String>,
    /// Locally hosted validator committee
    pub validators: Vec<ValidatorSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub validator_id: String,
    /// Hex seed of the validator signing key
    pub seed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Maximum number of faulty validators tolerated (f)
    pub fault_tolerance: usize,
    /// Wall-clock deadline for each phase
    pub phase_timeout_ms: u64,
    /// View changes allowed before a proposal is aborted
    pub max_view_changes: u32,
    /// Attempts to hand a finalized verdict to the log
    pub sink_retry_attempts: u32,
    pub sink_retry_base_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub strike_threshold: u32,
    pub strike_window_ms: u64,
    pub suspicion_ttl_ms: u64,
    pub initial_reputation: f64,
    /// Reputation multiplier applied per strike
    pub strike_penalty: f64,
    /// Reputation gained per certificate a validator signs
    pub certificate_reward: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorKind {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransparencyConfig {
    pub store: StoreKind,
    pub sqlite_path: PathBuf,
    pub anchor: AnchorKind,
    pub anchor_path: PathBuf,
    /// Period of the seal-and-anchor job
    pub anchor_interval_ms: u64,
    pub anchor_retry_base_ms: u64,
    pub anchor_retry_max_ms: u64,
    pub anchor_max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustWeights {
    pub verification_history: f64,
    pub consensus_participation: f64,
    pub behavioral_consistency: f64,
    pub performance_metrics: f64,
    /// Penalty weight, excluded from the sum-to-one check
    pub security_incidents: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub weights: TrustWeights,
    /// Rejected verdicts at which the incident term saturates at 1.0
    pub incident_saturation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Fallback filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "qlafs-node-001".to_string(),
            log_signing_seed: None,
            validators: (1..=4)
                .map(|i| ValidatorSpec {
                    validator_id: format!("validator-{}", i),
                    seed: None,
                })
                .collect(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            fault_tolerance: 1,
            phase_timeout_ms: 2_000,
            max_view_changes: 3,
            sink_retry_attempts: 5,
            sink_retry_base_ms: 50,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strike_threshold: 3,
            strike_window_ms: 600_000, // 10 minutes
            suspicion_ttl_ms: 30_000,
            initial_reputation: 0.5,
            strike_penalty: 0.8,
            certificate_reward: 0.01,
        }
    }
}

impl Default for TransparencyConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            sqlite_path: PathBuf::from("data/transparency.db"),
            anchor: AnchorKind::Memory,
            anchor_path: PathBuf::from("data/anchors.jsonl"),
            anchor_interval_ms: 10_000,
            anchor_retry_base_ms: 200,
            anchor_retry_max_ms: 10_000,
            anchor_max_attempts: 5,
        }
    }
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            verification_history: 0.30,
            consensus_participation: 0.20,
            behavioral_consistency: 0.20,
            performance_metrics: 0.20,
            security_incidents: 0.10,
        }
    }
}

impl TrustWeights {
    /// Sum of the positive weights
    pub fn positive_sum(&self) -> f64 {
        self.verification_history
            + self.consensus_participation
            + self.behavioral_consistency
            + self.performance_metrics
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            weights: TrustWeights::default(),
            incident_saturation: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
        }
    }
}

impl ConsensusConfig {
    /// Matching votes required to advance or finalize (2f+1)
    pub fn quorum(&self) -> usize {
        2 * self.fault_tolerance + 1
    }

    /// Committee size needed to tolerate f faults (3f+1)
    pub fn min_committee(&self) -> usize {
        3 * self.fault_tolerance + 1
    }
}

impl QlafsConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    #[cfg(feature = "toml")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.consensus;
        // f = 0 is only meaningful for a single-validator dev setup
        if c.fault_tolerance == 0 && self.node.validators.len() > 1 {
            return Err(CoreError::Config(
                "consensus.fault_tolerance must be >= 1 with more than one validator".into(),
            ));
        }
        if c.phase_timeout_ms == 0 {
            return Err(CoreError::Config("consensus.phase_timeout_ms must be > 0".into()));
        }
        if c.sink_retry_attempts == 0 {
            return Err(CoreError::Config("consensus.sink_retry_attempts must be > 0".into()));
        }

        let r = &self.registry;
        if r.strike_threshold == 0 {
            return Err(CoreError::Config("registry.strike_threshold must be > 0".into()));
        }
        for (name, value) in [
            ("registry.initial_reputation", r.initial_reputation),
            ("registry.strike_penalty", r.strike_penalty),
            ("registry.certificate_reward", r.certificate_reward),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::Config(format!("{} must be in [0, 1], got {}", name, value)));
            }
        }

        let t = &self.transparency;
        if t.anchor_interval_ms == 0 || t.anchor_max_attempts == 0 {
            return Err(CoreError::Config(
                "transparency anchor interval and attempts must be > 0".into(),
            ));
        }
        if t.anchor_retry_base_ms > t.anchor_retry_max_ms {
            return Err(CoreError::Config(
                "transparency.anchor_retry_base_ms exceeds anchor_retry_max_ms".into(),
            ));
        }

        let w = &self.trust.weights;
        for value in [
            w.verification_history,
            w.consensus_participation,
            w.behavioral_consistency,
            w.performance_metrics,
            w.security_incidents,
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::Config(format!("trust weight {} outside [0, 1]", value)));
            }
        }
        if (w.positive_sum() - 1.0).abs() > 1e-9 {
            return Err(CoreError::Config(format!(
                "trust weights must sum to 1.0 (excluding security_incidents), got {}",
                w.positive_sum()
            )));
        }
        if self.trust.incident_saturation == 0 {
            return Err(CoreError::Config("trust.incident_saturation must be > 0".into()));
        }

        Ok(())
    }
}
