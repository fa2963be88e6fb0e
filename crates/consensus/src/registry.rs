//! Validator Registry - consensus participants, reputation and eligibility
//!
//! The registry owns every [`Validator`] record. Status transitions are driven
//! only by fault reports and engine suspicion; callers never set a status
//! directly.
//!
//! # Status model
//!
//! - **Active**: eligible for the active set
//! - **Suspected**: the engine timed out waiting on this validator as leader.
//!   Excluded from the active set until the suspicion TTL lapses.
//! - **Blacklisted**: reached the strike threshold inside the rolling window.
//!   Reputation is frozen and only re-registration restores the validator.

use crate::error::{ConsensusError, Result};
use crate::message::{Phase, Vote};
use qlafs_core::{now_ms, PublicKeyBytes, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Registry shared between the engine and the coordinating node
pub type SharedRegistry = Arc<RwLock<ValidatorRegistry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    Active,
    Suspected,
    Blacklisted,
}

/// Evidence attached to a fault report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaultEvidence {
    /// Two conflicting votes for the same proposal, round and phase
    Equivocation { first: Vote, second: Vote },
    /// Vote whose signature did not verify
    InvalidSignature { proposal_id: String, round: u64, phase: Phase },
    /// Externally reported misbehaviour
    Reported { reason: String },
}

impl FaultEvidence {
    pub fn description(&self) -> String {
        match self {
            FaultEvidence::Equivocation { first, .. } => format!(
                "equivocation on {} round {} ({})",
                first.proposal_id, first.round, first.phase
            ),
            FaultEvidence::InvalidSignature {
                proposal_id,
                round,
                phase,
            } => format!("invalid signature on {} round {} ({})", proposal_id, round, phase),
            FaultEvidence::Reported { reason } => format!("reported: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strike {
    /// Unix milliseconds
    pub at: u64,
    pub evidence: FaultEvidence,
}

/// A consensus participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    pub validator_id: String,
    pub public_key: PublicKeyBytes,
    pub reputation_score: f64,
    pub status: ValidatorStatus,
    pub last_seen_round: u64,
    /// Unix milliseconds at which suspicion lapses
    pub suspected_until: Option<u64>,
    pub strikes: Vec<Strike>,
    pub registered_at: u64,
}

/// Member of an active-set snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMember {
    pub validator_id: String,
    pub public_key: PublicKeyBytes,
}

/// Counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub suspected: usize,
    pub blacklisted: usize,
}

/// Validator registry
#[derive(Debug)]
pub struct ValidatorRegistry {
    config: RegistryConfig,
    // BTreeMap keeps iteration ordered by validator id
    validators: BTreeMap<String, Validator>,
}

impl ValidatorRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            validators: BTreeMap::new(),
        }
    }

    pub fn shared(config: RegistryConfig) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(config)))
    }

    /// Register a validator.
    ///
    /// Re-registering an existing id replaces its key and resets its status,
    /// strikes and reputation. This is the only way out of the blacklist.
    pub fn register(&mut self, validator_id: &str, public_key: PublicKeyBytes) {
        let now = now_ms();
        let previous = self.validators.insert(
            validator_id.to_string(),
            Validator {
                validator_id: validator_id.to_string(),
                public_key,
                reputation_score: self.config.initial_reputation,
                status: ValidatorStatus::Active,
                last_seen_round: 0,
                suspected_until: None,
                strikes: Vec::new(),
                registered_at: now,
            },
        );
        match previous {
            Some(prev) => info!(
                validator_id = %validator_id,
                previous_status = ?prev.status,
                "Validator re-registered"
            ),
            None => info!(validator_id = %validator_id, "Validator registered"),
        }
    }

    pub fn deregister(&mut self, validator_id: &str) -> Result<Validator> {
        let removed = self
            .validators
            .remove(validator_id)
            .ok_or_else(|| ConsensusError::UnknownValidator(validator_id.to_string()))?;
        info!(validator_id = %validator_id, "Validator deregistered");
        Ok(removed)
    }

    /// Record a strike and return the resulting status
    pub fn report_fault(
        &mut self,
        validator_id: &str,
        evidence: FaultEvidence,
    ) -> Result<ValidatorStatus> {
        self.report_fault_at(validator_id, evidence, now_ms())
    }

    pub fn report_fault_at(
        &mut self,
        validator_id: &str,
        evidence: FaultEvidence,
        now: u64,
    ) -> Result<ValidatorStatus> {
        let config = &self.config;
        let validator = self
            .validators
            .get_mut(validator_id)
            .ok_or_else(|| ConsensusError::UnknownValidator(validator_id.to_string()))?;

        if validator.status == ValidatorStatus::Blacklisted {
            return Ok(ValidatorStatus::Blacklisted);
        }

        let window_start = now.saturating_sub(config.strike_window_ms);
        validator.strikes.retain(|s| s.at >= window_start);

        warn!(
            validator_id = %validator_id,
            fault = %evidence.description(),
            strikes = validator.strikes.len() + 1,
            "Fault reported"
        );
        validator.strikes.push(Strike { at: now, evidence });
        validator.reputation_score =
            (validator.reputation_score * config.strike_penalty).clamp(0.0, 1.0);

        if validator.strikes.len() >= config.strike_threshold as usize {
            validator.status = ValidatorStatus::Blacklisted;
            validator.suspected_until = None;
            warn!(
                validator_id = %validator_id,
                strikes = validator.strikes.len(),
                "Validator blacklisted"
            );
        }

        Ok(validator.status)
    }

    /// Mark a validator suspected after a view-change timeout
    pub fn suspect(&mut self, validator_id: &str, round: u64) -> Result<ValidatorStatus> {
        self.suspect_at(validator_id, round, now_ms())
    }

    pub fn suspect_at(&mut self, validator_id: &str, round: u64, now: u64) -> Result<ValidatorStatus> {
        let ttl = self.config.suspicion_ttl_ms;
        let validator = self
            .validators
            .get_mut(validator_id)
            .ok_or_else(|| ConsensusError::UnknownValidator(validator_id.to_string()))?;

        if validator.status != ValidatorStatus::Blacklisted {
            validator.status = ValidatorStatus::Suspected;
            validator.suspected_until = Some(now + ttl);
            info!(validator_id = %validator_id, round, ttl_ms = ttl, "Validator suspected");
        }
        Ok(validator.status)
    }

    /// Reward certificate signers and update their last seen round
    pub fn record_participation(&mut self, signers: &[String], round: u64) {
        let reward = self.config.certificate_reward;
        for id in signers {
            if let Some(validator) = self.validators.get_mut(id) {
                validator.last_seen_round = validator.last_seen_round.max(round);
                if validator.status != ValidatorStatus::Blacklisted {
                    validator.reputation_score = (validator.reputation_score + reward).min(1.0);
                }
            }
        }
    }

    /// Ordered snapshot of eligible validators
    pub fn active_set(&self) -> Vec<ActiveMember> {
        self.active_set_at(now_ms())
    }

    pub fn active_set_at(&self, now: u64) -> Vec<ActiveMember> {
        self.validators
            .values()
            .filter(|v| effective_status(v, now) == ValidatorStatus::Active)
            .map(|v| ActiveMember {
                validator_id: v.validator_id.clone(),
                public_key: v.public_key,
            })
            .collect()
    }

    /// Validator record with lapsed suspicion reported as active
    pub fn get(&self, validator_id: &str) -> Option<Validator> {
        let now = now_ms();
        self.validators.get(validator_id).map(|v| {
            let mut v = v.clone();
            v.status = effective_status(&v, now);
            v
        })
    }

    pub fn public_key(&self, validator_id: &str) -> Option<PublicKeyBytes> {
        self.validators.get(validator_id).map(|v| v.public_key)
    }

    pub fn reputation(&self, validator_id: &str) -> Option<f64> {
        self.validators.get(validator_id).map(|v| v.reputation_score)
    }

    pub fn status(&self, validator_id: &str) -> Option<ValidatorStatus> {
        let now = now_ms();
        self.validators
            .get(validator_id)
            .map(|v| effective_status(v, now))
    }

    pub fn list(&self) -> Vec<Validator> {
        let now = now_ms();
        self.validators
            .values()
            .map(|v| {
                let mut v = v.clone();
                v.status = effective_status(&v, now);
                v
            })
            .collect()
    }

    pub fn blacklisted(&self) -> Vec<String> {
        self.validators
            .values()
            .filter(|v| v.status == ValidatorStatus::Blacklisted)
            .map(|v| v.validator_id.clone())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let now = now_ms();
        let mut stats = RegistryStats {
            total: self.validators.len(),
            ..Default::default()
        };
        for validator in self.validators.values() {
            match effective_status(validator, now) {
                ValidatorStatus::Active => stats.active += 1,
                ValidatorStatus::Suspected => stats.suspected += 1,
                ValidatorStatus::Blacklisted => stats.blacklisted += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Suspicion expires lazily
fn effective_status(validator: &Validator, now: u64) -> ValidatorStatus {
    match (validator.status, validator.suspected_until) {
        (ValidatorStatus::Suspected, Some(until)) if until <= now => ValidatorStatus::Active,
        (status, _) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n: usize) -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new(RegistryConfig::default());
        for i in 1..=n {
            registry.register(&format!("validator-{}", i), [i as u8; 32]);
        }
        registry
    }

    fn reported(reason: &str) -> FaultEvidence {
        FaultEvidence::Reported {
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_active_set_is_ordered() {
        let mut registry = ValidatorRegistry::new(RegistryConfig::default());
        registry.register("validator-c", [3u8; 32]);
        registry.register("validator-a", [1u8; 32]);
        registry.register("validator-b", [2u8; 32]);

        let ids: Vec<_> = registry
            .active_set()
            .into_iter()
            .map(|m| m.validator_id)
            .collect();
        assert_eq!(ids, vec!["validator-a", "validator-b", "validator-c"]);
    }

    #[test]
    fn test_three_strikes_blacklist() {
        let mut registry = registry(4);
        let now = 1_000_000;

        assert_eq!(
            registry.report_fault_at("validator-2", reported("a"), now).unwrap(),
            ValidatorStatus::Active
        );
        registry.report_fault_at("validator-2", reported("b"), now + 1).unwrap();
        assert_eq!(
            registry.report_fault_at("validator-2", reported("c"), now + 2).unwrap(),
            ValidatorStatus::Blacklisted
        );

        assert_eq!(registry.active_set_at(now + 3).len(), 3);
        assert_eq!(registry.blacklisted(), vec!["validator-2"]);
    }

    #[test]
    fn test_strikes_outside_window_expire() {
        let mut registry = registry(1);
        let window = RegistryConfig::default().strike_window_ms;

        registry.report_fault_at("validator-1", reported("a"), 0).unwrap();
        registry.report_fault_at("validator-1", reported("b"), 1).unwrap();
        let status = registry
            .report_fault_at("validator-1", reported("c"), window + 10)
            .unwrap();
        assert_eq!(status, ValidatorStatus::Active);
    }

    #[test]
    fn test_reputation_frozen_when_blacklisted() {
        let mut registry = registry(1);
        for i in 0..3 {
            registry.report_fault_at("validator-1", reported("x"), i).unwrap();
        }
        let frozen = registry.reputation("validator-1").unwrap();
        registry.record_participation(&["validator-1".to_string()], 4);
        registry.report_fault_at("validator-1", reported("y"), 5).unwrap();
        assert_eq!(registry.reputation("validator-1").unwrap(), frozen);
    }

    #[test]
    fn test_reregistration_restores_blacklisted() {
        let mut registry = registry(1);
        for i in 0..3 {
            registry.report_fault_at("validator-1", reported("x"), i).unwrap();
        }
        assert_eq!(registry.status("validator-1"), Some(ValidatorStatus::Blacklisted));

        registry.register("validator-1", [9u8; 32]);
        assert_eq!(registry.status("validator-1"), Some(ValidatorStatus::Active));
        assert_eq!(registry.reputation("validator-1"), Some(0.5));
    }

    #[test]
    fn test_suspicion_expires_lazily() {
        let mut registry = registry(4);
        let ttl = RegistryConfig::default().suspicion_ttl_ms;

        registry.suspect_at("validator-1", 0, 100).unwrap();
        assert_eq!(registry.active_set_at(101).len(), 3);
        assert_eq!(registry.active_set_at(100 + ttl).len(), 4);
    }

    #[test]
    fn test_participation_reward_capped() {
        let mut registry = registry(1);
        let signers = vec!["validator-1".to_string()];
        for round in 0..200 {
            registry.record_participation(&signers, round);
        }
        assert_eq!(registry.reputation("validator-1"), Some(1.0));
        assert_eq!(registry.get("validator-1").unwrap().last_seen_round, 199);
    }

    #[test]
    fn test_unknown_validator() {
        let mut registry = registry(1);
        assert!(matches!(
            registry.report_fault("nobody", reported("x")),
            Err(ConsensusError::UnknownValidator(_))
        ));
        assert!(registry.deregister("nobody").is_err());
        assert!(registry.deregister("validator-1").is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stats() {
        let mut registry = registry(4);
        registry.suspect("validator-1", 0).unwrap();
        for _ in 0..3 {
            registry.report_fault("validator-2", reported("x")).unwrap();
        }
        let stats = registry.stats();
        assert_eq!(
            stats,
            RegistryStats {
                total: 4,
                active: 2,
                suspected: 1,
                blacklisted: 1
            }
        );
    }
}
