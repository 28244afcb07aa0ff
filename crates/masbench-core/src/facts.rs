// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed facts and assertion results — the audit layer's data model.

use crate::digest::stable_sha256;
use crate::error::HarnessResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

pub const FACT_SCHEMA_VERSION: &str = "facts.v0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OracleSource {
    DeviceQuery,
    TrajectoryDeclared,
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub fact_id: String,
    pub schema_version: String,
    pub digest: String,
    pub oracle_source: OracleSource,
    pub evidence_refs: Vec<String>,
    pub payload: Value,
}

impl Fact {
    pub fn new(fact_id: &str, oracle_source: OracleSource, evidence_refs: Vec<String>, payload: Value) -> Self {
        Self {
            fact_id: fact_id.to_string(),
            schema_version: FACT_SCHEMA_VERSION.to_string(),
            digest: String::new(),
            oracle_source,
            evidence_refs,
            payload,
        }
    }

    /// Canonicalize refs and stamp the digest. Must be applied before a fact
    /// is written; replaying finalization is idempotent.
    pub fn finalize(mut self) -> HarnessResult<Self> {
        let refs: BTreeSet<String> = self
            .evidence_refs
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        self.evidence_refs = refs.into_iter().collect();
        self.digest = stable_sha256(&json!({
            "fact_id": self.fact_id,
            "schema_version": self.schema_version,
            "oracle_source": self.oracle_source,
            "evidence_refs": self.evidence_refs,
            "payload": self.payload,
        }))?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssertionOutcome {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "INCONCLUSIVE")]
    Inconclusive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Med,
    High,
}

/// Closed enumeration of reasons an assertion may be INCONCLUSIVE.
/// Serialized as the wire strings of the evidence pack contract
/// (`missing_fact:<fact_id>`, `missing_capability:<cap>`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InconclusiveReason {
    MissingFact(String),
    MissingDeviceInputTrace,
    MissingHostArtifacts,
    MissingOracleTrace,
    MissingEffectEvidence,
    MissingConsentTrace,
    MissingCanaryOrSinks,
    MissingBindingState,
    MissingPackageDiffEvidence,
    MissingSettingsDiffEvidence,
    MissingCapability(String),
    InvalidAssertionConfig,
    AssertionRuntimeError,
    NotApplicable,
    PolicyMissingBudget,
    UnknownAssertionId,
}

impl fmt::Display for InconclusiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconclusiveReason::MissingFact(id) => write!(f, "missing_fact:{id}"),
            InconclusiveReason::MissingDeviceInputTrace => write!(f, "missing_device_input_trace"),
            InconclusiveReason::MissingHostArtifacts => write!(f, "missing_host_artifacts"),
            InconclusiveReason::MissingOracleTrace => write!(f, "missing_oracle_trace"),
            InconclusiveReason::MissingEffectEvidence => write!(f, "missing_effect_evidence"),
            InconclusiveReason::MissingConsentTrace => write!(f, "missing_consent_trace"),
            InconclusiveReason::MissingCanaryOrSinks => write!(f, "missing_canary_or_sinks"),
            InconclusiveReason::MissingBindingState => write!(f, "missing_binding_state"),
            InconclusiveReason::MissingPackageDiffEvidence => {
                write!(f, "missing_package_diff_evidence")
            }
            InconclusiveReason::MissingSettingsDiffEvidence => {
                write!(f, "missing_settings_diff_evidence")
            }
            InconclusiveReason::MissingCapability(cap) => write!(f, "missing_capability:{cap}"),
            InconclusiveReason::InvalidAssertionConfig => write!(f, "invalid_assertion_config"),
            InconclusiveReason::AssertionRuntimeError => write!(f, "assertion_runtime_error"),
            InconclusiveReason::NotApplicable => write!(f, "not_applicable"),
            InconclusiveReason::PolicyMissingBudget => write!(f, "policy_missing_budget"),
            InconclusiveReason::UnknownAssertionId => write!(f, "unknown_assertion_id"),
        }
    }
}

impl InconclusiveReason {
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(id) = s.strip_prefix("missing_fact:") {
            return Some(InconclusiveReason::MissingFact(id.to_string()));
        }
        if let Some(cap) = s.strip_prefix("missing_capability:") {
            return Some(InconclusiveReason::MissingCapability(cap.to_string()));
        }
        match s {
            "missing_device_input_trace" => Some(InconclusiveReason::MissingDeviceInputTrace),
            "missing_host_artifacts" => Some(InconclusiveReason::MissingHostArtifacts),
            "missing_oracle_trace" => Some(InconclusiveReason::MissingOracleTrace),
            "missing_effect_evidence" => Some(InconclusiveReason::MissingEffectEvidence),
            "missing_consent_trace" => Some(InconclusiveReason::MissingConsentTrace),
            "missing_canary_or_sinks" => Some(InconclusiveReason::MissingCanaryOrSinks),
            "missing_binding_state" => Some(InconclusiveReason::MissingBindingState),
            "missing_package_diff_evidence" => Some(InconclusiveReason::MissingPackageDiffEvidence),
            "missing_settings_diff_evidence" => {
                Some(InconclusiveReason::MissingSettingsDiffEvidence)
            }
            "invalid_assertion_config" => Some(InconclusiveReason::InvalidAssertionConfig),
            "assertion_runtime_error" => Some(InconclusiveReason::AssertionRuntimeError),
            "not_applicable" => Some(InconclusiveReason::NotApplicable),
            "policy_missing_budget" => Some(InconclusiveReason::PolicyMissingBudget),
            "unknown_assertion_id" => Some(InconclusiveReason::UnknownAssertionId),
            _ => None,
        }
    }
}

impl Serialize for InconclusiveReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InconclusiveReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        InconclusiveReason::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown inconclusive_reason: {raw}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionRecord {
    pub assertion_id: String,
    pub result: AssertionOutcome,
    pub applicable: bool,
    pub severity: Severity,
    pub risk_weight_bucket: Option<String>,
    pub mapped_sp: Option<String>,
    pub mapped_primitive: Option<String>,
    pub mapped_boundary: Option<String>,
    pub impact_level: Option<String>,
    pub evidence_refs: Vec<String>,
    pub inconclusive_reason: Option<InconclusiveReason>,
    pub params_digest: String,
    #[serde(default)]
    pub payload: Value,
}

impl AssertionRecord {
    /// Serialization invariants: reason present iff INCONCLUSIVE; FAIL refs
    /// non-empty and line-localizing.
    pub fn contract_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self.result {
            AssertionOutcome::Inconclusive => {
                if self.inconclusive_reason.is_none() {
                    errors.push("INCONCLUSIVE requires inconclusive_reason".to_string());
                }
            }
            _ => {
                if self.inconclusive_reason.is_some() {
                    errors.push("inconclusive_reason must be null unless INCONCLUSIVE".to_string());
                }
            }
        }
        if self.result == AssertionOutcome::Fail {
            if self.evidence_refs.is_empty() {
                errors.push("FAIL requires at least one evidence_ref".to_string());
            } else if !self
                .evidence_refs
                .iter()
                .any(|r| r.contains(":L") || r.starts_with("artifact:"))
            {
                errors.push("FAIL requires a line-level or artifact evidence_ref".to_string());
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_finalize_sorts_and_dedups_refs() {
        let fact = Fact::new(
            "fact.step_count",
            OracleSource::None,
            vec![
                "summary.json".to_string(),
                " summary.json ".to_string(),
                "obs_trace.jsonl:L2".to_string(),
            ],
            json!({"step_count": 3}),
        )
        .finalize()
        .expect("finalize");
        assert_eq!(
            fact.evidence_refs,
            vec!["obs_trace.jsonl:L2".to_string(), "summary.json".to_string()]
        );
        assert!(!fact.digest.is_empty());
    }

    #[test]
    fn fact_finalize_is_idempotent() {
        let fact = Fact::new("fact.x", OracleSource::DeviceQuery, vec![], json!({"v": 1}))
            .finalize()
            .expect("first");
        let digest = fact.digest.clone();
        let again = fact.finalize().expect("second");
        assert_eq!(again.digest, digest);
    }

    #[test]
    fn reason_round_trips_through_strings() {
        let all = [
            InconclusiveReason::MissingFact("fact.package_diff".to_string()),
            InconclusiveReason::MissingDeviceInputTrace,
            InconclusiveReason::MissingCapability("root_shell".to_string()),
            InconclusiveReason::PolicyMissingBudget,
            InconclusiveReason::UnknownAssertionId,
        ];
        for reason in all {
            let s = reason.to_string();
            assert_eq!(InconclusiveReason::parse(&s), Some(reason));
        }
        assert_eq!(InconclusiveReason::parse("made_up_reason"), None);
    }

    #[test]
    fn fail_without_line_ref_violates_contract() {
        let record = AssertionRecord {
            assertion_id: "SA_NoNewPackages".to_string(),
            result: AssertionOutcome::Fail,
            applicable: true,
            severity: Severity::High,
            risk_weight_bucket: None,
            mapped_sp: None,
            mapped_primitive: None,
            mapped_boundary: None,
            impact_level: None,
            evidence_refs: vec!["oracle_trace.jsonl".to_string()],
            inconclusive_reason: None,
            params_digest: "d".repeat(64),
            payload: Value::Null,
        };
        assert!(!record.contract_errors().is_empty());
    }
}
