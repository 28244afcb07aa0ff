// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Run manifest, env capabilities and per-episode summary documents.
//! All three are written with a temp file + atomic rename.

use crate::caps::Capability;
use crate::error::HarnessResult;
use crate::facts::OracleSource;
use crate::profile::EnvProfile;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Runnable,
    AuditOnly,
    Unavailable,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    PlannerOnly,
    #[default]
    AgentDriven,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    #[default]
    Benign,
    Adversarial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuardUnenforcedReason {
    GuardDisabled,
    NotPlannerOnly,
    NotL0,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ActionTraceLevel {
    L0,
    L1,
    L2,
    #[default]
    #[serde(rename = "none")]
    None,
}

impl ActionTraceLevel {
    pub fn requires_device_input_trace(&self) -> bool {
        !matches!(self, ActionTraceLevel::None)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTrustLevel {
    TcbCaptured,
    AgentReported,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub run_id: String,
    pub case_id: String,
    pub env_profile: EnvProfile,
    pub availability: Availability,
    pub execution_mode: ExecutionMode,
    pub eval_mode: EvalMode,
    pub guard_enforced: bool,
    pub guard_unenforced_reason: Option<GuardUnenforcedReason>,
    pub action_trace_level: ActionTraceLevel,
    pub action_trace_source: String,
    pub evidence_trust_level: EvidenceTrustLevel,
    pub oracle_source: OracleSource,
    pub emulator_fingerprint: Option<String>,
    pub seed: u64,
    pub generator: String,
    pub obs_digest_version: String,
    /// Explicit per-profile system allowlist used by the scope check.
    pub system_internal_allowlist: Vec<String>,
}

impl RunManifest {
    /// Consistency rule: a manifest either claims guard enforcement or
    /// names why it was not enforced.
    pub fn contract_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.guard_enforced && self.guard_unenforced_reason.is_some() {
            errors.push("guard_unenforced_reason must be null when guard_enforced".to_string());
        }
        if !self.guard_enforced && self.guard_unenforced_reason.is_none() {
            errors.push("guard_unenforced_reason required when guard is unenforced".to_string());
        }
        if self.run_id.trim().is_empty() {
            errors.push("run_id must be non-empty".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvCapabilities {
    pub schema_version: String,
    pub probed_at_ms: u64,
    pub capabilities: BTreeMap<String, bool>,
}

impl EnvCapabilities {
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.get(cap.as_str()).copied().unwrap_or(false)
    }

    pub fn set(&mut self, cap: Capability, available: bool) {
        self.capabilities.insert(cap.as_str().to_string(), available);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OracleDecision {
    Pass,
    Fail,
    Inconclusive,
    NotApplicable,
}

/// `task_success` is strict: pass maps to true, fail to false, anything
/// else is "unknown" — never a guessed boolean.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskSuccess {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
    #[serde(rename = "unknown")]
    Unknown,
}

impl TaskSuccess {
    pub fn from_decision(decision: OracleDecision) -> Self {
        match decision {
            OracleDecision::Pass => TaskSuccess::True,
            OracleDecision::Fail => TaskSuccess::False,
            OracleDecision::Inconclusive | OracleDecision::NotApplicable => TaskSuccess::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TaskFailed,
    AgentFailed,
    OracleInconclusive,
    InfraFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnabledAssertionEntry {
    pub assertion_id: String,
    pub params_digest: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditBlock {
    pub enabled_assertions: Vec<EnabledAssertionEntry>,
    pub pass_count: u32,
    pub fail_count: u32,
    pub inconclusive_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub schema_version: String,
    pub case_id: String,
    pub episode_id: String,
    pub oracle_decision: OracleDecision,
    pub task_success: TaskSuccess,
    pub failure_class: Option<FailureClass>,
    pub reason: String,
    pub steps_executed: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub audit: Option<AuditBlock>,
    #[serde(default)]
    pub ambiguities: Vec<String>,
}

/// Canonical write with temp file + atomic rename.
pub fn write_json_atomic(path: &Path, value: &impl Serialize) -> HarnessResult<()> {
    let bytes = crate::digest::canonical_json(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json_object(path: &Path) -> HarnessResult<Value> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> RunManifest {
        RunManifest {
            schema_version: "v0".to_string(),
            run_id: "run-1".to_string(),
            case_id: "case-1".to_string(),
            env_profile: EnvProfile::MasCore,
            availability: Availability::Runnable,
            execution_mode: ExecutionMode::AgentDriven,
            eval_mode: EvalMode::Benign,
            guard_enforced: true,
            guard_unenforced_reason: None,
            action_trace_level: ActionTraceLevel::L0,
            action_trace_source: "engine_executor".to_string(),
            evidence_trust_level: EvidenceTrustLevel::TcbCaptured,
            oracle_source: OracleSource::DeviceQuery,
            emulator_fingerprint: Some("emulator-5554/sdk_gphone64".to_string()),
            seed: 7,
            generator: "masbench".to_string(),
            obs_digest_version: "v1_sorted_components".to_string(),
            system_internal_allowlist: vec!["android".to_string()],
        }
    }

    #[test]
    fn manifest_guard_consistency_enforced() {
        let mut m = manifest();
        assert!(m.contract_errors().is_empty());
        m.guard_enforced = false;
        assert!(!m.contract_errors().is_empty());
        m.guard_unenforced_reason = Some(GuardUnenforcedReason::NotL0);
        assert!(m.contract_errors().is_empty());
    }

    #[test]
    fn task_success_mapping_is_strict() {
        assert_eq!(
            TaskSuccess::from_decision(OracleDecision::Pass),
            TaskSuccess::True
        );
        assert_eq!(
            TaskSuccess::from_decision(OracleDecision::Fail),
            TaskSuccess::False
        );
        assert_eq!(
            TaskSuccess::from_decision(OracleDecision::Inconclusive),
            TaskSuccess::Unknown
        );
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run_manifest.json");
        write_json_atomic(&path, &manifest()).expect("write");
        let value = read_json_object(&path).expect("read");
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["action_trace_level"], "L0");
    }
}
