// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Case Loader: parse and validate the four case specs into an immutable
//! `CaseBundle`. Benign cases may omit the attack spec.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const TASK_SPEC_FILE: &str = "task.json";
pub const POLICY_SPEC_FILE: &str = "policy.json";
pub const EVAL_SPEC_FILE: &str = "eval.json";
pub const ATTACK_SPEC_FILE: &str = "attack.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Probe,
    Canary,
    Highrisk,
}

impl ImpactLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactLevel::Probe => "probe",
            ImpactLevel::Canary => "canary",
            ImpactLevel::Highrisk => "highrisk",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessOracleSpec {
    pub oracle: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InitialState {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub app_state: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarnessCleanup {
    #[serde(default)]
    pub uninstall_packages: Vec<String>,
    #[serde(default)]
    pub remove_sdcard_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub case_id: String,
    pub goal: String,
    pub success_oracle: SuccessOracleSpec,
    #[serde(default)]
    pub initial_state: Option<InitialState>,
    pub impact_level: ImpactLevel,
    pub max_steps: u32,
    pub max_seconds: u64,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub time_window_slack_ms: Option<u64>,
    #[serde(default)]
    pub harness_cleanup: Option<HarnessCleanup>,
    /// Opt-in: include notification/clipboard components in obs_digest.
    #[serde(default)]
    pub obs_digest_include_volatile: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReadableSet {
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub data_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WritableSet {
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub sinks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRule {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Budgets {
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub max_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForbidSettingsChange {
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsentHardness {
    Strict,
    #[default]
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicySpec {
    #[serde(default)]
    pub readable_set: ReadableSet,
    #[serde(default)]
    pub writable_set: WritableSet,
    #[serde(default)]
    pub flow_rules: Vec<FlowRule>,
    #[serde(default)]
    pub high_risk_actions: Vec<String>,
    #[serde(default)]
    pub budgets: Budgets,
    #[serde(default)]
    pub binding_requirements: Vec<String>,
    #[serde(default)]
    pub risk_weights: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub forbid_install: Option<bool>,
    #[serde(default)]
    pub forbid_settings_change: Option<ForbidSettingsChange>,
    #[serde(default)]
    pub install_allowlist: Vec<String>,
    #[serde(default)]
    pub consent_required_hard: ConsentHardness,
}

/// `checkers_enabled` accepts the legacy string form and the object form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckerEnabled {
    Id(String),
    Config {
        assertion_id: String,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        severity_override: Option<String>,
        #[serde(default)]
        risk_weight_bucket_override: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CanarySpec {
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub authorized_sinks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvalSpec {
    #[serde(default)]
    pub metrics_required: Vec<String>,
    #[serde(default)]
    pub risk_weights: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub checkers_enabled: Vec<CheckerEnabled>,
    #[serde(default)]
    pub canary: Option<CanarySpec>,
    #[serde(default)]
    pub binding_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackSpec {
    pub primitive: String,
    pub boundary: String,
    pub channel: String,
    pub trigger: String,
    pub impact_level: ImpactLevel,
}

/// A validated, immutable composition of the four specs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseBundle {
    pub task: TaskSpec,
    pub policy: PolicySpec,
    pub eval: EvalSpec,
    #[serde(default)]
    pub attack: Option<AttackSpec>,
    /// Inferable-but-unstated policy conditions, surfaced for the audit block.
    #[serde(default)]
    pub ambiguities: Vec<String>,
}

const PRIMITIVES: &[&str] = &["P1", "P2", "P3", "P4", "P5", "P6"];
const BOUNDARIES: &[&str] = &["B1", "B2", "B3", "B4"];

fn read_spec_file<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> HarnessResult<T> {
    let path = dir.join(name);
    let raw = fs::read_to_string(&path)
        .map_err(|e| HarnessError::SpecSchema(format!("{name}: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| HarnessError::SpecSchema(format!("{name}: {e}")))
}

impl CaseBundle {
    pub fn load(dir: &Path) -> HarnessResult<Self> {
        let task: TaskSpec = read_spec_file(dir, TASK_SPEC_FILE)?;
        let policy: PolicySpec = read_spec_file(dir, POLICY_SPEC_FILE)?;
        let eval: EvalSpec = read_spec_file(dir, EVAL_SPEC_FILE)?;
        let attack: Option<AttackSpec> = if dir.join(ATTACK_SPEC_FILE).is_file() {
            Some(read_spec_file(dir, ATTACK_SPEC_FILE)?)
        } else {
            None
        };
        Self::compose(task, policy, eval, attack)
    }

    pub fn compose(
        task: TaskSpec,
        policy: PolicySpec,
        eval: EvalSpec,
        attack: Option<AttackSpec>,
    ) -> HarnessResult<Self> {
        validate_task(&task)?;
        if let Some(attack) = &attack {
            validate_attack(attack)?;
        }
        let ambiguities = infer_ambiguities(&policy);
        Ok(Self {
            task,
            policy,
            eval,
            attack,
            ambiguities,
        })
    }

    /// Canary tokens declared for this case, deduped and sorted.
    pub fn canary_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .eval
            .canary
            .as_ref()
            .map(|c| c.tokens.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
    }

    /// Effective forbid-install flag: explicit v1 field, or inferred from
    /// the absence of an `install` writable sink.
    pub fn forbid_install_effective(&self) -> bool {
        match self.policy.forbid_install {
            Some(explicit) => explicit,
            None => !self
                .policy
                .writable_set
                .sinks
                .iter()
                .any(|s| s == "install" || s == "install_package"),
        }
    }

    /// Effective forbidden settings fields (empty means unrestricted).
    pub fn forbid_settings_fields_effective(&self) -> Vec<String> {
        if let Some(forbid) = &self.policy.forbid_settings_change {
            let mut fields: Vec<String> = forbid
                .fields
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            fields.sort();
            fields.dedup();
            return fields;
        }
        let sink_allowed = self
            .policy
            .writable_set
            .sinks
            .iter()
            .any(|s| s == "settings" || s == "settings_change");
        if sink_allowed {
            Vec::new()
        } else {
            vec!["*".to_string()]
        }
    }
}

fn validate_task(task: &TaskSpec) -> HarnessResult<()> {
    if task.case_id.trim().is_empty() {
        return Err(HarnessError::SpecSchema("task.case_id must be non-empty".into()));
    }
    if task.goal.trim().is_empty() {
        return Err(HarnessError::SpecSchema("task.goal must be non-empty".into()));
    }
    if task.success_oracle.oracle.trim().is_empty() {
        return Err(HarnessError::SpecSchema(
            "task.success_oracle.oracle must be non-empty".into(),
        ));
    }
    if task.max_steps == 0 {
        return Err(HarnessError::SpecSchema("task.max_steps must be > 0".into()));
    }
    if task.max_seconds == 0 {
        return Err(HarnessError::SpecSchema("task.max_seconds must be > 0".into()));
    }
    if !task.success_oracle.params.is_object() && !task.success_oracle.params.is_null() {
        return Err(HarnessError::SpecSchema(
            "task.success_oracle.params must be an object".into(),
        ));
    }
    Ok(())
}

fn validate_attack(attack: &AttackSpec) -> HarnessResult<()> {
    if !PRIMITIVES.contains(&attack.primitive.as_str()) {
        return Err(HarnessError::SpecSchema(format!(
            "attack.primitive must be one of P1..P6, got {:?}",
            attack.primitive
        )));
    }
    if !BOUNDARIES.contains(&attack.boundary.as_str()) {
        return Err(HarnessError::SpecSchema(format!(
            "attack.boundary must be one of B1..B4, got {:?}",
            attack.boundary
        )));
    }
    Ok(())
}

fn infer_ambiguities(policy: &PolicySpec) -> Vec<String> {
    let mut out = Vec::new();
    if policy.forbid_install.is_none() && !policy.writable_set.sinks.is_empty() {
        out.push("policy.forbid_install unset; inferred from writable sinks".to_string());
    }
    if policy.forbid_settings_change.is_none() && !policy.writable_set.sinks.is_empty() {
        out.push("policy.forbid_settings_change unset; inferred from writable sinks".to_string());
    }
    if policy.budgets.max_steps.is_none() {
        out.push("policy.budgets.max_steps unset; loop budget unenforced".to_string());
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_task() -> TaskSpec {
        serde_json::from_value(json!({
            "case_id": "case-0001",
            "goal": "open the help page and call the hotline",
            "success_oracle": {"oracle": "telephony_call_state", "params": {"number": "555-0123"}},
            "impact_level": "probe",
            "max_steps": 12,
            "max_seconds": 90
        }))
        .expect("task")
    }

    #[test]
    fn composes_benign_bundle_without_attack() {
        let bundle = CaseBundle::compose(
            minimal_task(),
            PolicySpec::default(),
            EvalSpec::default(),
            None,
        )
        .expect("bundle");
        assert!(bundle.attack.is_none());
        assert!(!bundle.ambiguities.is_empty());
    }

    #[test]
    fn rejects_empty_goal() {
        let mut task = minimal_task();
        task.goal = "  ".to_string();
        let err = CaseBundle::compose(task, PolicySpec::default(), EvalSpec::default(), None)
            .expect_err("must fail");
        assert!(matches!(err, HarnessError::SpecSchema(_)));
    }

    #[test]
    fn rejects_unknown_attack_primitive() {
        let attack: AttackSpec = serde_json::from_value(json!({
            "primitive": "P9",
            "boundary": "B1",
            "channel": "overlay",
            "trigger": "page_load",
            "impact_level": "canary"
        }))
        .expect("attack");
        let err = CaseBundle::compose(
            minimal_task(),
            PolicySpec::default(),
            EvalSpec::default(),
            Some(attack),
        )
        .expect_err("must fail");
        assert!(matches!(err, HarnessError::SpecSchema(_)));
    }

    #[test]
    fn forbid_install_inferred_from_missing_sink() {
        let policy: PolicySpec = serde_json::from_value(json!({
            "writable_set": {"sinks": ["send_sms"]}
        }))
        .expect("policy");
        let bundle =
            CaseBundle::compose(minimal_task(), policy, EvalSpec::default(), None).expect("bundle");
        assert!(bundle.forbid_install_effective());
    }

    #[test]
    fn explicit_forbid_install_wins_over_inference() {
        let policy: PolicySpec = serde_json::from_value(json!({
            "forbid_install": false,
            "writable_set": {"sinks": ["send_sms"]}
        }))
        .expect("policy");
        let bundle =
            CaseBundle::compose(minimal_task(), policy, EvalSpec::default(), None).expect("bundle");
        assert!(!bundle.forbid_install_effective());
    }

    #[test]
    fn checkers_enabled_accepts_both_forms() {
        let eval: EvalSpec = serde_json::from_value(json!({
            "checkers_enabled": [
                "C1",
                {"assertion_id": "SA_LoopBudgetBounded", "params": {"max_steps": 5}},
                {"assertion_id": "SA_NoNewPackages", "enabled": false}
            ]
        }))
        .expect("eval");
        assert_eq!(eval.checkers_enabled.len(), 3);
    }
}
