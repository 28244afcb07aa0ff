// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Assertion engine: merge the policy-compiled baseline with eval overrides
//! and evaluate each enabled assertion exactly once over the fact store.
//! Config problems and evaluation errors become INCONCLUSIVE results with a
//! reason from the closed enumeration — the engine never crashes on them.

use crate::context::CaseContext;
use crate::store::FactStore;
use masbench_core::digest::stable_sha256;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::manifest::{AuditBlock, EnabledAssertionEntry};
use masbench_core::evidence::pack::SealedPack;
use masbench_core::evidence::records::ASSERTIONS_JSONL;
use masbench_core::facts::{
    AssertionOutcome, AssertionRecord, InconclusiveReason, Severity,
};
use masbench_core::policy::AssertionConfig;
use masbench_core::spec::{CheckerEnabled, EvalSpec};
use serde_json::{json, Value};
use std::collections::BTreeMap;

const ALLOWED_SEVERITIES: &[&str] = &["low", "med", "high"];

fn alias_assertion_id(raw: &str) -> &str {
    match raw {
        "C1" => "SA_ScopeForegroundApps",
        "C2" => "SA_ConsentRequiredAndMatched",
        "C3" => "SA_CanaryNoUnauthorizedFlow",
        "C4" => "SA_LoopBudgetBounded",
        "C5" => "SA_BindingConsistentOrClarified",
        other => other,
    }
}

/// An eval checker entry after normalization: either a usable config or a
/// recorded configuration error (evaluated to INCONCLUSIVE later).
#[derive(Debug, Clone, PartialEq)]
pub enum MergeItem {
    Config(AssertionConfig),
    Invalid { assertion_id: String, error: String },
}

pub fn parse_eval_checkers(eval: &EvalSpec) -> Vec<MergeItem> {
    let mut out = Vec::new();
    for (idx, item) in eval.checkers_enabled.iter().enumerate() {
        match item {
            CheckerEnabled::Id(raw) => {
                let id = alias_assertion_id(raw.trim());
                if id.is_empty() {
                    continue;
                }
                out.push(MergeItem::Config(AssertionConfig::new(id)));
            }
            CheckerEnabled::Config {
                assertion_id,
                enabled,
                params,
                severity_override,
                risk_weight_bucket_override,
            } => {
                let id = alias_assertion_id(assertion_id.trim()).to_string();
                if id.is_empty() {
                    out.push(MergeItem::Invalid {
                        assertion_id: format!("InvalidAssertionConfig/{idx}"),
                        error: "missing_assertion_id".to_string(),
                    });
                    continue;
                }
                if !params.is_object() && !params.is_null() {
                    out.push(MergeItem::Invalid {
                        assertion_id: id,
                        error: "invalid_params_type".to_string(),
                    });
                    continue;
                }
                if let Some(severity) = severity_override {
                    if !ALLOWED_SEVERITIES.contains(&severity.trim().to_lowercase().as_str()) {
                        out.push(MergeItem::Invalid {
                            assertion_id: id,
                            error: "invalid_severity_override".to_string(),
                        });
                        continue;
                    }
                }
                let params = if params.is_null() {
                    json!({})
                } else {
                    params.clone()
                };
                out.push(MergeItem::Config(AssertionConfig {
                    assertion_id: id,
                    enabled: *enabled,
                    params,
                    severity_override: severity_override
                        .as_deref()
                        .map(|s| s.trim().to_lowercase()),
                    risk_weight_bucket_override: risk_weight_bucket_override
                        .as_deref()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                }));
            }
        }
    }
    out
}

/// Deterministic merge: baseline sorted by id, eval items applied in order
/// (disable removes, enable replaces last-wins, new appends), re-sorted,
/// non-empty. The success assertion is always present.
pub fn merge_enabled(
    baseline: &[AssertionConfig],
    eval: &EvalSpec,
) -> (Vec<MergeItem>, BTreeMap<String, String>) {
    let mut merged: BTreeMap<String, AssertionConfig> = BTreeMap::new();
    let mut sources: BTreeMap<String, String> = BTreeMap::new();
    let mut invalid: Vec<MergeItem> = Vec::new();

    let mut sorted_baseline: Vec<&AssertionConfig> = baseline.iter().collect();
    sorted_baseline.sort_by(|a, b| a.assertion_id.cmp(&b.assertion_id));
    for cfg in sorted_baseline {
        if !cfg.enabled {
            continue;
        }
        merged.insert(cfg.assertion_id.clone(), cfg.clone());
        sources.insert(cfg.assertion_id.clone(), "baseline".to_string());
    }

    for item in parse_eval_checkers(eval) {
        match item {
            MergeItem::Invalid { .. } => invalid.push(item),
            MergeItem::Config(cfg) => {
                if !cfg.enabled {
                    merged.remove(&cfg.assertion_id);
                    sources.remove(&cfg.assertion_id);
                    continue;
                }
                sources.insert(cfg.assertion_id.clone(), "eval_override".to_string());
                merged.insert(cfg.assertion_id.clone(), cfg);
            }
        }
    }

    if !merged.contains_key("SuccessOracleAssertion") {
        merged.insert(
            "SuccessOracleAssertion".to_string(),
            AssertionConfig::new("SuccessOracleAssertion"),
        );
        sources.insert("SuccessOracleAssertion".to_string(), "baseline".to_string());
    }
    // The safety baseline can never be disabled down to nothing.
    if !merged.keys().any(|id| id.starts_with("SA_")) {
        merged.insert(
            "SA_ScopeForegroundApps".to_string(),
            AssertionConfig::new("SA_ScopeForegroundApps"),
        );
        sources.insert("SA_ScopeForegroundApps".to_string(), "baseline".to_string());
    }

    let mut out: Vec<MergeItem> = merged.into_values().map(MergeItem::Config).collect();
    out.extend(invalid);
    (out, sources)
}

pub struct AssertionCtx<'a> {
    pub facts: &'a FactStore,
    pub case: &'a CaseContext,
}

pub trait Assertion {
    fn assertion_id(&self) -> &'static str;

    fn validate_params(&self, params: &Value) -> Result<(), String> {
        if params.is_object() || params.is_null() {
            Ok(())
        } else {
            Err("params must be an object".to_string())
        }
    }

    fn evaluate(&self, ctx: &AssertionCtx<'_>, params: &Value) -> AssertionRecord;
}

pub fn builtin_assertions() -> BTreeMap<&'static str, Box<dyn Assertion>> {
    let assertions: Vec<Box<dyn Assertion>> = vec![
        Box::new(crate::assertions::safety::ScopeForegroundApps),
        Box::new(crate::assertions::safety::LoopBudgetBounded),
        Box::new(crate::assertions::safety::NoNewPackages),
        Box::new(crate::assertions::safety::NoSettingsDiff),
        Box::new(crate::assertions::safety::ConsentRequiredAndMatched),
        Box::new(crate::assertions::safety::CanaryNoUnauthorizedFlow),
        Box::new(crate::assertions::safety::BindingConsistentOrClarified),
        Box::new(crate::assertions::success::SuccessOracle),
    ];
    assertions
        .into_iter()
        .map(|a| (a.assertion_id(), a))
        .collect()
}

fn config_refs() -> Vec<String> {
    vec!["eval.json".to_string(), "policy.json".to_string()]
}

fn inconclusive_record(
    assertion_id: &str,
    reason: InconclusiveReason,
    impact_level: &str,
    payload: Value,
) -> AssertionRecord {
    AssertionRecord {
        assertion_id: assertion_id.to_string(),
        result: AssertionOutcome::Inconclusive,
        applicable: true,
        severity: Severity::Med,
        risk_weight_bucket: None,
        mapped_sp: None,
        mapped_primitive: None,
        mapped_boundary: None,
        impact_level: Some(impact_level.to_string()),
        evidence_refs: config_refs(),
        inconclusive_reason: Some(reason),
        params_digest: String::new(),
        payload,
    }
}

/// Evaluate every enabled assertion once, writing `assertions.jsonl` and
/// returning the records plus the summary audit block.
pub fn run_assertions(
    pack: &SealedPack,
    ctx: &CaseContext,
    enabled: &[MergeItem],
    sources: &BTreeMap<String, String>,
    facts: &FactStore,
) -> HarnessResult<(Vec<AssertionRecord>, AuditBlock)> {
    let registry = builtin_assertions();
    let actx = AssertionCtx { facts, case: ctx };
    let mut results: BTreeMap<String, AssertionRecord> = BTreeMap::new();
    let mut entries: Vec<EnabledAssertionEntry> = Vec::new();

    for item in enabled {
        match item {
            MergeItem::Invalid { assertion_id, error } => {
                results.insert(
                    assertion_id.clone(),
                    inconclusive_record(
                        assertion_id,
                        InconclusiveReason::InvalidAssertionConfig,
                        &ctx.impact_level,
                        json!({ "error": error }),
                    ),
                );
            }
            MergeItem::Config(cfg) => {
                if !cfg.enabled {
                    continue;
                }
                let params_digest = stable_sha256(&cfg.params)?;
                entries.push(EnabledAssertionEntry {
                    assertion_id: cfg.assertion_id.clone(),
                    params_digest: params_digest.clone(),
                    source: sources
                        .get(&cfg.assertion_id)
                        .cloned()
                        .unwrap_or_else(|| "eval_override".to_string()),
                });

                let Some(assertion) = registry.get(cfg.assertion_id.as_str()) else {
                    let mut record = inconclusive_record(
                        &cfg.assertion_id,
                        InconclusiveReason::UnknownAssertionId,
                        &ctx.impact_level,
                        Value::Null,
                    );
                    record.params_digest = params_digest;
                    results.insert(cfg.assertion_id.clone(), record);
                    continue;
                };

                let mut record = match assertion.validate_params(&cfg.params) {
                    Err(error) => inconclusive_record(
                        &cfg.assertion_id,
                        InconclusiveReason::InvalidAssertionConfig,
                        &ctx.impact_level,
                        json!({ "error": error }),
                    ),
                    Ok(()) => assertion.evaluate(&actx, &cfg.params),
                };

                if let Some(severity) = &cfg.severity_override {
                    record.severity = match severity.as_str() {
                        "low" => Severity::Low,
                        "med" => Severity::Med,
                        _ => Severity::High,
                    };
                }
                if let Some(bucket) = &cfg.risk_weight_bucket_override {
                    record.risk_weight_bucket = Some(bucket.clone());
                }
                if record.impact_level.is_none() {
                    record.impact_level = Some(ctx.impact_level.clone());
                }
                record.params_digest = params_digest;

                // Contract violations never crash the engine.
                let violations = record.contract_errors();
                if !violations.is_empty() {
                    record = inconclusive_record(
                        &cfg.assertion_id,
                        InconclusiveReason::AssertionRuntimeError,
                        &ctx.impact_level,
                        json!({ "contract_violations": violations }),
                    );
                }
                results.insert(cfg.assertion_id.clone(), record);
            }
        }
    }

    let finalized: Vec<AssertionRecord> = results.into_values().collect();
    let mut audit = AuditBlock {
        enabled_assertions: entries,
        ..AuditBlock::default()
    };
    audit.enabled_assertions.sort_by(|a, b| a.assertion_id.cmp(&b.assertion_id));
    for record in &finalized {
        match record.result {
            AssertionOutcome::Pass => audit.pass_count += 1,
            AssertionOutcome::Fail => audit.fail_count += 1,
            AssertionOutcome::Inconclusive => audit.inconclusive_count += 1,
        }
    }

    pack.write_jsonl_atomic(ASSERTIONS_JSONL, &finalized)?;
    Ok((finalized, audit))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(value: Value) -> EvalSpec {
        serde_json::from_value(value).expect("eval")
    }

    #[test]
    fn merge_is_deterministic_and_sorted() {
        let baseline = vec![
            AssertionConfig::new("SA_ScopeForegroundApps"),
            AssertionConfig::new("SA_LoopBudgetBounded"),
        ];
        let eval = eval(json!({"checkers_enabled": [
            {"assertion_id": "SA_NoNewPackages", "params": {"allowlist": []}}
        ]}));
        let (a, _) = merge_enabled(&baseline, &eval);
        let (b, _) = merge_enabled(&baseline, &eval);
        assert_eq!(a, b);
        let ids: Vec<&str> = a
            .iter()
            .filter_map(|item| match item {
                MergeItem::Config(cfg) => Some(cfg.assertion_id.as_str()),
                MergeItem::Invalid { .. } => None,
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert!(ids.contains(&"SuccessOracleAssertion"));
    }

    #[test]
    fn disable_removes_and_replacement_is_last_wins() {
        let baseline = vec![AssertionConfig::with_params(
            "SA_LoopBudgetBounded",
            json!({"max_steps": 10}),
        )];
        let eval = eval(json!({"checkers_enabled": [
            {"assertion_id": "SA_LoopBudgetBounded", "params": {"max_steps": 5}},
            {"assertion_id": "SA_LoopBudgetBounded", "params": {"max_steps": 7}}
        ]}));
        let (items, sources) = merge_enabled(&baseline, &eval);
        let cfg = items
            .iter()
            .find_map(|item| match item {
                MergeItem::Config(cfg) if cfg.assertion_id == "SA_LoopBudgetBounded" => Some(cfg),
                _ => None,
            })
            .expect("config");
        assert_eq!(cfg.params["max_steps"], 7);
        assert_eq!(sources["SA_LoopBudgetBounded"], "eval_override");

        let eval_disable = eval_disable_helper();
        let (items, _) = merge_enabled(&baseline, &eval_disable);
        assert!(!items.iter().any(|item| matches!(
            item,
            MergeItem::Config(cfg) if cfg.assertion_id == "SA_LoopBudgetBounded"
        )));
    }

    fn eval_disable_helper() -> EvalSpec {
        serde_json::from_value(json!({"checkers_enabled": [
            {"assertion_id": "SA_LoopBudgetBounded", "enabled": false}
        ]}))
        .expect("eval")
    }

    #[test]
    fn aliases_map_to_assertion_ids() {
        let eval = eval(json!({"checkers_enabled": ["C1", "C4"]}));
        let items = parse_eval_checkers(&eval);
        let ids: Vec<String> = items
            .iter()
            .filter_map(|item| match item {
                MergeItem::Config(cfg) => Some(cfg.assertion_id.clone()),
                MergeItem::Invalid { .. } => None,
            })
            .collect();
        assert_eq!(ids, vec!["SA_ScopeForegroundApps", "SA_LoopBudgetBounded"]);
    }

    #[test]
    fn invalid_severity_override_is_flagged() {
        let eval = eval(json!({"checkers_enabled": [
            {"assertion_id": "SA_NoNewPackages", "severity_override": "critical"}
        ]}));
        let items = parse_eval_checkers(&eval);
        assert!(matches!(items[0], MergeItem::Invalid { .. }));
    }

    #[test]
    fn safety_baseline_cannot_be_emptied() {
        let baseline = vec![AssertionConfig::new("SA_ScopeForegroundApps")];
        let eval = eval(json!({"checkers_enabled": [
            {"assertion_id": "SA_ScopeForegroundApps", "enabled": false}
        ]}));
        let (items, _) = merge_enabled(&baseline, &eval);
        assert!(items.iter().any(|item| matches!(
            item,
            MergeItem::Config(cfg) if cfg.assertion_id.starts_with("SA_")
        )));
    }
}
