// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trace-basics detectors: foreground sequence, step stats, action-evidence
//! level and environment profile.

use crate::context::CaseContext;
use crate::detector::Detector;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::pack::SealedPack;
use masbench_core::evidence::records::{AGENT_ACTION_TRACE, FOREGROUND_APP_TRACE};
use masbench_core::facts::{Fact, OracleSource};
use serde_json::{json, Value};

fn nonempty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub struct ForegroundSeqDetector;

impl Detector for ForegroundSeqDetector {
    fn detector_id(&self) -> &'static str {
        "foreground_seq"
    }

    fn extract(&self, pack: &SealedPack, _ctx: &CaseContext) -> HarnessResult<Vec<Fact>> {
        let lines = pack.read_jsonl(FOREGROUND_APP_TRACE)?;
        if lines.is_empty() && !pack.has_file(FOREGROUND_APP_TRACE) {
            return Ok(Vec::new());
        }

        let mut changes: Vec<Value> = Vec::new();
        let mut packages_all: Vec<String> = Vec::new();
        let mut refs: Vec<String> = vec![FOREGROUND_APP_TRACE.to_string()];
        let mut last_package: Option<String> = None;

        for (line_no, obj) in &lines {
            let Some(package) = nonempty_str(obj, "package") else {
                continue;
            };
            packages_all.push(package.clone());
            if last_package.as_deref() != Some(package.as_str()) {
                changes.push(json!({
                    "line": line_no,
                    "step_idx": obj.get("step_idx").and_then(Value::as_u64),
                    "package": package,
                    "activity": nonempty_str(obj, "activity"),
                }));
                refs.push(format!("{FOREGROUND_APP_TRACE}:L{line_no}"));
                last_package = Some(packages_all[packages_all.len() - 1].clone());
            }
        }

        let mut unique: Vec<String> = packages_all.clone();
        unique.sort();
        unique.dedup();

        Ok(vec![Fact::new(
            "fact.foreground_pkg_seq",
            OracleSource::DeviceQuery,
            refs,
            json!({
                "event_count": packages_all.len(),
                "change_count": changes.len(),
                "changes": changes,
                "unique_packages": unique,
                "first_package": packages_all.first(),
                "last_package": packages_all.last(),
            }),
        )])
    }
}

pub struct StepStatsDetector;

impl Detector for StepStatsDetector {
    fn detector_id(&self) -> &'static str {
        "step_stats"
    }

    fn extract(&self, pack: &SealedPack, _ctx: &CaseContext) -> HarnessResult<Vec<Fact>> {
        let summary = pack.summary();
        let mut facts = Vec::new();

        let steps_from_summary = summary
            .as_ref()
            .and_then(|s| s.get("steps_executed"))
            .and_then(Value::as_u64);
        let (step_count, source) = match steps_from_summary {
            Some(steps) => (Some(steps), "summary.json"),
            None => {
                let lines = pack.read_jsonl(AGENT_ACTION_TRACE)?;
                if pack.has_file(AGENT_ACTION_TRACE) {
                    (Some(lines.len() as u64), AGENT_ACTION_TRACE)
                } else {
                    (None, "")
                }
            }
        };
        if let Some(step_count) = step_count {
            facts.push(Fact::new(
                "fact.step_count",
                OracleSource::None,
                vec![source.to_string()],
                json!({ "step_count": step_count, "source": source }),
            ));
        }

        if let Some(duration_ms) = summary
            .as_ref()
            .and_then(|s| s.get("duration_ms"))
            .and_then(Value::as_u64)
        {
            facts.push(Fact::new(
                "fact.duration_ms",
                OracleSource::None,
                vec!["summary.json".to_string()],
                json!({ "duration_ms": duration_ms }),
            ));
        }
        Ok(facts)
    }
}

pub struct ActionEvidenceDetector;

impl Detector for ActionEvidenceDetector {
    fn detector_id(&self) -> &'static str {
        "action_evidence"
    }

    fn extract(&self, pack: &SealedPack, _ctx: &CaseContext) -> HarnessResult<Vec<Fact>> {
        let Some(manifest) = pack.run_manifest() else {
            return Ok(Vec::new());
        };
        let level = manifest
            .get("action_trace_level")
            .and_then(Value::as_str)
            .unwrap_or("none");
        let source = manifest
            .get("action_trace_source")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Ok(vec![Fact::new(
            "fact.action_evidence",
            OracleSource::None,
            vec!["run_manifest.json".to_string()],
            json!({
                "action_trace_level": level,
                "action_trace_source": source,
                "device_input_trace_present": pack.has_file("device_input_trace.jsonl"),
            }),
        )])
    }
}

pub struct EnvProfileDetector;

impl Detector for EnvProfileDetector {
    fn detector_id(&self) -> &'static str {
        "env_profile"
    }

    fn extract(&self, pack: &SealedPack, ctx: &CaseContext) -> HarnessResult<Vec<Fact>> {
        let manifest = pack.run_manifest();
        let field = |key: &str| -> Value {
            manifest
                .and_then(|m| m.get(key))
                .cloned()
                .unwrap_or(Value::Null)
        };
        Ok(vec![Fact::new(
            "fact.env_profile",
            OracleSource::None,
            vec!["run_manifest.json".to_string()],
            json!({
                "env_profile": ctx.env_profile,
                "availability": field("availability"),
                "execution_mode": field("execution_mode"),
                "eval_mode": field("eval_mode"),
                "guard_enforced": field("guard_enforced"),
                "evidence_trust_level": field("evidence_trust_level"),
                "oracle_source": field("oracle_source"),
            }),
        )])
    }
}
