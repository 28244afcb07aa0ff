// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Oracle-event indexing and the typed-fact adapter registry.
//!
//! `OracleEventIndexDetector` emits one fact per `(oracle_name, phase)`
//! group with every event's decision, digest, preview and line reference.
//! `OracleTypedFactsDetector` dispatches on the oracle name and lifts the
//! last post-phase event into semantic facts.

use crate::context::CaseContext;
use crate::detector::Detector;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::pack::SealedPack;
use masbench_core::evidence::records::ORACLE_TRACE;
use masbench_core::facts::{Fact, OracleSource};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn line_ref(line_no: u64) -> String {
    format!("{ORACLE_TRACE}:L{line_no}")
}

fn event_str(event: &Value, key: &str) -> String {
    event
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn artifact_refs(event: &Value) -> Vec<String> {
    event
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|a| a.get("path").and_then(Value::as_str))
                .map(|p| format!("artifact:{p}"))
                .collect()
        })
        .unwrap_or_default()
}

/// Grouped oracle events: `(name, phase) -> [(line_no, event)]`, insertion
/// ordered within a group.
pub fn grouped_events(
    pack: &SealedPack,
) -> HarnessResult<BTreeMap<(String, String), Vec<(u64, Value)>>> {
    let mut groups: BTreeMap<(String, String), Vec<(u64, Value)>> = BTreeMap::new();
    for (line_no, event) in pack.read_jsonl(ORACLE_TRACE)? {
        let name = event_str(&event, "oracle_name");
        let phase = event_str(&event, "phase");
        if name.is_empty() || phase.is_empty() {
            continue;
        }
        groups.entry((name, phase)).or_default().push((line_no, event));
    }
    Ok(groups)
}

pub struct OracleEventIndexDetector;

impl Detector for OracleEventIndexDetector {
    fn detector_id(&self) -> &'static str {
        "oracle_event_index"
    }

    fn extract(&self, pack: &SealedPack, _ctx: &CaseContext) -> HarnessResult<Vec<Fact>> {
        let mut facts = Vec::new();
        for ((name, phase), events) in grouped_events(pack)? {
            let mut refs = vec![ORACLE_TRACE.to_string()];
            let mut entries = Vec::new();
            for (line_no, event) in &events {
                refs.push(line_ref(*line_no));
                refs.extend(artifact_refs(event));
                entries.push(json!({
                    "line": line_no,
                    "decision": event.get("decision").cloned().unwrap_or(Value::Null),
                    "result_digest": event_str(event, "result_digest"),
                    "result_preview": event.get("result_preview").cloned().unwrap_or(Value::Null),
                    "anti_gaming_notes": event.get("anti_gaming_notes").cloned().unwrap_or(Value::Null),
                    "missing_capabilities": event.get("missing_capabilities").cloned().unwrap_or(Value::Null),
                }));
            }
            facts.push(Fact::new(
                &format!("fact.oracle_event_index/{name}/{phase}"),
                OracleSource::DeviceQuery,
                refs,
                json!({
                    "oracle_name": name,
                    "phase": phase,
                    "event_count": entries.len(),
                    "events": entries,
                }),
            ));
        }
        Ok(facts)
    }
}

/// One typed-fact adapter: matches an oracle name and lifts the last post
/// event into zero or more semantic facts.
type AdapterFn = fn(&str, u64, &Value, &CaseContext) -> Vec<Fact>;

fn adapter_for(oracle_name: &str) -> Option<AdapterFn> {
    if oracle_name.ends_with("_provider") {
        return Some(provider_adapter);
    }
    match oracle_name {
        "sqlite_pull_query" | "root_sqlite" => Some(sqlite_adapter),
        "host_artifact_json" => Some(host_artifact_adapter),
        "network_receipt" | "network_proxy" => Some(network_adapter),
        "telephony_call_state" => Some(telephony_adapter),
        "resumed_activity" | "window_focus" => Some(resumed_activity_adapter),
        "settings_check" => Some(settings_check_adapter),
        "sdcard_json_receipt" | "notification_listener_receipt" | "clipboard_receipt" => {
            Some(receipt_adapter)
        }
        _ => None,
    }
}

fn decision_payload(event: &Value) -> Value {
    event.get("decision").cloned().unwrap_or(Value::Null)
}

fn preview_object(event: &Value) -> Map<String, Value> {
    event
        .get("result_preview")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn provider_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    let family = name.trim_end_matches("_provider");
    vec![Fact::new(
        &format!("fact.provider.{family}_activity_summary"),
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "match_count": preview.get("match_count").cloned().unwrap_or(Value::Null),
            "matches": preview.get("matches").cloned().unwrap_or(Value::Null),
            "window": preview.get("window").cloned().unwrap_or(Value::Null),
        }),
    )]
}

fn sqlite_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    vec![Fact::new(
        "fact.sqlite.query_result_summary",
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "row_count": preview.get("row_count").cloned().unwrap_or(Value::Null),
        }),
    )]
}

fn host_artifact_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    vec![Fact::new(
        "fact.receipt.host_artifact_summary",
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "match_count": preview.get("match_count").cloned().unwrap_or(Value::Null),
            "fields_ok": preview.get("fields_ok").cloned().unwrap_or(Value::Null),
            "sha256": preview.get("sha256").cloned().unwrap_or(Value::Null),
        }),
    )]
}

fn network_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    vec![Fact::new(
        "fact.receipt.network_summary",
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "request_count": preview.get("request_count").cloned().unwrap_or(Value::Null),
            "hit_count": preview.get("hit_count").cloned().unwrap_or(Value::Null),
            "token_hash": preview.get("token_hash").cloned().unwrap_or(Value::Null),
            "hits": preview.get("hits").cloned().unwrap_or(Value::Null),
        }),
    )]
}

fn telephony_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    vec![Fact::new(
        "fact.dumpsys.telephony_call_state",
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "call_state": preview.get("call_state").cloned().unwrap_or(Value::Null),
            "number_hashes": preview.get("number_hashes").cloned().unwrap_or(Value::Null),
        }),
    )]
}

fn resumed_activity_adapter(
    name: &str,
    line_no: u64,
    event: &Value,
    _ctx: &CaseContext,
) -> Vec<Fact> {
    let preview = preview_object(event);
    vec![Fact::new(
        "fact.system.resumed_activity",
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "resumed": preview
                .get("resumed")
                .or_else(|| preview.get("focus"))
                .cloned()
                .unwrap_or(Value::Null),
        }),
    )]
}

fn settings_check_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    let namespace = preview
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let key = preview.get("key").and_then(Value::as_str).unwrap_or("unknown");
    vec![Fact::new(
        &format!("fact.settings.check/{namespace}/{key}"),
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "namespace": namespace,
            "key": key,
            "pre_value": preview.get("pre_value").cloned().unwrap_or(Value::Null),
            "post_value": preview.get("post_value").cloned().unwrap_or(Value::Null),
        }),
    )]
}

fn receipt_adapter(name: &str, line_no: u64, event: &Value, _ctx: &CaseContext) -> Vec<Fact> {
    let preview = preview_object(event);
    vec![Fact::new(
        &format!("fact.receipt.{name}_summary"),
        OracleSource::DeviceQuery,
        vec![line_ref(line_no)],
        json!({
            "oracle_name": name,
            "decision": decision_payload(event),
            "preview": Value::Object(preview),
        }),
    )]
}

pub struct OracleTypedFactsDetector;

impl Detector for OracleTypedFactsDetector {
    fn detector_id(&self) -> &'static str {
        "oracle_typed_facts"
    }

    fn extract(&self, pack: &SealedPack, ctx: &CaseContext) -> HarnessResult<Vec<Fact>> {
        let groups = grouped_events(pack)?;
        let mut facts = Vec::new();
        let mut seen_ids = std::collections::BTreeSet::new();

        for ((name, phase), events) in &groups {
            if phase != "post" {
                continue;
            }
            let Some((line_no, event)) = events.last() else {
                continue;
            };
            if let Some(adapter) = adapter_for(name) {
                for fact in adapter(name, *line_no, event, ctx) {
                    if seen_ids.insert(fact.fact_id.clone()) {
                        facts.push(fact);
                    }
                }
            }
        }

        // The success-oracle verdict fact, consumed by SuccessOracleAssertion.
        let success_events = groups
            .get(&(ctx.success_oracle.clone(), "post".to_string()))
            .and_then(|events| events.last());
        if let Some((line_no, event)) = success_events {
            let decision = decision_payload(event);
            let success = decision.get("success").and_then(Value::as_bool);
            let conclusive = decision.get("conclusive").and_then(Value::as_bool);
            let verdict = match (success, conclusive) {
                (Some(true), Some(true)) => "pass",
                (Some(false), Some(true)) => "fail",
                _ => "inconclusive",
            };
            facts.push(Fact::new(
                "fact.task.success_oracle_decision",
                OracleSource::DeviceQuery,
                vec![line_ref(*line_no)],
                json!({
                    "oracle_name": ctx.success_oracle,
                    "decision": decision,
                    "verdict": verdict,
                }),
            ));
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapters_dispatch_on_oracle_name() {
        assert!(adapter_for("sms_provider").is_some());
        assert!(adapter_for("calllog_provider").is_some());
        assert!(adapter_for("sqlite_pull_query").is_some());
        assert!(adapter_for("telephony_call_state").is_some());
        assert!(adapter_for("settings_check").is_some());
        assert!(adapter_for("boot_health").is_none());
    }
}
