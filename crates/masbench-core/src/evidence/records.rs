// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed records for the schema'd JSONL trace files. Every line carries
//! `schema_version`; the writer rejects writes whose version does not match
//! the pack's declared version.

use crate::device::{CoordSpace, NormalizedAction};
use crate::digest::is_sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PACK_SCHEMA_VERSION: &str = "v0";

pub const OBS_TRACE: &str = "obs_trace.jsonl";
pub const AGENT_ACTION_TRACE: &str = "agent_action_trace.jsonl";
pub const DEVICE_INPUT_TRACE: &str = "device_input_trace.jsonl";
pub const ORACLE_TRACE: &str = "oracle_trace.jsonl";
pub const FOREGROUND_APP_TRACE: &str = "foreground_app_trace.jsonl";
pub const DEVICE_TRACE: &str = "device_trace.jsonl";
pub const SCREEN_TRACE: &str = "screen_trace.jsonl";
pub const CONFIRMATION_TRACE: &str = "confirmation_trace.jsonl";
pub const FACTS_JSONL: &str = "facts.jsonl";
pub const ASSERTIONS_JSONL: &str = "assertions.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ObsComponentDigests {
    pub screenshot_digest: Option<String>,
    pub ui_dump_digest: Option<String>,
    pub ui_elements_digest: Option<String>,
    pub foreground_digest: Option<String>,
    pub geometry_digest: Option<String>,
    pub notifications_digest: Option<String>,
    pub clipboard_digest: Option<String>,
}

impl ObsComponentDigests {
    /// Present component digests in sorted order, the input to `obs_digest`.
    pub fn present_sorted(&self) -> Vec<&str> {
        let mut out: Vec<&str> = [
            &self.screenshot_digest,
            &self.ui_dump_digest,
            &self.ui_elements_digest,
            &self.foreground_digest,
            &self.geometry_digest,
            &self.notifications_digest,
            &self.clipboard_digest,
        ]
        .into_iter()
        .filter_map(|d| d.as_deref())
        .collect();
        out.sort_unstable();
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObsRefs {
    pub screenshot: Option<String>,
    pub ui_dump: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsRecord {
    pub schema_version: String,
    pub step_idx: u32,
    pub ts_ms: u64,
    pub obs_digest: Option<String>,
    pub obs_digest_version: String,
    pub obs_component_digests: ObsComponentDigests,
    pub refs: ObsRefs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentActionRecord {
    pub schema_version: String,
    pub step_idx: u32,
    pub ts_ms: u64,
    pub raw_action: Value,
    pub normalized_action: Option<NormalizedAction>,
    pub ref_obs_digest: Option<String>,
    pub normalization_warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceLevel {
    L0,
    L1,
    L2,
}

impl SourceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLevel::L0 => "L0",
            SourceLevel::L1 => "L1",
            SourceLevel::L2 => "L2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPayload {
    pub coord_space: CoordSpace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInputRecord {
    pub schema_version: String,
    pub step_idx: u32,
    pub ref_step_idx: u32,
    pub source_level: SourceLevel,
    pub event_type: String,
    pub payload: InputPayload,
    pub timestamp_ms: u64,
    pub mapping_warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OracleType {
    Hard,
    Soft,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OraclePhase {
    Pre,
    Post,
}

impl OraclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            OraclePhase::Pre => "pre",
            OraclePhase::Post => "post",
        }
    }
}

/// `{success, conclusive, reason}` — the central oracle verdict. A
/// non-conclusive decision is promoted to `oracle_inconclusive` at the
/// episode level, never silently treated as failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub success: bool,
    pub score: f64,
    pub reason: String,
    pub conclusive: bool,
}

impl Decision {
    pub fn conclusive(success: bool, reason: impl Into<String>) -> Self {
        Self {
            success,
            score: if success { 1.0 } else { 0.0 },
            reason: reason.into(),
            conclusive: true,
        }
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            score: 0.0,
            reason: reason.into(),
            conclusive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OracleQuery {
    #[serde(rename = "type")]
    pub query_type: String,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl OracleQuery {
    pub fn has_locator(&self) -> bool {
        [&self.cmd, &self.sql, &self.path, &self.uri]
            .into_iter()
            .any(|loc| loc.as_deref().is_some_and(|s| !s.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleEventRecord {
    pub schema_version: String,
    pub ts_ms: u64,
    pub oracle_name: String,
    pub oracle_type: OracleType,
    pub phase: OraclePhase,
    pub queries: Vec<OracleQuery>,
    pub result_digest: String,
    #[serde(default)]
    pub result_preview: Value,
    pub decision: Decision,
    pub anti_gaming_notes: Vec<String>,
    pub capabilities_required: Vec<String>,
    #[serde(default)]
    pub missing_capabilities: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

/// OracleEvidence v0 contract check, applied by the writer before every
/// oracle_trace append.
pub fn oracle_event_errors(event: &OracleEventRecord) -> Vec<String> {
    let mut errors = Vec::new();
    if event.oracle_name.trim().is_empty() {
        errors.push("oracle_name must be a non-empty string".to_string());
    }
    if event.queries.is_empty() {
        errors.push("queries must be a non-empty list".to_string());
    }
    for (i, q) in event.queries.iter().enumerate() {
        if q.query_type.trim().is_empty() {
            errors.push(format!("queries[{i}].type must be a non-empty string"));
        }
        if !q.has_locator() {
            errors.push(format!("queries[{i}] must include one of cmd/sql/path/uri"));
        }
    }
    if !is_sha256_hex(&event.result_digest) {
        errors.push("result_digest must be a sha256 hex string".to_string());
    }
    if event.anti_gaming_notes.is_empty()
        || event.anti_gaming_notes.iter().any(|n| n.trim().is_empty())
    {
        errors.push("anti_gaming_notes must be a non-empty list of non-empty strings".to_string());
    }
    if event.decision.reason.trim().is_empty() {
        errors.push("decision.reason must be a non-empty string".to_string());
    }
    if !(0.0..=1.0).contains(&event.decision.score) {
        errors.push("decision.score must be in [0, 1]".to_string());
    }
    for artifact in &event.artifacts {
        if !is_sha256_hex(&artifact.sha256) {
            errors.push(format!("artifact {} sha256 is not hex", artifact.path));
        }
    }
    errors
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEventRecord {
    pub schema_version: String,
    pub ts_ms: u64,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForegroundRecord {
    pub schema_version: String,
    pub step_idx: u32,
    pub ts_ms: u64,
    pub package: Option<String>,
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenRecord {
    pub schema_version: String,
    pub step_idx: u32,
    pub ts_ms: u64,
    #[serde(default)]
    pub geometry: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    Approved,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub schema_version: String,
    pub step_idx: u32,
    pub ts_ms: u64,
    pub sink_type: String,
    pub decision: ConsentDecision,
    /// Truncated hash of the confirmation token; never the token itself.
    pub token_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> OracleEventRecord {
        OracleEventRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            ts_ms: 1,
            oracle_name: "settings_check".to_string(),
            oracle_type: OracleType::Hard,
            phase: OraclePhase::Post,
            queries: vec![OracleQuery {
                query_type: "adb_cmd".to_string(),
                timeout_ms: 1000,
                cmd: Some("settings get global stay_on_while_plugged_in".to_string()),
                ..OracleQuery::default()
            }],
            result_digest: "a".repeat(64),
            result_preview: Value::Null,
            decision: Decision::conclusive(true, "value matched"),
            anti_gaming_notes: vec!["pre_value baseline captured".to_string()],
            capabilities_required: vec!["adb_shell".to_string()],
            missing_capabilities: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn valid_event_passes_contract() {
        assert!(oracle_event_errors(&sample_event()).is_empty());
    }

    #[test]
    fn event_without_queries_is_rejected() {
        let mut ev = sample_event();
        ev.queries.clear();
        assert!(!oracle_event_errors(&ev).is_empty());
    }

    #[test]
    fn event_without_anti_gaming_notes_is_rejected() {
        let mut ev = sample_event();
        ev.anti_gaming_notes.clear();
        assert!(!oracle_event_errors(&ev).is_empty());
    }

    #[test]
    fn query_without_locator_is_rejected() {
        let mut ev = sample_event();
        ev.queries[0].cmd = None;
        assert!(!oracle_event_errors(&ev).is_empty());
    }

    #[test]
    fn component_digests_sort_present_values() {
        let d = ObsComponentDigests {
            screenshot_digest: Some("bbb".to_string()),
            foreground_digest: Some("aaa".to_string()),
            ..ObsComponentDigests::default()
        };
        assert_eq!(d.present_sorted(), vec!["aaa", "bbb"]);
    }
}
