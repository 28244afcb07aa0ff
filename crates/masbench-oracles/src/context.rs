// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inputs passed to an oracle and the shared event constructors.

use masbench_core::caps::Capability;
use masbench_core::device::{Deadline, DeviceControl};
use masbench_core::digest::stable_sha256;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::manifest::EnvCapabilities;
use masbench_core::evidence::records::{
    ArtifactRef, Decision, OracleEventRecord, OraclePhase, OracleQuery, OracleType,
    PACK_SCHEMA_VERSION,
};
use masbench_core::evidence::writer::BlobStore;
use masbench_core::timewin::{host_utc_ms, EpisodeTime};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

pub struct OracleContext<'a> {
    pub device: &'a mut dyn DeviceControl,
    pub episode_time: EpisodeTime,
    pub episode_dir: &'a Path,
    pub evidence_dir: &'a Path,
    /// Blob sink for raw oracle output (`oracle/raw/<sha256>.<ext>`).
    pub oracle_raw: &'a BlobStore,
    pub artifacts_root: Option<&'a Path>,
    pub run_id: &'a str,
    /// Per-episode unique token available for anti-gaming match criteria.
    pub episode_token: &'a str,
    pub capabilities: &'a EnvCapabilities,
    pub deadline: Deadline,
}

impl OracleContext<'_> {
    pub fn serial(&self) -> String {
        self.device.serial().to_string()
    }

    pub fn missing_capabilities(&self, required: &[Capability]) -> Vec<String> {
        required
            .iter()
            .filter(|cap| !self.capabilities.has(**cap))
            .map(|cap| cap.as_str().to_string())
            .collect()
    }
}

pub fn shell_query(serial: &str, cmd: &str, timeout_ms: u64) -> OracleQuery {
    OracleQuery {
        query_type: "adb_cmd".to_string(),
        timeout_ms,
        serial: Some(serial.to_string()),
        cmd: Some(cmd.to_string()),
        ..OracleQuery::default()
    }
}

pub fn content_query(serial: &str, cmd: &str, uri: &str, timeout_ms: u64) -> OracleQuery {
    OracleQuery {
        query_type: "content_query".to_string(),
        timeout_ms,
        serial: Some(serial.to_string()),
        cmd: Some(cmd.to_string()),
        uri: Some(uri.to_string()),
        ..OracleQuery::default()
    }
}

pub fn path_query(query_type: &str, path: &str, timeout_ms: u64) -> OracleQuery {
    OracleQuery {
        query_type: query_type.to_string(),
        timeout_ms,
        path: Some(path.to_string()),
        ..OracleQuery::default()
    }
}

pub fn sql_query(sql: &str, path: &str, timeout_ms: u64) -> OracleQuery {
    OracleQuery {
        query_type: "sqlite".to_string(),
        timeout_ms,
        sql: Some(sql.to_string()),
        path: Some(path.to_string()),
        ..OracleQuery::default()
    }
}

#[allow(clippy::too_many_arguments)]
pub fn make_event(
    oracle_name: &str,
    oracle_type: OracleType,
    phase: OraclePhase,
    queries: Vec<OracleQuery>,
    result_for_digest: &impl Serialize,
    result_preview: Value,
    decision: Decision,
    anti_gaming_notes: Vec<String>,
    capabilities_required: &[Capability],
) -> HarnessResult<OracleEventRecord> {
    Ok(OracleEventRecord {
        schema_version: PACK_SCHEMA_VERSION.to_string(),
        ts_ms: host_utc_ms(),
        oracle_name: oracle_name.to_string(),
        oracle_type,
        phase,
        queries,
        result_digest: stable_sha256(result_for_digest)?,
        result_preview,
        decision,
        anti_gaming_notes,
        capabilities_required: capabilities_required
            .iter()
            .map(|c| c.as_str().to_string())
            .collect(),
        missing_capabilities: Vec::new(),
        artifacts: Vec::new(),
    })
}

/// The shared "cannot run: capability missing" event shape. Inconclusive,
/// never a hard failure.
pub fn missing_capability_event(
    oracle_name: &str,
    oracle_type: OracleType,
    phase: OraclePhase,
    queries: Vec<OracleQuery>,
    missing: Vec<String>,
    capabilities_required: &[Capability],
) -> HarnessResult<OracleEventRecord> {
    let mut event = make_event(
        oracle_name,
        oracle_type,
        phase,
        queries,
        &serde_json::json!({ "missing": missing.clone() }),
        serde_json::json!({ "missing_capabilities": missing.clone() }),
        Decision::inconclusive(format!(
            "missing capabilities: {}",
            missing.join(",")
        )),
        vec!["capability-gated: absence of evidence is not treated as absence of effect".to_string()],
        capabilities_required,
    )?;
    event.missing_capabilities = missing;
    Ok(event)
}

pub fn attach_artifact(event: &mut OracleEventRecord, artifact: ArtifactRef) {
    event.artifacts.push(artifact);
}
