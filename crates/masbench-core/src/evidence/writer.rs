// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Append-only, schema-checked sinks for the episode trace files plus the
//! content-addressed blob area. Writes are validated before they hit disk;
//! a rejected record is an error, never a silent drop.

use crate::device::CoordSpace;
use crate::digest::{canonical_json, sha256_bytes};
use crate::error::{HarnessError, HarnessResult};
use crate::evidence::pack::{PackPaths, ARTIFACTS_DIR, ORACLE_RAW_DIR};
use crate::evidence::records::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Oracle previews larger than this are stored as blobs; the JSONL line
/// keeps the digest and a relative path only.
pub const ORACLE_PREVIEW_INLINE_BUDGET: usize = 2048;

struct JsonlSink {
    file: File,
    lines_written: u64,
    last_step_idx: Option<u32>,
}

impl JsonlSink {
    fn open(path: &Path) -> HarnessResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            lines_written: 0,
            last_step_idx: None,
        })
    }

    fn append(&mut self, value: &impl Serialize) -> HarnessResult<u64> {
        let mut line = canonical_json(value)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.lines_written += 1;
        Ok(self.lines_written)
    }

    fn check_step_monotonic(&mut self, file: &str, step_idx: u32) -> HarnessResult<()> {
        if let Some(last) = self.last_step_idx {
            if step_idx <= last {
                return Err(HarnessError::Monotonicity(format!(
                    "{file}: step_idx {step_idx} after {last}"
                )));
            }
        }
        self.last_step_idx = Some(step_idx);
        Ok(())
    }
}

/// Content-addressed blob store: temp name then atomic rename to
/// `<sha256>.<ext>`. Re-storing identical bytes is a no-op.
pub struct BlobStore {
    root: PathBuf,
    rel_prefix: String,
}

impl BlobStore {
    pub fn new(root: PathBuf, rel_prefix: &str) -> Self {
        Self {
            root,
            rel_prefix: rel_prefix.to_string(),
        }
    }

    pub fn put(&self, bytes: &[u8], ext: &str) -> HarnessResult<ArtifactRef> {
        let digest = sha256_bytes(bytes);
        let file_name = format!("{digest}.{ext}");
        let final_path = self.root.join(&file_name);
        if !final_path.exists() {
            let tmp = self.root.join(format!(".{file_name}.tmp"));
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &final_path)?;
        }
        Ok(ArtifactRef {
            path: format!("{}/{}", self.rel_prefix, file_name),
            sha256: digest,
        })
    }
}

/// The per-episode evidence writer. Owned by the episode runner; sealed at
/// episode end, after which any append is an error.
pub struct EvidenceWriter {
    paths: PackPaths,
    schema_version: String,
    obs_digest_version: String,
    sinks: BTreeMap<&'static str, JsonlSink>,
    artifacts: BlobStore,
    oracle_raw: BlobStore,
    sealed: bool,
    last_obs_digest: Option<String>,
}

impl EvidenceWriter {
    pub fn create(paths: PackPaths, obs_digest_version: &str) -> HarnessResult<Self> {
        let artifacts = BlobStore::new(paths.evidence_dir.join(ARTIFACTS_DIR), ARTIFACTS_DIR);
        let oracle_raw = BlobStore::new(paths.evidence_dir.join(ORACLE_RAW_DIR), ORACLE_RAW_DIR);
        Ok(Self {
            paths,
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            obs_digest_version: obs_digest_version.to_string(),
            sinks: BTreeMap::new(),
            artifacts,
            oracle_raw,
            sealed: false,
            last_obs_digest: None,
        })
    }

    pub fn paths(&self) -> &PackPaths {
        &self.paths
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// The most recent `obs_digest`, used by the ref-binding guard.
    pub fn last_obs_digest(&self) -> Option<&str> {
        self.last_obs_digest.as_deref()
    }

    pub fn artifacts(&self) -> &BlobStore {
        &self.artifacts
    }

    pub fn oracle_raw(&self) -> &BlobStore {
        &self.oracle_raw
    }

    fn sink(&mut self, name: &'static str) -> HarnessResult<&mut JsonlSink> {
        if self.sealed {
            return Err(HarnessError::Sealed);
        }
        if !self.sinks.contains_key(name) {
            let sink = JsonlSink::open(&self.paths.evidence_dir.join(name))?;
            self.sinks.insert(name, sink);
        }
        self.sinks.get_mut(name).ok_or(HarnessError::Internal)
    }

    fn check_version(&self, file: &str, version: &str) -> HarnessResult<()> {
        if version != self.schema_version {
            return Err(HarnessError::SchemaViolation(format!(
                "{file}: schema_version {version:?} does not match pack version {:?}",
                self.schema_version
            )));
        }
        Ok(())
    }

    pub fn append_obs(&mut self, record: &ObsRecord) -> HarnessResult<u64> {
        self.check_version(OBS_TRACE, &record.schema_version)?;
        if record.obs_digest_version != self.obs_digest_version {
            return Err(HarnessError::SchemaViolation(format!(
                "{OBS_TRACE}: obs_digest_version changed mid-episode ({} -> {})",
                self.obs_digest_version, record.obs_digest_version
            )));
        }
        let sink = self.sink(OBS_TRACE)?;
        sink.check_step_monotonic(OBS_TRACE, record.step_idx)?;
        let line = sink.append(record)?;
        self.last_obs_digest = record.obs_digest.clone();
        Ok(line)
    }

    pub fn append_agent_action(&mut self, record: &AgentActionRecord) -> HarnessResult<u64> {
        self.check_version(AGENT_ACTION_TRACE, &record.schema_version)?;
        let sink = self.sink(AGENT_ACTION_TRACE)?;
        sink.check_step_monotonic(AGENT_ACTION_TRACE, record.step_idx)?;
        sink.append(record)
    }

    pub fn append_device_input(&mut self, record: &DeviceInputRecord) -> HarnessResult<u64> {
        self.check_version(DEVICE_INPUT_TRACE, &record.schema_version)?;
        if record.source_level == SourceLevel::L0 && record.ref_step_idx != record.step_idx {
            return Err(HarnessError::SchemaViolation(format!(
                "{DEVICE_INPUT_TRACE}: L0 requires ref_step_idx == step_idx ({} != {})",
                record.ref_step_idx, record.step_idx
            )));
        }
        if record.payload.coord_space != CoordSpace::PhysicalPx {
            return Err(HarnessError::SchemaViolation(format!(
                "{DEVICE_INPUT_TRACE}: executed input must be physical_px coordinates"
            )));
        }
        let sink = self.sink(DEVICE_INPUT_TRACE)?;
        sink.check_step_monotonic(DEVICE_INPUT_TRACE, record.step_idx)?;
        sink.append(record)
    }

    pub fn append_oracle_event(&mut self, mut record: OracleEventRecord) -> HarnessResult<u64> {
        self.check_version(ORACLE_TRACE, &record.schema_version)?;
        let errors = oracle_event_errors(&record);
        if !errors.is_empty() {
            return Err(HarnessError::SchemaViolation(format!(
                "{ORACLE_TRACE}: {}",
                errors.join("; ")
            )));
        }
        let preview_bytes = canonical_json(&record.result_preview)?;
        if preview_bytes.len() > ORACLE_PREVIEW_INLINE_BUDGET {
            let blob = self.oracle_raw.put(&preview_bytes, "json")?;
            record.result_preview = serde_json::json!({
                "stored_blob": blob.path.clone(),
                "sha256": blob.sha256.clone(),
                "inline_bytes": preview_bytes.len(),
            });
            record.artifacts.push(blob);
        }
        self.sink(ORACLE_TRACE)?.append(&record)
    }

    pub fn append_device_event(&mut self, record: &DeviceEventRecord) -> HarnessResult<u64> {
        self.check_version(DEVICE_TRACE, &record.schema_version)?;
        self.sink(DEVICE_TRACE)?.append(record)
    }

    pub fn append_foreground(&mut self, record: &ForegroundRecord) -> HarnessResult<u64> {
        self.check_version(FOREGROUND_APP_TRACE, &record.schema_version)?;
        let sink = self.sink(FOREGROUND_APP_TRACE)?;
        sink.check_step_monotonic(FOREGROUND_APP_TRACE, record.step_idx)?;
        sink.append(record)
    }

    pub fn append_screen(&mut self, record: &ScreenRecord) -> HarnessResult<u64> {
        self.check_version(SCREEN_TRACE, &record.schema_version)?;
        let sink = self.sink(SCREEN_TRACE)?;
        sink.check_step_monotonic(SCREEN_TRACE, record.step_idx)?;
        sink.append(record)
    }

    pub fn append_confirmation(&mut self, record: &ConfirmationRecord) -> HarnessResult<u64> {
        self.check_version(CONFIRMATION_TRACE, &record.schema_version)?;
        self.sink(CONFIRMATION_TRACE)?.append(record)
    }

    /// Close all sinks. Further appends fail with `Sealed`.
    pub fn seal(&mut self) -> HarnessResult<()> {
        for sink in self.sinks.values_mut() {
            sink.file.flush()?;
        }
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CoordSpace;
    use serde_json::{json, Value};

    fn writer() -> (tempfile::TempDir, EvidenceWriter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PackPaths::create(dir.path(), 1).expect("paths");
        let writer = EvidenceWriter::create(paths, "v1_sorted_components").expect("writer");
        (dir, writer)
    }

    fn obs(step_idx: u32) -> ObsRecord {
        ObsRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            step_idx,
            ts_ms: 1000 + u64::from(step_idx),
            obs_digest: Some("c".repeat(64)),
            obs_digest_version: "v1_sorted_components".to_string(),
            obs_component_digests: ObsComponentDigests::default(),
            refs: ObsRefs::default(),
        }
    }

    fn input(step_idx: u32, ref_step_idx: u32) -> DeviceInputRecord {
        DeviceInputRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            step_idx,
            ref_step_idx,
            source_level: SourceLevel::L0,
            event_type: "tap".to_string(),
            payload: InputPayload {
                coord_space: CoordSpace::PhysicalPx,
                x: Some(120.0),
                y: Some(300.0),
                extra: json!({}),
            },
            timestamp_ms: 5,
            mapping_warnings: Vec::new(),
        }
    }

    #[test]
    fn step_idx_monotonicity_is_enforced() {
        let (_dir, mut w) = writer();
        w.append_obs(&obs(0)).expect("step 0");
        w.append_obs(&obs(1)).expect("step 1");
        let err = w.append_obs(&obs(1)).expect_err("duplicate step");
        assert!(matches!(err, HarnessError::Monotonicity(_)));
    }

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let (_dir, mut w) = writer();
        let mut record = obs(0);
        record.schema_version = "v999".to_string();
        assert!(matches!(
            w.append_obs(&record),
            Err(HarnessError::SchemaViolation(_))
        ));
    }

    #[test]
    fn l0_input_requires_matching_ref_step() {
        let (_dir, mut w) = writer();
        assert!(w.append_device_input(&input(0, 0)).is_ok());
        assert!(matches!(
            w.append_device_input(&input(1, 0)),
            Err(HarnessError::SchemaViolation(_))
        ));
    }

    #[test]
    fn non_physical_coordinates_are_rejected_at_execution() {
        let (_dir, mut w) = writer();
        let mut record = input(0, 0);
        record.payload.coord_space = CoordSpace::LogicalPx;
        assert!(matches!(
            w.append_device_input(&record),
            Err(HarnessError::SchemaViolation(_))
        ));
    }

    #[test]
    fn sealed_writer_rejects_appends() {
        let (_dir, mut w) = writer();
        w.append_obs(&obs(0)).expect("ok");
        w.seal().expect("seal");
        assert!(matches!(w.append_obs(&obs(1)), Err(HarnessError::Sealed)));
    }

    #[test]
    fn blob_store_is_content_addressed_and_idempotent() {
        let (_dir, w) = writer();
        let a = w.artifacts().put(b"payload", "bin").expect("first");
        let b = w.artifacts().put(b"payload", "bin").expect("second");
        assert_eq!(a.path, b.path);
        assert_eq!(a.sha256, sha256_bytes(b"payload"));
        assert!(a.path.starts_with("artifacts/"));
    }

    #[test]
    fn oversized_oracle_preview_is_spilled_to_blob() {
        let (_dir, mut w) = writer();
        let big = "x".repeat(ORACLE_PREVIEW_INLINE_BUDGET + 10);
        let record = OracleEventRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            ts_ms: 1,
            oracle_name: "sdcard_json_receipt".to_string(),
            oracle_type: OracleType::Hard,
            phase: OraclePhase::Post,
            queries: vec![OracleQuery {
                query_type: "pull".to_string(),
                timeout_ms: 1000,
                path: Some("/sdcard/receipt.json".to_string()),
                ..OracleQuery::default()
            }],
            result_digest: "b".repeat(64),
            result_preview: json!({ "raw": big }),
            decision: Decision::conclusive(true, "receipt present"),
            anti_gaming_notes: vec!["receipt cleared during pre_check".to_string()],
            capabilities_required: vec!["pull_file".to_string()],
            missing_capabilities: Vec::new(),
            artifacts: Vec::new(),
        };
        w.append_oracle_event(record).expect("append");

        let raw = std::fs::read_to_string(
            w.paths().evidence_dir.join(ORACLE_TRACE),
        )
        .expect("read trace");
        let line: Value = serde_json::from_str(raw.lines().next().expect("line")).expect("json");
        assert!(line["result_preview"]["stored_blob"]
            .as_str()
            .expect("blob path")
            .starts_with("oracle/raw/"));
        assert!(!line["artifacts"].as_array().expect("artifacts").is_empty());
    }
}
