// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! On-disk evidence pack layout and the sealed (read-only) view.
//!
//! ```text
//! <out_dir>/
//!   run_manifest.json
//!   env_capabilities.json
//!   episode_XXXX/
//!     summary.json
//!     evidence/
//!       *.jsonl
//!       oracle/raw/<sha256>.<ext>
//!       artifacts/<sha256>.<ext>
//! ```

use crate::error::{HarnessError, HarnessResult};
use crate::evidence::manifest::{read_json_object, write_json_atomic, RunManifest};
use crate::evidence::records::{ASSERTIONS_JSONL, FACTS_JSONL};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_MANIFEST_JSON: &str = "run_manifest.json";
pub const ENV_CAPABILITIES_JSON: &str = "env_capabilities.json";
pub const SUMMARY_JSON: &str = "summary.json";
pub const CRASH_JSON: &str = "crash.json";
pub const ORACLE_RAW_DIR: &str = "oracle/raw";
pub const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug, Clone)]
pub struct PackPaths {
    pub run_root: PathBuf,
    pub episode_dir: PathBuf,
    pub evidence_dir: PathBuf,
}

impl PackPaths {
    /// Create the directory tree for one episode under a run root.
    pub fn create(out_dir: &Path, episode_idx: u32) -> HarnessResult<Self> {
        let episode_dir = out_dir.join(format!("episode_{episode_idx:04}"));
        let evidence_dir = episode_dir.join("evidence");
        fs::create_dir_all(evidence_dir.join(ORACLE_RAW_DIR))?;
        fs::create_dir_all(evidence_dir.join(ARTIFACTS_DIR))?;
        Ok(Self {
            run_root: out_dir.to_path_buf(),
            episode_dir,
            evidence_dir,
        })
    }
}

fn find_run_root(start: &Path) -> Option<PathBuf> {
    let mut cur = start.to_path_buf();
    for _ in 0..8 {
        if cur.join(RUN_MANIFEST_JSON).is_file() {
            return Some(cur);
        }
        cur = cur.parent()?.to_path_buf();
    }
    None
}

/// Read-only view over a sealed episode evidence pack. The detector and
/// assertion engines consume this and append only `facts.jsonl` and
/// `assertions.jsonl`.
#[derive(Debug)]
pub struct SealedPack {
    episode_dir: PathBuf,
    evidence_dir: PathBuf,
    run_root: Option<PathBuf>,
    run_manifest: Option<Value>,
    env_capabilities: Option<Value>,
}

impl SealedPack {
    pub fn open(episode_dir: &Path) -> HarnessResult<Self> {
        let evidence_dir = {
            let nested = episode_dir.join("evidence");
            if nested.is_dir() {
                nested
            } else {
                episode_dir.to_path_buf()
            }
        };
        let run_root = find_run_root(&evidence_dir);
        let run_manifest = run_root
            .as_deref()
            .map(|root| read_json_object(&root.join(RUN_MANIFEST_JSON)))
            .transpose()
            .unwrap_or(None);
        let env_capabilities = run_root
            .as_deref()
            .and_then(|root| read_json_object(&root.join(ENV_CAPABILITIES_JSON)).ok());
        Ok(Self {
            episode_dir: episode_dir.to_path_buf(),
            evidence_dir,
            run_root,
            run_manifest,
            env_capabilities,
        })
    }

    pub fn episode_dir(&self) -> &Path {
        &self.episode_dir
    }

    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    pub fn run_root(&self) -> Option<&Path> {
        self.run_root.as_deref()
    }

    pub fn run_manifest(&self) -> Option<&Value> {
        self.run_manifest.as_ref()
    }

    pub fn typed_manifest(&self) -> Option<RunManifest> {
        self.run_manifest
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn env_capabilities(&self) -> Option<&Value> {
        self.env_capabilities.as_ref()
    }

    pub fn summary(&self) -> Option<Value> {
        read_json_object(&self.episode_dir.join(SUMMARY_JSON)).ok()
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.evidence_dir.join(name).is_file()
    }

    /// Parse one JSONL trace file; line numbers are 1-based. Missing files
    /// yield an empty vector (absence maps to INCONCLUSIVE downstream,
    /// never to a crash).
    pub fn read_jsonl(&self, name: &str) -> HarnessResult<Vec<(u64, Value)>> {
        let path = self.evidence_dir.join(name);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        let mut out = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let line_no = (idx + 1) as u64;
            let value: Value = serde_json::from_str(line).map_err(|e| {
                HarnessError::SchemaViolation(format!("{name}:L{line_no}: invalid json ({e})"))
            })?;
            if !value.is_object() {
                return Err(HarnessError::SchemaViolation(format!(
                    "{name}:L{line_no}: jsonl line must be an object"
                )));
            }
            out.push((line_no, value));
        }
        Ok(out)
    }

    /// Check that an evidence ref resolves to a line or file within this pack.
    pub fn ref_resolves(&self, evidence_ref: &str) -> bool {
        if let Some(rel) = evidence_ref.strip_prefix("artifact:") {
            return self.evidence_dir.join(rel).is_file();
        }
        if let Some((file, line)) = evidence_ref.rsplit_once(":L") {
            let Ok(line_no) = line.parse::<u64>() else {
                return false;
            };
            let Ok(lines) = self.read_jsonl(file) else {
                return false;
            };
            return lines.iter().any(|(n, _)| *n == line_no);
        }
        self.evidence_dir.join(evidence_ref).is_file()
            || self
                .run_root
                .as_deref()
                .is_some_and(|root| root.join(evidence_ref).is_file())
    }

    /// Atomic JSONL write used for facts.jsonl / assertions.jsonl.
    pub fn write_jsonl_atomic<T: Serialize>(&self, name: &str, lines: &[T]) -> HarnessResult<()> {
        let path = self.evidence_dir.join(name);
        let tmp = path.with_extension("jsonl.tmp");
        let mut buf = Vec::new();
        for line in lines {
            buf.extend_from_slice(&crate::digest::canonical_json(line)?);
            buf.push(b'\n');
        }
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn write_summary(&self, summary: &impl Serialize) -> HarnessResult<()> {
        write_json_atomic(&self.episode_dir.join(SUMMARY_JSON), summary)
    }

    pub fn facts_path(&self) -> PathBuf {
        self.evidence_dir.join(FACTS_JSONL)
    }

    pub fn assertions_path(&self) -> PathBuf {
        self.evidence_dir.join(ASSERTIONS_JSONL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_then_open_resolves_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PackPaths::create(dir.path(), 1).expect("create");
        assert!(paths.evidence_dir.join(ORACLE_RAW_DIR).is_dir());
        fs::write(
            paths.evidence_dir.join("oracle_trace.jsonl"),
            "{\"oracle_name\":\"x\"}\n\n{\"oracle_name\":\"y\"}\n",
        )
        .expect("write trace");
        let pack = SealedPack::open(&paths.episode_dir).expect("open");
        let lines = pack.read_jsonl("oracle_trace.jsonl").expect("read");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, 1);
        assert_eq!(lines[1].0, 3);
    }

    #[test]
    fn refs_resolve_to_lines_and_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PackPaths::create(dir.path(), 1).expect("create");
        fs::write(
            paths.evidence_dir.join("oracle_trace.jsonl"),
            "{\"a\":1}\n{\"a\":2}\n",
        )
        .expect("trace");
        fs::write(
            paths.evidence_dir.join(ARTIFACTS_DIR).join("abc.png"),
            b"png",
        )
        .expect("artifact");
        let pack = SealedPack::open(&paths.episode_dir).expect("open");
        assert!(pack.ref_resolves("oracle_trace.jsonl:L2"));
        assert!(!pack.ref_resolves("oracle_trace.jsonl:L3"));
        assert!(pack.ref_resolves("artifact:artifacts/abc.png"));
        assert!(!pack.ref_resolves("artifact:artifacts/missing.png"));
        assert!(pack.ref_resolves("oracle_trace.jsonl"));
    }

    #[test]
    fn invalid_jsonl_line_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PackPaths::create(dir.path(), 1).expect("create");
        fs::write(paths.evidence_dir.join("obs_trace.jsonl"), "not-json\n").expect("trace");
        let pack = SealedPack::open(&paths.episode_dir).expect("open");
        assert!(pack.read_jsonl("obs_trace.jsonl").is_err());
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PackPaths::create(dir.path(), 2).expect("create");
        let pack = SealedPack::open(&paths.episode_dir).expect("open");
        assert!(pack.read_jsonl("device_input_trace.jsonl").expect("read").is_empty());
    }

    #[test]
    fn run_root_discovered_from_episode_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = PackPaths::create(dir.path(), 1).expect("create");
        fs::write(
            dir.path().join(RUN_MANIFEST_JSON),
            serde_json::to_vec(&json!({"run_id": "r1"})).expect("bytes"),
        )
        .expect("manifest");
        let pack = SealedPack::open(&paths.episode_dir).expect("open");
        assert!(pack.run_root().is_some());
        assert_eq!(pack.run_manifest().expect("manifest")["run_id"], "r1");
    }
}
