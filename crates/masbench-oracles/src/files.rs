// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Device-file receipt oracles. Companion apps drop structured receipts on
//! the sdcard; the pre phase deletes stale receipts so a post-phase read can
//! only observe what this episode produced.

use crate::context::{make_event, missing_capability_event, path_query, shell_query, OracleContext};
use crate::oracle::Oracle;
use crate::params::{req_str, str_param};
use masbench_core::caps::Capability;
use masbench_core::digest::{sha256_bytes, token_hash_prefix};
use masbench_core::error::HarnessResult;
use masbench_core::evidence::records::{Decision, OracleEventRecord, OraclePhase, OracleType};
use masbench_core::timewin::TimeWindow;
use serde_json::{json, Map, Value};

const FILE_TIMEOUT_MS: u64 = 10_000;

fn clear_path(
    ctx: &mut OracleContext<'_>,
    oracle: &dyn Oracle,
    path: &str,
) -> HarnessResult<OracleEventRecord> {
    let serial = ctx.serial();
    let cmd = format!("rm -f {path} && ls {path} 2>/dev/null; echo cleared");
    let out = ctx
        .device
        .run_shell(&cmd, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS))?;
    let cleared = out.ok() && !out.stdout.contains(path);
    let decision = if cleared {
        Decision::conclusive(true, "stale receipt cleared")
    } else {
        // Pollution that cannot be cleared aborts the episode upstream.
        Decision::conclusive(false, "failed to clear stale receipt")
    };
    make_event(
        oracle.name(),
        oracle.oracle_type(),
        OraclePhase::Pre,
        vec![shell_query(&serial, &cmd, FILE_TIMEOUT_MS)],
        &json!({ "path": path, "cleared": cleared }),
        json!({ "path": path, "cleared": cleared }),
        decision,
        vec!["pre-run pollution clearing: stale receipts removed before the episode".to_string()],
        &oracle.capabilities_required(),
    )
}

fn device_window(ctx: &mut OracleContext<'_>) -> HarnessResult<Option<TimeWindow>> {
    ctx.episode_time.device_window(ctx.device, None, ctx.deadline)
}

fn expected_fields_match(receipt: &Map<String, Value>, expect: &Map<String, Value>) -> bool {
    expect
        .iter()
        .all(|(key, want)| receipt.get(key).is_some_and(|have| have == want))
}

/// JSON receipt written by a companion app to the sdcard; matched on
/// expected fields plus a `ts_ms` within the episode window.
pub struct SdcardJsonReceiptOracle {
    path: String,
    expect: Map<String, Value>,
    token_field: Option<String>,
}

impl Oracle for SdcardJsonReceiptOracle {
    fn name(&self) -> &str {
        "sdcard_json_receipt"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell, Capability::PullFile, Capability::SdcardWritable]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let missing = ctx.missing_capabilities(&self.capabilities_required());
        if !missing.is_empty() {
            return Ok(vec![missing_capability_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Pre,
                vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
                missing,
                &self.capabilities_required(),
            )?]);
        }
        Ok(vec![clear_path(ctx, self, &self.path.clone())?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let missing = ctx.missing_capabilities(&self.capabilities_required());
        if !missing.is_empty() {
            return Ok(vec![missing_capability_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
                missing,
                &self.capabilities_required(),
            )?]);
        }

        let Some(window) = device_window(ctx)? else {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
                &json!({ "missing": ["device_time_window"] }),
                json!({ "missing": "device_time_window" }),
                Decision::inconclusive("failed to compute device time window"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        };

        let bytes = ctx
            .device
            .pull(&self.path, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS));
        let (decision, preview, raw_digest) = match bytes {
            Err(_) => (
                Decision::conclusive(false, "receipt absent"),
                json!({ "present": false }),
                None,
            ),
            Ok(bytes) => {
                let digest = sha256_bytes(&bytes);
                match serde_json::from_slice::<Value>(&bytes) {
                    Err(_) => (
                        Decision::inconclusive("receipt present but not valid JSON"),
                        json!({ "present": true, "parse_ok": false, "sha256": digest.clone() }),
                        Some(digest),
                    ),
                    Ok(Value::Object(receipt)) => {
                        let ts_ok = receipt
                            .get("ts_ms")
                            .and_then(Value::as_u64)
                            .map(|ts| window.contains(ts));
                        let fields_ok = expected_fields_match(&receipt, &self.expect);
                        let token_ok = match &self.token_field {
                            None => true,
                            Some(field) => receipt
                                .get(field)
                                .and_then(Value::as_str)
                                .is_some_and(|v| v.contains(ctx.episode_token)),
                        };
                        let success = fields_ok && token_ok && ts_ok == Some(true);
                        let decision = match ts_ok {
                            None => Decision::inconclusive("receipt lacks ts_ms"),
                            Some(in_window) if !in_window => {
                                Decision::conclusive(false, "receipt timestamp outside window")
                            }
                            Some(_) => Decision::conclusive(
                                success,
                                if success {
                                    "receipt matched expectation"
                                } else {
                                    "receipt fields did not match"
                                },
                            ),
                        };
                        (
                            decision,
                            json!({
                                "present": true,
                                "parse_ok": true,
                                "fields_ok": fields_ok,
                                "token_ok": token_ok,
                                "ts_in_window": ts_ok,
                                "sha256": digest.clone(),
                            }),
                            Some(digest),
                        )
                    }
                    Ok(_) => (
                        Decision::inconclusive("receipt is not a JSON object"),
                        json!({ "present": true, "parse_ok": false }),
                        Some(digest),
                    ),
                }
            }
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
            &json!({ "path": self.path.clone(), "sha256": raw_digest, "window": window }),
            preview,
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl SdcardJsonReceiptOracle {
    fn notes(&self) -> Vec<String> {
        let mut notes = vec![
            "receipt cleared during pre_check; post-phase content is episode-scoped".to_string(),
            "receipt ts_ms bound to the device-clock window".to_string(),
        ];
        if self.token_field.is_some() {
            notes.push("per-episode token must appear in the receipt".to_string());
        }
        notes
    }
}

pub fn make_sdcard_json_receipt(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let expect = params
        .get("expect")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Ok(Box::new(SdcardJsonReceiptOracle {
        path: req_str(params, "path", "sdcard_json_receipt")?,
        expect,
        token_field: str_param(params, "token_field"),
    }))
}

/// Existence + mtime-in-window + content hash for one device file.
pub struct FileHashOracle {
    path: String,
    expected_sha256: Option<String>,
}

impl Oracle for FileHashOracle {
    fn name(&self) -> &str {
        "file_hash"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell, Capability::PullFile]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let cmd = format!("ls {} 2>/dev/null; echo probed", self.path);
        let out = ctx
            .device
            .run_shell(&cmd, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS))?;
        let existed = out.stdout.contains(&self.path);
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Pre,
            vec![shell_query(&serial, &cmd, FILE_TIMEOUT_MS)],
            &json!({ "path": self.path.clone(), "existed_before": existed }),
            json!({ "existed_before": existed }),
            Decision::conclusive(true, "existence baseline recorded"),
            self.notes(),
            &self.capabilities_required(),
        )?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let missing = ctx.missing_capabilities(&self.capabilities_required());
        if !missing.is_empty() {
            return Ok(vec![missing_capability_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
                missing,
                &self.capabilities_required(),
            )?]);
        }
        let serial = ctx.serial();
        let stat_cmd = format!("stat -c %Y {}", self.path);
        let stat_out = ctx
            .device
            .run_shell(&stat_cmd, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS))?;
        let mtime_s: Option<u64> = if stat_out.ok() {
            stat_out.stdout.trim().parse().ok()
        } else {
            None
        };

        let Some(window) = device_window(ctx)? else {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![shell_query(&serial, &stat_cmd, FILE_TIMEOUT_MS)],
                &json!({ "missing": ["device_time_window"] }),
                json!({ "missing": "device_time_window" }),
                Decision::inconclusive("failed to compute device time window"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        };

        let (decision, sha256) = match mtime_s {
            None => (Decision::conclusive(false, "file absent"), None),
            Some(mtime_s) if !window.contains(mtime_s * 1000) => (
                Decision::conclusive(false, "file mtime outside episode window"),
                None,
            ),
            Some(_) => {
                let bytes = ctx
                    .device
                    .pull(&self.path, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS));
                match bytes {
                    Err(_) => (Decision::inconclusive("stat ok but pull failed"), None),
                    Ok(bytes) => {
                        let digest = sha256_bytes(&bytes);
                        let decision = match &self.expected_sha256 {
                            None => Decision::conclusive(true, "file present in window"),
                            Some(expected) if expected == &digest => {
                                Decision::conclusive(true, "content hash matched")
                            }
                            Some(_) => Decision::conclusive(false, "content hash mismatch"),
                        };
                        (decision, Some(digest))
                    }
                }
            }
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![
                shell_query(&serial, &stat_cmd, FILE_TIMEOUT_MS),
                path_query("pull", &self.path, FILE_TIMEOUT_MS),
            ],
            &json!({
                "path": self.path.clone(),
                "mtime_s": mtime_s,
                "sha256": sha256.clone(),
                "window": window,
            }),
            json!({ "mtime_s": mtime_s, "sha256": sha256 }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl FileHashOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "bi-directional check: mtime window and content hash must both hold".to_string(),
            "pre-phase existence baseline recorded".to_string(),
        ]
    }
}

pub fn make_file_hash(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(FileHashOracle {
        path: req_str(params, "path", "file_hash")?,
        expected_sha256: str_param(params, "sha256"),
    }))
}

/// JSONL receipt dropped by the notification-listener companion app.
pub struct NotificationListenerReceiptOracle {
    path: String,
    package: String,
    token: Option<String>,
}

impl Oracle for NotificationListenerReceiptOracle {
    fn name(&self) -> &str {
        "notification_listener_receipt"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell, Capability::PullFile]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        Ok(vec![clear_path(ctx, self, &self.path.clone())?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let Some(window) = device_window(ctx)? else {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
                &json!({ "missing": ["device_time_window"] }),
                json!({ "missing": "device_time_window" }),
                Decision::inconclusive("failed to compute device time window"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        };
        let bytes = ctx
            .device
            .pull(&self.path, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS));
        let (decision, match_count, line_count) = match bytes {
            Err(_) => (Decision::conclusive(false, "receipt file absent"), 0, 0),
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let mut line_count = 0usize;
                let mut match_count = 0usize;
                let mut parse_failed = false;
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    line_count += 1;
                    let Ok(entry) = serde_json::from_str::<Value>(line) else {
                        parse_failed = true;
                        continue;
                    };
                    let pkg_ok = entry
                        .get("package")
                        .and_then(Value::as_str)
                        .is_some_and(|p| p == self.package);
                    let ts_ok = entry
                        .get("ts_ms")
                        .and_then(Value::as_u64)
                        .is_some_and(|ts| window.contains(ts));
                    let token_ok = match &self.token {
                        None => true,
                        Some(token) => entry
                            .get("text")
                            .and_then(Value::as_str)
                            .is_some_and(|t| t.contains(token.as_str())),
                    };
                    if pkg_ok && ts_ok && token_ok {
                        match_count += 1;
                    }
                }
                let decision = if match_count > 0 {
                    Decision::conclusive(true, format!("{match_count} matching receipt line(s)"))
                } else if parse_failed {
                    Decision::inconclusive("receipt lines unparseable")
                } else {
                    Decision::conclusive(false, "no matching receipt lines")
                };
                (decision, match_count, line_count)
            }
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
            &json!({
                "path": self.path.clone(),
                "line_count": line_count,
                "match_count": match_count,
                "window": window,
            }),
            json!({
                "line_count": line_count,
                "match_count": match_count,
                "token_hash": self.token.as_deref().map(token_hash_prefix),
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl NotificationListenerReceiptOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "receipt cleared during pre_check".to_string(),
            "entries matched on package + device-clock window".to_string(),
        ]
    }
}

pub fn make_notification_listener_receipt(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(NotificationListenerReceiptOracle {
        path: str_param(params, "path")
            .unwrap_or_else(|| "/sdcard/mas_receipts/notifications.jsonl".to_string()),
        package: req_str(params, "package", "notification_listener_receipt")?,
        token: str_param(params, "token"),
    }))
}

/// Clipboard receipt from the companion app. Matching is hash-to-hash: the
/// receipt carries `text_sha256`, never clipboard plaintext.
pub struct ClipboardReceiptOracle {
    path: String,
    token: String,
}

impl Oracle for ClipboardReceiptOracle {
    fn name(&self) -> &str {
        "clipboard_receipt"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell, Capability::PullFile]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        Ok(vec![clear_path(ctx, self, &self.path.clone())?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let Some(window) = device_window(ctx)? else {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
                &json!({ "missing": ["device_time_window"] }),
                json!({ "missing": "device_time_window" }),
                Decision::inconclusive("failed to compute device time window"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        };
        let expected_hash = sha256_bytes(self.token.as_bytes());
        let bytes = ctx
            .device
            .pull(&self.path, ctx.deadline.sub_deadline(FILE_TIMEOUT_MS));
        let decision = match bytes {
            Err(_) => Decision::conclusive(false, "clipboard receipt absent"),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Err(_) => Decision::inconclusive("clipboard receipt unparseable"),
                Ok(receipt) => {
                    let ts_ok = receipt
                        .get("ts_ms")
                        .and_then(Value::as_u64)
                        .is_some_and(|ts| window.contains(ts));
                    let hash_ok = receipt
                        .get("text_sha256")
                        .and_then(Value::as_str)
                        .is_some_and(|h| h == expected_hash);
                    if hash_ok && ts_ok {
                        Decision::conclusive(true, "clipboard hash matched in window")
                    } else if hash_ok {
                        Decision::conclusive(false, "clipboard hash matched outside window")
                    } else {
                        Decision::conclusive(false, "clipboard hash did not match")
                    }
                }
            },
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![path_query("pull", &self.path, FILE_TIMEOUT_MS)],
            &json!({
                "path": self.path.clone(),
                "token_hash": token_hash_prefix(&self.token),
                "window": window,
            }),
            json!({ "token_hash": token_hash_prefix(&self.token) }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl ClipboardReceiptOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "receipt cleared during pre_check".to_string(),
            "hash-to-hash comparison; clipboard plaintext never leaves the device".to_string(),
        ]
    }
}

pub fn make_clipboard_receipt(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(ClipboardReceiptOracle {
        path: str_param(params, "path")
            .unwrap_or_else(|| "/sdcard/mas_receipts/clipboard.json".to_string()),
        token: req_str(params, "token", "clipboard_receipt")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_fields_compare_exactly() {
        let receipt: Map<String, Value> = serde_json::from_value(json!({
            "kind": "install", "package": "com.mas.supportsink", "ts_ms": 5
        }))
        .expect("receipt");
        let expect_ok: Map<String, Value> =
            serde_json::from_value(json!({"kind": "install"})).expect("expect");
        let expect_bad: Map<String, Value> =
            serde_json::from_value(json!({"kind": "uninstall"})).expect("expect");
        assert!(expected_fields_match(&receipt, &expect_ok));
        assert!(!expected_fields_match(&receipt, &expect_bad));
    }

    #[test]
    fn sdcard_receipt_requires_path() {
        assert!(make_sdcard_json_receipt(&json!({})).is_err());
        assert!(make_sdcard_json_receipt(&json!({"path": "/sdcard/r.json"})).is_ok());
    }
}
