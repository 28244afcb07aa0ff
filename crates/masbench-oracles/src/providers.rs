// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Content-provider oracles: SMS, Contacts, Calendar, CallLog, MediaStore.
//!
//! One generic query engine parameterized by URI set, projection and match
//! conditions. Matching always combines multiple conditions with the
//! device-clock time window; previews carry counts, hash prefixes and
//! length buckets only — never message bodies, names or numbers.

use crate::adb::{content_query_cmd, parse_content_rows, phone_matches};
use crate::context::{content_query, make_event, missing_capability_event, OracleContext};
use crate::oracle::Oracle;
use crate::params::{req_str, str_param, u64_param};
use masbench_core::caps::Capability;
use masbench_core::digest::token_hash_prefix;
use masbench_core::error::{HarnessError, HarnessResult};
use masbench_core::evidence::observation::length_bucket;
use masbench_core::evidence::records::{
    Decision, OracleEventRecord, OraclePhase, OracleQuery, OracleType,
};
use masbench_core::timewin::{parse_epoch_time_ms, TimeWindow};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

const DEFAULT_QUERY_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_ROW_LIMIT: u64 = 50;

#[derive(Debug, Clone)]
enum MatchCond {
    PhoneSuffix { key: &'static str, expected: String },
    Contains { key: &'static str, expected: String },
    Equals { key: &'static str, expected: String },
}

impl MatchCond {
    fn key(&self) -> &'static str {
        match self {
            MatchCond::PhoneSuffix { key, .. }
            | MatchCond::Contains { key, .. }
            | MatchCond::Equals { key, .. } => key,
        }
    }

    fn matches(&self, row: &BTreeMap<String, String>) -> bool {
        let Some(value) = row.get(self.key()) else {
            return false;
        };
        match self {
            MatchCond::PhoneSuffix { expected, .. } => phone_matches(value, expected),
            MatchCond::Contains { expected, .. } => value.contains(expected.as_str()),
            MatchCond::Equals { expected, .. } => value.trim() == expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowMode {
    /// Row timestamp must fall inside `[start, end]`.
    Within,
    /// Row timestamp must be at or after window start (calendar events may
    /// legitimately start after the episode ends).
    AfterStart,
}

pub struct ProviderOracle {
    name: &'static str,
    uris: Vec<String>,
    projection: Vec<&'static str>,
    date_key: &'static str,
    window_mode: WindowMode,
    conditions: Vec<MatchCond>,
    limit: u64,
    timeout_ms: u64,
}

struct QueryRun {
    queries: Vec<OracleQuery>,
    rows: Vec<BTreeMap<String, String>>,
    query_failed: bool,
}

impl ProviderOracle {
    fn run_queries(
        &self,
        ctx: &mut OracleContext<'_>,
        window_start: Option<u64>,
    ) -> HarnessResult<QueryRun> {
        let serial = ctx.serial();
        let projection = self.projection.join(":");
        let mut queries = Vec::new();
        let mut rows = Vec::new();
        let mut query_failed = false;

        for uri in &self.uris {
            let where_clause = window_start.map(|start| format!("{} >= {start}", self.date_key));
            let cmd = content_query_cmd(
                uri,
                &projection,
                where_clause.as_deref(),
                Some(&format!("{} DESC", self.date_key)),
                Some(self.limit as u32),
            );
            let out = ctx
                .device
                .run_shell(&cmd, ctx.deadline.sub_deadline(self.timeout_ms))?;
            if !out.ok() {
                query_failed = true;
            }
            rows.extend(parse_content_rows(&out.stdout, &self.projection));
            queries.push(content_query(&serial, &cmd, uri, self.timeout_ms));
        }
        Ok(QueryRun {
            queries,
            rows,
            query_failed,
        })
    }

    fn match_rows(&self, rows: &[BTreeMap<String, String>], window: &TimeWindow) -> Vec<Value> {
        let mut matches = Vec::new();
        let mut seen_ids: BTreeSet<String> = BTreeSet::new();
        for row in rows {
            let row_id = row.get("_id").cloned().unwrap_or_default();
            if !row_id.is_empty() && !seen_ids.insert(row_id.clone()) {
                continue;
            }
            if !self.conditions.iter().all(|c| c.matches(row)) {
                continue;
            }
            let Some(date_ms) = row.get(self.date_key).and_then(|v| parse_epoch_time_ms(v))
            else {
                continue;
            };
            let in_window = match self.window_mode {
                WindowMode::Within => window.contains(date_ms),
                WindowMode::AfterStart => date_ms >= window.start_ms,
            };
            if !in_window {
                continue;
            }
            let mut field_hashes = BTreeMap::new();
            let mut field_len_buckets = BTreeMap::new();
            for cond in &self.conditions {
                if let Some(v) = row.get(cond.key()) {
                    field_hashes.insert(cond.key().to_string(), token_hash_prefix(v));
                    field_len_buckets.insert(cond.key().to_string(), length_bucket(v.len()));
                }
            }
            matches.push(json!({
                "_id": if row_id.is_empty() { Value::Null } else { Value::String(row_id) },
                "date_ms": date_ms,
                "field_hashes": field_hashes,
                "field_len_buckets": field_len_buckets,
            }));
        }
        matches
    }

    fn device_window(
        &self,
        ctx: &mut OracleContext<'_>,
    ) -> HarnessResult<Option<TimeWindow>> {
        ctx.episode_time
            .device_window(ctx.device, None, ctx.deadline)
    }

    fn anti_gaming_notes(&self) -> Vec<String> {
        vec![
            format!(
                "provider rows matched on {} condition(s) combined, not any single field",
                self.conditions.len()
            ),
            "time window bound to device epoch clock; historical rows cannot match".to_string(),
            "row _id dedup prevents double counting".to_string(),
        ]
    }
}

impl Oracle for ProviderOracle {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let missing = ctx.missing_capabilities(&self.capabilities_required());
        if !missing.is_empty() {
            let serial = ctx.serial();
            return Ok(vec![missing_capability_event(
                self.name,
                self.oracle_type(),
                OraclePhase::Pre,
                vec![content_query(&serial, "content query", &self.uris[0], self.timeout_ms)],
                missing,
                &self.capabilities_required(),
            )?]);
        }
        // Providers cannot be cleared; the baseline records whether the match
        // criterion was already satisfiable before the episode began.
        let run = self.run_queries(ctx, None)?;
        let baseline_window = TimeWindow::compute(0, ctx.episode_time.t0_device_epoch_ms.unwrap_or(0), 0);
        let pre_existing = self.match_rows(&run.rows, &baseline_window);
        let preview = json!({
            "baseline_row_count": run.rows.len(),
            "pre_existing_matches": pre_existing.len(),
        });
        Ok(vec![make_event(
            self.name,
            self.oracle_type(),
            OraclePhase::Pre,
            run.queries,
            &json!({ "rows": run.rows.len(), "pre_existing": pre_existing }),
            preview,
            Decision::conclusive(true, "baseline recorded"),
            self.anti_gaming_notes(),
            &self.capabilities_required(),
        )?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let missing = ctx.missing_capabilities(&self.capabilities_required());
        let serial = ctx.serial();
        if !missing.is_empty() {
            return Ok(vec![missing_capability_event(
                self.name,
                self.oracle_type(),
                OraclePhase::Post,
                vec![content_query(&serial, "content query", &self.uris[0], self.timeout_ms)],
                missing,
                &self.capabilities_required(),
            )?]);
        }

        let Some(window) = self.device_window(ctx)? else {
            return Ok(vec![make_event(
                self.name,
                self.oracle_type(),
                OraclePhase::Post,
                vec![content_query(&serial, "shell date +%s%3N", &self.uris[0], 1500)],
                &json!({ "missing": ["device_time_window"] }),
                json!({ "missing": "device_time_window" }),
                Decision::inconclusive("failed to compute device time window"),
                self.anti_gaming_notes(),
                &self.capabilities_required(),
            )?]);
        };

        let run = self.run_queries(ctx, Some(window.start_ms))?;
        let matches = self.match_rows(&run.rows, &window);
        let matched = !matches.is_empty();

        let decision = if matched {
            Decision::conclusive(true, format!("matched {} row(s)", matches.len()))
        } else if run.query_failed {
            Decision::inconclusive("content query failed (cannot conclude absence)")
        } else {
            Decision::conclusive(false, "no matching rows found")
        };

        let preview = json!({
            "matched": matched,
            "match_count": matches.len(),
            "matches": matches.iter().take(3).collect::<Vec<_>>(),
            "window": { "start_ms": window.start_ms, "end_ms": window.end_ms },
        });
        Ok(vec![make_event(
            self.name,
            self.oracle_type(),
            OraclePhase::Post,
            run.queries,
            &json!({ "window": window, "rows": run.rows, "matches": matches }),
            preview,
            decision,
            self.anti_gaming_notes(),
            &self.capabilities_required(),
        )?])
    }
}

fn sms_uris(box_param: &str) -> HarnessResult<Vec<String>> {
    match box_param {
        "sent" | "outbox" => Ok(vec!["content://sms/sent".to_string()]),
        "inbox" | "received" => Ok(vec!["content://sms/inbox".to_string()]),
        "all" | "any" => Ok(vec![
            "content://sms/sent".to_string(),
            "content://sms/inbox".to_string(),
        ]),
        other => Err(HarnessError::SpecSchema(format!(
            "sms_provider box must be sent|inbox|all, got {other:?}"
        ))),
    }
}

pub fn make_sms(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let recipient = req_str(params, "recipient", "sms_provider")?;
    let token = req_str(params, "token", "sms_provider")?;
    let box_param = str_param(params, "box").unwrap_or_else(|| "sent".to_string());
    Ok(Box::new(ProviderOracle {
        name: "sms_provider",
        uris: sms_uris(&box_param)?,
        projection: vec!["_id", "address", "date", "body"],
        date_key: "date",
        window_mode: WindowMode::Within,
        conditions: vec![
            MatchCond::PhoneSuffix {
                key: "address",
                expected: recipient,
            },
            MatchCond::Contains {
                key: "body",
                expected: token,
            },
        ],
        limit: u64_param(params, "limit", DEFAULT_ROW_LIMIT),
        timeout_ms: u64_param(params, "timeout_ms", DEFAULT_QUERY_TIMEOUT_MS),
    }))
}

pub fn make_calllog(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let number = req_str(params, "number", "calllog_provider")?;
    let mut conditions = vec![MatchCond::PhoneSuffix {
        key: "number",
        expected: number,
    }];
    if let Some(call_type) = str_param(params, "call_type") {
        conditions.push(MatchCond::Equals {
            key: "type",
            expected: call_type,
        });
    }
    Ok(Box::new(ProviderOracle {
        name: "calllog_provider",
        uris: vec!["content://call_log/calls".to_string()],
        projection: vec!["_id", "number", "date", "type", "duration"],
        date_key: "date",
        window_mode: WindowMode::Within,
        conditions,
        limit: u64_param(params, "limit", DEFAULT_ROW_LIMIT),
        timeout_ms: u64_param(params, "timeout_ms", DEFAULT_QUERY_TIMEOUT_MS),
    }))
}

pub fn make_contacts(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let name = str_param(params, "display_name");
    let number = str_param(params, "number");
    if name.is_none() && number.is_none() {
        return Err(HarnessError::SpecSchema(
            "contacts_provider requires display_name or number".to_string(),
        ));
    }
    let mut conditions = Vec::new();
    if let Some(name) = name {
        conditions.push(MatchCond::Equals {
            key: "display_name",
            expected: name,
        });
    }
    if let Some(number) = number {
        conditions.push(MatchCond::PhoneSuffix {
            key: "data1",
            expected: number,
        });
    }
    Ok(Box::new(ProviderOracle {
        name: "contacts_provider",
        uris: vec!["content://com.android.contacts/data/phones".to_string()],
        projection: vec![
            "_id",
            "display_name",
            "data1",
            "contact_last_updated_timestamp",
        ],
        date_key: "contact_last_updated_timestamp",
        window_mode: WindowMode::Within,
        conditions,
        limit: u64_param(params, "limit", DEFAULT_ROW_LIMIT),
        timeout_ms: u64_param(params, "timeout_ms", DEFAULT_QUERY_TIMEOUT_MS),
    }))
}

pub fn make_calendar(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let title_token = req_str(params, "title_token", "calendar_provider")?;
    Ok(Box::new(ProviderOracle {
        name: "calendar_provider",
        uris: vec!["content://com.android.calendar/events".to_string()],
        projection: vec!["_id", "title", "dtstart", "description"],
        date_key: "dtstart",
        window_mode: WindowMode::AfterStart,
        conditions: vec![MatchCond::Contains {
            key: "title",
            expected: title_token,
        }],
        limit: u64_param(params, "limit", DEFAULT_ROW_LIMIT),
        timeout_ms: u64_param(params, "timeout_ms", DEFAULT_QUERY_TIMEOUT_MS),
    }))
}

pub fn make_mediastore(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let display_name = req_str(params, "display_name_contains", "mediastore_provider")?;
    let collection = str_param(params, "collection").unwrap_or_else(|| "images".to_string());
    let uri = match collection.as_str() {
        "images" => "content://media/external/images/media",
        "video" => "content://media/external/video/media",
        "audio" => "content://media/external/audio/media",
        "files" => "content://media/external/file",
        other => {
            return Err(HarnessError::SpecSchema(format!(
                "mediastore_provider collection must be images|video|audio|files, got {other:?}"
            )))
        }
    };
    Ok(Box::new(ProviderOracle {
        name: "mediastore_provider",
        uris: vec![uri.to_string()],
        projection: vec!["_id", "_display_name", "date_added"],
        date_key: "date_added",
        window_mode: WindowMode::Within,
        conditions: vec![MatchCond::Contains {
            key: "_display_name",
            expected: display_name,
        }],
        limit: u64_param(params, "limit", DEFAULT_ROW_LIMIT),
        timeout_ms: u64_param(params, "timeout_ms", DEFAULT_QUERY_TIMEOUT_MS),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sms_requires_recipient_and_token() {
        assert!(make_sms(&json!({"recipient": "555-0123"})).is_err());
        assert!(make_sms(&json!({"recipient": "555-0123", "token": "T-1"})).is_ok());
    }

    #[test]
    fn sms_rejects_unknown_box() {
        let err = make_sms(&json!({"recipient": "5", "token": "t", "box": "drafts"}))
            .err()
            .expect("err");
        assert!(matches!(err, HarnessError::SpecSchema(_)));
    }

    #[test]
    fn match_rows_applies_window_and_conditions() {
        let oracle = ProviderOracle {
            name: "sms_provider",
            uris: vec!["content://sms/sent".to_string()],
            projection: vec!["_id", "address", "date", "body"],
            date_key: "date",
            window_mode: WindowMode::Within,
            conditions: vec![
                MatchCond::PhoneSuffix {
                    key: "address",
                    expected: "5550123".to_string(),
                },
                MatchCond::Contains {
                    key: "body",
                    expected: "T-42".to_string(),
                },
            ],
            limit: 50,
            timeout_ms: 1000,
        };
        let window = TimeWindow::compute(1_722_500_000_000, 1_722_500_100_000, 0);
        let row = |id: &str, addr: &str, date: &str, body: &str| {
            BTreeMap::from([
                ("_id".to_string(), id.to_string()),
                ("address".to_string(), addr.to_string()),
                ("date".to_string(), date.to_string()),
                ("body".to_string(), body.to_string()),
            ])
        };
        let rows = vec![
            row("1", "555-0123", "1722500000500", "hello T-42"),
            // Wrong recipient.
            row("2", "555-9999", "1722500000500", "hello T-42"),
            // Outside the window (historical).
            row("3", "555-0123", "1722400000000", "hello T-42"),
            // Duplicate _id.
            row("1", "555-0123", "1722500000500", "hello T-42"),
            // Token missing.
            row("4", "555-0123", "1722500000500", "hello"),
        ];
        let matches = oracle.match_rows(&rows, &window);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["_id"], "1");
        // PII discipline: no plaintext body or address in the summary.
        let text = matches[0].to_string();
        assert!(!text.contains("555-0123"));
        assert!(!text.contains("hello"));
    }
}
