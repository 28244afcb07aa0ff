// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pre/post diff oracles. `package_snapshot` and `settings_snapshot`
//! capture state in the pre phase and report the diff in the post phase;
//! the diff detectors turn those events into `fact.package_diff` and
//! `fact.settings_diff`.

use crate::context::{make_event, missing_capability_event, shell_query, OracleContext};
use crate::oracle::Oracle;
use crate::params::{bool_param, str_list_param};
use masbench_core::caps::Capability;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::records::{Decision, OracleEventRecord, OraclePhase, OracleType};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

const SNAPSHOT_TIMEOUT_MS: u64 = 15_000;

fn parse_package_list(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::to_string)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Installed-package set diff.
pub struct PackageSnapshotOracle {
    forbid_new: bool,
    expect_new: Vec<String>,
    pre_packages: Option<BTreeSet<String>>,
}

impl Oracle for PackageSnapshotOracle {
    fn name(&self) -> &str {
        "package_snapshot"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let missing = ctx.missing_capabilities(&self.capabilities_required());
        let serial = ctx.serial();
        if !missing.is_empty() {
            return Ok(vec![missing_capability_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Pre,
                vec![shell_query(&serial, "pm list packages", SNAPSHOT_TIMEOUT_MS)],
                missing,
                &self.capabilities_required(),
            )?]);
        }
        let out = ctx
            .device
            .run_shell("pm list packages", ctx.deadline.sub_deadline(SNAPSHOT_TIMEOUT_MS))?;
        let decision = if out.ok() {
            let packages = parse_package_list(&out.stdout);
            let count = packages.len();
            self.pre_packages = Some(packages);
            Decision::conclusive(count > 0, "package baseline captured")
        } else {
            Decision::inconclusive("pm list packages failed during pre_check")
        };
        let count = self.pre_packages.as_ref().map(BTreeSet::len);
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Pre,
            vec![shell_query(&serial, "pm list packages", SNAPSHOT_TIMEOUT_MS)],
            &json!({ "package_count": count, "packages": self.pre_packages.clone() }),
            json!({ "package_count": count }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let out = ctx
            .device
            .run_shell("pm list packages", ctx.deadline.sub_deadline(SNAPSHOT_TIMEOUT_MS))?;
        if !out.ok() {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![shell_query(&serial, "pm list packages", SNAPSHOT_TIMEOUT_MS)],
                &json!({ "query_ok": false }),
                json!({ "query_ok": false }),
                Decision::inconclusive("pm list packages failed during post_check"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        }
        let post = parse_package_list(&out.stdout);
        let Some(pre) = &self.pre_packages else {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![shell_query(&serial, "pm list packages", SNAPSHOT_TIMEOUT_MS)],
                &json!({ "missing": ["pre_snapshot"] }),
                json!({ "missing": "pre_snapshot" }),
                Decision::inconclusive("no pre-phase package snapshot"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        };
        let new_packages: Vec<String> = post.difference(pre).cloned().collect();
        let removed_packages: Vec<String> = pre.difference(&post).cloned().collect();

        let decision = if !self.expect_new.is_empty() {
            let all_present = self.expect_new.iter().all(|p| new_packages.contains(p));
            Decision::conclusive(all_present, "expected new packages compared against diff")
        } else if self.forbid_new {
            Decision::conclusive(new_packages.is_empty(), "no-new-packages policy evaluated")
        } else {
            Decision::conclusive(true, "package diff computed")
        };

        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, "pm list packages", SNAPSHOT_TIMEOUT_MS)],
            &json!({
                "new_packages": new_packages.clone(),
                "removed_packages": removed_packages.clone(),
                "post_count": post.len(),
            }),
            json!({
                "new_packages": new_packages,
                "removed_packages": removed_packages,
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl PackageSnapshotOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "pre/post snapshot pair; a post-only listing cannot fabricate the baseline".to_string(),
        ]
    }
}

pub fn make_package_snapshot(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(PackageSnapshotOracle {
        forbid_new: bool_param(params, "forbid_new", false),
        expect_new: str_list_param(params, "expect_new"),
        pre_packages: None,
    }))
}

fn parse_settings_list(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once('=')?;
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Settings diff across namespaces.
pub struct SettingsSnapshotOracle {
    namespaces: Vec<String>,
    pre_settings: Option<BTreeMap<String, BTreeMap<String, String>>>,
}

impl SettingsSnapshotOracle {
    fn capture(
        &self,
        ctx: &mut OracleContext<'_>,
    ) -> HarnessResult<(Vec<String>, Option<BTreeMap<String, BTreeMap<String, String>>>)> {
        let mut cmds = Vec::new();
        let mut all: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut failed = false;
        for ns in &self.namespaces {
            let cmd = format!("settings list {ns}");
            let out = ctx
                .device
                .run_shell(&cmd, ctx.deadline.sub_deadline(SNAPSHOT_TIMEOUT_MS))?;
            if out.ok() {
                all.insert(ns.clone(), parse_settings_list(&out.stdout));
            } else {
                failed = true;
            }
            cmds.push(cmd);
        }
        Ok((cmds, if failed { None } else { Some(all) }))
    }

    fn notes(&self) -> Vec<String> {
        vec!["pre/post snapshot pair over explicit namespaces".to_string()]
    }
}

impl Oracle for SettingsSnapshotOracle {
    fn name(&self) -> &str {
        "settings_snapshot"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let (cmds, captured) = self.capture(ctx)?;
        self.pre_settings = captured;
        let decision = if self.pre_settings.is_some() {
            Decision::conclusive(true, "settings baseline captured")
        } else {
            Decision::inconclusive("settings list failed during pre_check")
        };
        let queries = cmds
            .iter()
            .map(|cmd| shell_query(&serial, cmd, SNAPSHOT_TIMEOUT_MS))
            .collect();
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Pre,
            queries,
            &json!({ "namespaces": self.namespaces.clone(), "snapshot": self.pre_settings.clone() }),
            json!({
                "namespaces": self.namespaces.clone(),
                "captured": self.pre_settings.is_some(),
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let (cmds, captured) = self.capture(ctx)?;
        let queries: Vec<_> = cmds
            .iter()
            .map(|cmd| shell_query(&serial, cmd, SNAPSHOT_TIMEOUT_MS))
            .collect();
        let (Some(pre), Some(post)) = (&self.pre_settings, &captured) else {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                queries,
                &json!({ "missing": ["snapshot_pair"] }),
                json!({ "missing": "snapshot_pair" }),
                Decision::inconclusive("missing pre or post settings snapshot"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        };

        let mut changed: Vec<Value> = Vec::new();
        for ns in &self.namespaces {
            let empty = BTreeMap::new();
            let pre_ns = pre.get(ns).unwrap_or(&empty);
            let post_ns = post.get(ns).unwrap_or(&empty);
            let keys: BTreeSet<&String> = pre_ns.keys().chain(post_ns.keys()).collect();
            for key in keys {
                let before = pre_ns.get(key);
                let after = post_ns.get(key);
                if before != after {
                    changed.push(json!({
                        "namespace": ns,
                        "key": key,
                        "before": before,
                        "after": after,
                    }));
                }
            }
        }
        let decision = Decision::conclusive(true, format!("{} changed key(s)", changed.len()));
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            queries,
            &json!({ "changed": changed.clone() }),
            json!({ "changed": changed }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_settings_snapshot(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let mut namespaces = str_list_param(params, "namespaces");
    if namespaces.is_empty() {
        namespaces = vec![
            "global".to_string(),
            "secure".to_string(),
            "system".to_string(),
        ];
    }
    Ok(Box::new(SettingsSnapshotOracle {
        namespaces,
        pre_settings: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_list_parse() {
        let stdout = "package:com.android.dialer\npackage:com.android.settings\njunk\n";
        let packages = parse_package_list(stdout);
        assert_eq!(packages.len(), 2);
        assert!(packages.contains("com.android.dialer"));
    }

    #[test]
    fn settings_list_parse() {
        let stdout = "adb_enabled=1\nbluetooth_on=0\nbroken-line\n";
        let settings = parse_settings_list(stdout);
        assert_eq!(settings.get("adb_enabled").map(String::as_str), Some("1"));
        assert_eq!(settings.len(), 2);
    }
}
