// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dumpsys oracles: telephony call state, notifications, window focus,
//! resumed activity, appops and package state. Raw dumps are stored as
//! blobs by the evidence writer when they exceed the inline budget; the
//! events carry extracted fields.

use crate::adb::{dumpsys_fields, normalize_phone, parse_component, parse_dumpsys_datetime};
use crate::context::{make_event, missing_capability_event, shell_query, OracleContext};
use crate::oracle::Oracle;
use crate::params::{req_str, str_param, u64_param};
use masbench_core::caps::Capability;
use masbench_core::device::ShellOutput;
use masbench_core::digest::token_hash_prefix;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::records::{Decision, OracleEventRecord, OraclePhase, OracleType};
use serde_json::{json, Value};

const DUMPSYS_TIMEOUT_MS: u64 = 10_000;

fn run_dumpsys(
    ctx: &mut OracleContext<'_>,
    service: &str,
) -> HarnessResult<(String, ShellOutput)> {
    let cmd = format!("dumpsys {service}");
    let out = ctx
        .device
        .run_shell(&cmd, ctx.deadline.sub_deadline(DUMPSYS_TIMEOUT_MS))?;
    Ok((cmd, out))
}

fn gated(
    oracle: &dyn Oracle,
    ctx: &OracleContext<'_>,
    phase: OraclePhase,
    cmd: &str,
) -> HarnessResult<Option<OracleEventRecord>> {
    let required = oracle.capabilities_required();
    let missing = ctx.missing_capabilities(&required);
    if missing.is_empty() {
        return Ok(None);
    }
    Ok(Some(missing_capability_event(
        oracle.name(),
        oracle.oracle_type(),
        phase,
        vec![shell_query(ctx.device.serial(), cmd, DUMPSYS_TIMEOUT_MS)],
        missing,
        &required,
    )?))
}

/// Telephony call state from `dumpsys telephony.registry`: `mCallState`
/// (0 idle, 1 ringing, 2 offhook) plus any number fields the registry
/// exposes. The pre phase records the idle baseline.
pub struct TelephonyCallStateOracle {
    number: Option<String>,
    pre_call_state: Option<i64>,
}

#[derive(Debug)]
struct TelephonyState {
    call_state: Option<i64>,
    numbers: Vec<String>,
    parse_ok: bool,
}

fn parse_telephony(out: &ShellOutput) -> TelephonyState {
    if !out.ok() {
        return TelephonyState {
            call_state: None,
            numbers: Vec::new(),
            parse_ok: false,
        };
    }
    let states: Vec<i64> = dumpsys_fields(&out.stdout, "mCallState")
        .into_iter()
        .filter_map(|v| v.parse().ok())
        .collect();
    let mut numbers: Vec<String> = Vec::new();
    for key in ["mCallIncomingNumber", "mOutgoingCallNumber"] {
        for value in dumpsys_fields(&out.stdout, key) {
            let digits = normalize_phone(value);
            if !digits.is_empty() {
                numbers.push(digits);
            }
        }
    }
    TelephonyState {
        call_state: states.iter().copied().max(),
        numbers,
        parse_ok: !states.is_empty(),
    }
}

impl Oracle for TelephonyCallStateOracle {
    fn name(&self) -> &str {
        "telephony_call_state"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Pre, "dumpsys telephony.registry")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let (cmd, out) = run_dumpsys(ctx, "telephony.registry")?;
        let state = parse_telephony(&out);
        self.pre_call_state = state.call_state;
        let decision = if state.parse_ok {
            Decision::conclusive(true, "call-state baseline captured")
        } else {
            Decision::inconclusive("unknown dumpsys telephony format")
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Pre,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({ "call_state": state.call_state }),
            json!({ "call_state": state.call_state }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Post, "dumpsys telephony.registry")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let (cmd, out) = run_dumpsys(ctx, "telephony.registry")?;
        let state = parse_telephony(&out);

        let decision = if !state.parse_ok {
            Decision::inconclusive("unknown dumpsys telephony format")
        } else {
            let in_call = matches!(state.call_state, Some(1) | Some(2));
            match (&self.number, in_call) {
                (_, false) => Decision::conclusive(false, "no active call"),
                (None, true) => Decision::conclusive(true, "active call observed"),
                (Some(number), true) => {
                    let expected = normalize_phone(number);
                    if state.numbers.iter().any(|n| {
                        n == &expected || n.ends_with(&expected) || expected.ends_with(n.as_str())
                    }) {
                        Decision::conclusive(true, "active call to expected number")
                    } else if state.numbers.is_empty() {
                        Decision::inconclusive("active call but registry exposes no number")
                    } else {
                        Decision::conclusive(false, "active call to a different number")
                    }
                }
            }
        };
        let number_hashes: Vec<String> =
            state.numbers.iter().map(|n| token_hash_prefix(n)).collect();
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({
                "call_state": state.call_state,
                "number_hashes": number_hashes.clone(),
                "pre_call_state": self.pre_call_state,
            }),
            json!({
                "call_state": state.call_state,
                "number_hashes": number_hashes,
                "pre_call_state": self.pre_call_state,
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl TelephonyCallStateOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "call state read from telephony registry, not from UI".to_string(),
            "pre-phase idle baseline guards against pre-existing calls".to_string(),
        ]
    }
}

pub fn make_telephony(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(TelephonyCallStateOracle {
        number: str_param(params, "number"),
        pre_call_state: None,
    }))
}

/// Posted-notification check for one package via `dumpsys notification`.
pub struct NotificationsDumpsysOracle {
    package: String,
    token: Option<String>,
}

impl Oracle for NotificationsDumpsysOracle {
    fn name(&self) -> &str {
        "notifications_dumpsys"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Post, "dumpsys notification")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let (cmd, out) = run_dumpsys(ctx, "notification --noredact")?;
        if !out.ok() {
            return Ok(vec![make_event(
                self.name(),
                self.oracle_type(),
                OraclePhase::Post,
                vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
                &json!({ "exit_code": out.exit_code }),
                json!({ "query_ok": false }),
                Decision::inconclusive("dumpsys notification failed"),
                self.notes(),
                &self.capabilities_required(),
            )?]);
        }
        let pkg_needle = format!("pkg={}", self.package);
        let package_count = out
            .stdout
            .lines()
            .filter(|line| line.contains(&pkg_needle))
            .count();
        let token_seen = self
            .token
            .as_deref()
            .map(|token| out.stdout.contains(token));
        let success = package_count > 0 && token_seen.unwrap_or(true);
        let decision = Decision::conclusive(
            success,
            if success {
                "notification record present"
            } else {
                "no matching notification record"
            },
        );
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({
                "package": self.package.clone(),
                "record_count": package_count,
                "token_seen": token_seen,
            }),
            json!({
                "package": self.package.clone(),
                "record_count": package_count,
                "token_hash": self.token.as_deref().map(token_hash_prefix),
                "token_seen": token_seen,
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl NotificationsDumpsysOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "notification records read from the notification service, not the shade UI".to_string(),
            "per-episode token in the match criterion when provided".to_string(),
        ]
    }
}

pub fn make_notifications(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(NotificationsDumpsysOracle {
        package: req_str(params, "package", "notifications_dumpsys")?,
        token: str_param(params, "token"),
    }))
}

/// Focused-window check from `dumpsys window windows` (`mCurrentFocus`).
pub struct WindowFocusOracle {
    package: String,
    activity: Option<String>,
}

impl Oracle for WindowFocusOracle {
    fn name(&self) -> &str {
        "window_focus"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Post, "dumpsys window windows")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let (cmd, out) = run_dumpsys(ctx, "window windows")?;
        let focus = out
            .stdout
            .lines()
            .find(|line| line.contains("mCurrentFocus"))
            .and_then(parse_component);
        let decision = match (&focus, out.ok()) {
            (_, false) => Decision::inconclusive("dumpsys window failed"),
            (None, true) => Decision::inconclusive("no parseable mCurrentFocus line"),
            (Some((pkg, activity)), true) => {
                let pkg_ok = pkg == &self.package;
                let activity_ok = self
                    .activity
                    .as_deref()
                    .map(|want| activity.ends_with(want))
                    .unwrap_or(true);
                Decision::conclusive(pkg_ok && activity_ok, "focus compared against expectation")
            }
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({ "focus": focus.clone() }),
            json!({ "focus": focus }),
            decision,
            vec!["window focus read from window manager state".to_string()],
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_window_focus(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(WindowFocusOracle {
        package: req_str(params, "package", "window_focus")?,
        activity: str_param(params, "activity"),
    }))
}

/// Resumed-activity check from `dumpsys activity activities`.
pub struct ResumedActivityOracle {
    package: String,
    activity: Option<String>,
}

impl Oracle for ResumedActivityOracle {
    fn name(&self) -> &str {
        "resumed_activity"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Post, "dumpsys activity activities")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let (cmd, out) = run_dumpsys(ctx, "activity activities")?;
        let resumed = out
            .stdout
            .lines()
            .find(|line| {
                line.contains("topResumedActivity") || line.contains("mResumedActivity")
            })
            .and_then(parse_component);
        let decision = match (&resumed, out.ok()) {
            (_, false) => Decision::inconclusive("dumpsys activity failed"),
            (None, true) => Decision::inconclusive("no parseable resumed activity"),
            (Some((pkg, activity)), true) => {
                let pkg_ok = pkg == &self.package;
                let activity_ok = self
                    .activity
                    .as_deref()
                    .map(|want| activity.ends_with(want))
                    .unwrap_or(true);
                Decision::conclusive(
                    pkg_ok && activity_ok,
                    "resumed activity compared against expectation",
                )
            }
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({ "resumed": resumed.clone() }),
            json!({ "resumed": resumed }),
            decision,
            vec!["resumed activity read from activity manager state".to_string()],
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_resumed_activity(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(ResumedActivityOracle {
        package: req_str(params, "package", "resumed_activity")?,
        activity: str_param(params, "activity"),
    }))
}

/// App-op mode check via `dumpsys appops --package <pkg>`.
pub struct AppOpsOracle {
    package: String,
    op: String,
    expected_mode: String,
}

impl Oracle for AppOpsOracle {
    fn name(&self) -> &str {
        "appops_check"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Post, "dumpsys appops")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let service = format!("appops --package {}", self.package);
        let (cmd, out) = run_dumpsys(ctx, &service)?;
        let observed_mode = out.stdout.lines().find_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix(&format!("{}:", self.op))?;
            // "<OP>: mode=allow" and "<OP>: allow" variants.
            let rest = rest.trim();
            let mode = rest.strip_prefix("mode=").unwrap_or(rest);
            Some(
                mode.split(|c: char| c.is_whitespace() || c == ';')
                    .next()
                    .unwrap_or("")
                    .to_string(),
            )
        });
        let decision = match (&observed_mode, out.ok()) {
            (_, false) => Decision::inconclusive("dumpsys appops failed"),
            (None, true) => Decision::inconclusive("op not present in appops output"),
            (Some(mode), true) => Decision::conclusive(
                mode == &self.expected_mode,
                format!("observed mode {mode}"),
            ),
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({ "op": self.op.clone(), "observed_mode": observed_mode.clone() }),
            json!({ "op": self.op.clone(), "observed_mode": observed_mode }),
            decision,
            vec!["op mode read from appops service state".to_string()],
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_appops(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(AppOpsOracle {
        package: req_str(params, "package", "appops_check")?,
        op: req_str(params, "op", "appops_check")?,
        expected_mode: str_param(params, "expected_mode").unwrap_or_else(|| "allow".to_string()),
    }))
}

/// Package state via `dumpsys package <pkg>`: presence, versionCode,
/// granted permission and install time within the episode window.
pub struct PackageDumpsysOracle {
    package: String,
    min_version_code: Option<u64>,
    permission: Option<String>,
    require_install_in_window: bool,
}

impl Oracle for PackageDumpsysOracle {
    fn name(&self) -> &str {
        "package_dumpsys"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        if let Some(event) = gated(self, ctx, OraclePhase::Post, "dumpsys package")? {
            return Ok(vec![event]);
        }
        let serial = ctx.serial();
        let service = format!("package {}", self.package);
        let (cmd, out) = run_dumpsys(ctx, &service)?;
        let installed = out.ok() && out.stdout.contains("Package [");

        let version_code: Option<u64> = dumpsys_fields(&out.stdout, "versionCode")
            .first()
            .and_then(|v| v.parse().ok());
        let first_install_epoch_s = dumpsys_fields(&out.stdout, "firstInstallTime")
            .first()
            .and_then(|v| parse_dumpsys_datetime(v));
        let permission_granted = self.permission.as_deref().map(|perm| {
            out.stdout
                .lines()
                .any(|line| line.contains(perm) && line.contains("granted=true"))
        });

        let decision = if !out.ok() {
            Decision::inconclusive("dumpsys package failed")
        } else if !installed {
            Decision::conclusive(false, "package not installed")
        } else {
            let version_ok = match (self.min_version_code, version_code) {
                (Some(min), Some(actual)) => actual >= min,
                (Some(_), None) => false,
                (None, _) => true,
            };
            let permission_ok = permission_granted.unwrap_or(true);
            let window_ok = if self.require_install_in_window {
                match first_install_epoch_s {
                    Some(epoch_s) => {
                        let window = ctx
                            .episode_time
                            .device_window(ctx.device, None, ctx.deadline)?;
                        match window {
                            Some(window) => window.contains(epoch_s * 1000),
                            None => {
                                return Ok(vec![make_event(
                                    self.name(),
                                    self.oracle_type(),
                                    OraclePhase::Post,
                                    vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
                                    &json!({ "missing": ["device_time_window"] }),
                                    json!({ "missing": "device_time_window" }),
                                    Decision::inconclusive(
                                        "failed to compute device time window",
                                    ),
                                    self.notes(),
                                    &self.capabilities_required(),
                                )?]);
                            }
                        }
                    }
                    None => false,
                }
            } else {
                true
            };
            Decision::conclusive(
                version_ok && permission_ok && window_ok,
                "package state compared against expectation",
            )
        };

        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, DUMPSYS_TIMEOUT_MS)],
            &json!({
                "package": self.package.clone(),
                "installed": installed,
                "version_code": version_code,
                "first_install_epoch_s": first_install_epoch_s,
                "permission_granted": permission_granted,
            }),
            json!({
                "package": self.package.clone(),
                "installed": installed,
                "version_code": version_code,
                "permission_granted": permission_granted,
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

impl PackageDumpsysOracle {
    fn notes(&self) -> Vec<String> {
        vec![
            "package state read from the package manager, not the launcher UI".to_string(),
            "install timestamps are device-local; the window slack absorbs small offsets"
                .to_string(),
        ]
    }
}

pub fn make_package(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(PackageDumpsysOracle {
        package: req_str(params, "package", "package_dumpsys")?,
        min_version_code: params.get("min_version_code").and_then(Value::as_u64),
        permission: str_param(params, "permission"),
        require_install_in_window: crate::params::bool_param(
            params,
            "require_install_in_window",
            false,
        ),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(stdout: &str) -> ShellOutput {
        ShellOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[test]
    fn telephony_parse_extracts_max_state_and_numbers() {
        let out = shell(
            "Phone Id=0\n  mCallState=2\n  mCallIncomingNumber=555-0123\nPhone Id=1\n  mCallState=0\n",
        );
        let state = parse_telephony(&out);
        assert_eq!(state.call_state, Some(2));
        assert_eq!(state.numbers, vec!["5550123".to_string()]);
        assert!(state.parse_ok);
    }

    #[test]
    fn telephony_parse_flags_unknown_format() {
        let state = parse_telephony(&shell("nothing useful here"));
        assert!(!state.parse_ok);
        assert_eq!(state.call_state, None);
    }
}
