// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Settings and device-state oracles: `settings_check` (namespace+key with a
//! pre-phase baseline), `device_time` (clock sanity) and `boot_health` (the
//! infra probe the runner fail-fasts on).

use crate::context::{make_event, missing_capability_event, shell_query, OracleContext};
use crate::oracle::Oracle;
use crate::params::{req_str, str_param, u64_param};
use masbench_core::caps::Capability;
use masbench_core::error::{HarnessError, HarnessResult};
use masbench_core::evidence::records::{Decision, OracleEventRecord, OraclePhase, OracleType};
use masbench_core::timewin::{host_utc_ms, probe_device_epoch_time_ms};
use serde_json::{json, Value};

const SETTINGS_NAMESPACES: &[&str] = &["global", "system", "secure"];
const SHELL_TIMEOUT_MS: u64 = 5_000;

pub struct SettingsCheckOracle {
    namespace: String,
    key: String,
    expected: Option<String>,
    pre_value: Option<String>,
}

impl SettingsCheckOracle {
    fn get_value(&self, ctx: &mut OracleContext<'_>) -> HarnessResult<(String, Option<String>)> {
        let cmd = format!("settings get {} {}", self.namespace, self.key);
        let out = ctx
            .device
            .run_shell(&cmd, ctx.deadline.sub_deadline(SHELL_TIMEOUT_MS))?;
        if !out.ok() {
            return Ok((cmd, None));
        }
        let value = out.stdout.trim().to_string();
        let value = if value == "null" { String::new() } else { value };
        Ok((cmd, Some(value)))
    }

    fn notes(&self) -> Vec<String> {
        vec![
            "pre_value baseline captured before the episode; a post-only read cannot fake a change".to_string(),
        ]
    }
}

impl Oracle for SettingsCheckOracle {
    fn name(&self) -> &str {
        "settings_check"
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
                vec![shell_query(&serial, "settings get", SHELL_TIMEOUT_MS)],
                missing,
                &self.capabilities_required(),
            )?]);
        }
        let (cmd, value) = self.get_value(ctx)?;
        self.pre_value = value.clone();
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Pre,
            vec![shell_query(&serial, &cmd, SHELL_TIMEOUT_MS)],
            &json!({
                "namespace": self.namespace.clone(),
                "key": self.key.clone(),
                "pre_value": value.clone(),
            }),
            json!({ "pre_value": value.clone() }),
            match &value {
                Some(_) => Decision::conclusive(true, "baseline captured"),
                None => Decision::inconclusive("settings query failed during pre_check"),
            },
            self.notes(),
            &self.capabilities_required(),
        )?])
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let (cmd, value) = self.get_value(ctx)?;
        let decision = match (&value, &self.expected) {
            (None, _) => Decision::inconclusive("settings query failed"),
            (Some(actual), Some(expected)) => {
                if actual == expected {
                    Decision::conclusive(true, "value matched expected")
                } else {
                    Decision::conclusive(
                        false,
                        format!("value mismatch (expected vs actual differ, lengths {}/{})",
                            expected.len(), actual.len()),
                    )
                }
            }
            (Some(actual), None) => match &self.pre_value {
                Some(pre) if pre != actual => Decision::conclusive(true, "value changed from baseline"),
                Some(_) => Decision::conclusive(false, "value unchanged from baseline"),
                None => Decision::inconclusive("no baseline captured"),
            },
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, &cmd, SHELL_TIMEOUT_MS)],
            &json!({
                "namespace": self.namespace.clone(),
                "key": self.key.clone(),
                "pre_value": self.pre_value.clone(),
                "post_value": value.clone(),
                "expected": self.expected.clone(),
            }),
            json!({
                "namespace": self.namespace.clone(),
                "key": self.key.clone(),
                "pre_value": self.pre_value.clone(),
                "post_value": value.clone(),
                "matched": decision.success,
            }),
            decision,
            self.notes(),
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_settings_check(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    let namespace = req_str(params, "namespace", "settings_check")?;
    if !SETTINGS_NAMESPACES.contains(&namespace.as_str()) {
        return Err(HarnessError::SpecSchema(format!(
            "settings_check namespace must be global|system|secure, got {namespace:?}"
        )));
    }
    Ok(Box::new(SettingsCheckOracle {
        namespace,
        key: req_str(params, "key", "settings_check")?,
        expected: str_param(params, "expected"),
        pre_value: None,
    }))
}

/// Clock sanity: the device epoch must be probeable and within a bounded
/// skew of the host clock, otherwise every time-windowed oracle downstream
/// is suspect.
pub struct DeviceTimeOracle {
    max_skew_ms: u64,
}

impl Oracle for DeviceTimeOracle {
    fn name(&self) -> &str {
        "device_time"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let device_ms = probe_device_epoch_time_ms(ctx.device, ctx.deadline)?;
        let host_ms = host_utc_ms();
        let decision = match device_ms {
            None => Decision::inconclusive("device clock probe failed"),
            Some(device_ms) => {
                let skew = device_ms.abs_diff(host_ms);
                if skew <= self.max_skew_ms {
                    Decision::conclusive(true, format!("clock skew {skew}ms within bound"))
                } else {
                    Decision::conclusive(false, format!("clock skew {skew}ms exceeds bound"))
                }
            }
        };
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![shell_query(&serial, "date +%s%3N", 1500)],
            &json!({ "device_epoch_ms": device_ms, "host_utc_ms": host_ms }),
            json!({ "device_epoch_ms": device_ms, "host_utc_ms": host_ms }),
            decision,
            vec!["device clock read directly via shell; not agent-reported".to_string()],
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_device_time(params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(DeviceTimeOracle {
        max_skew_ms: u64_param(params, "max_skew_ms", 300_000),
    }))
}

/// Infra probe: boot completed, shell echo, storage writable. The runner
/// fail-fasts with `infra_failed` when this is unhealthy before the loop.
pub struct BootHealthOracle;

impl BootHealthOracle {
    fn probe(
        &self,
        ctx: &mut OracleContext<'_>,
    ) -> HarnessResult<(Vec<(String, bool)>, Vec<String>)> {
        let mut checks = Vec::new();
        let mut cmds = Vec::new();
        for (label, cmd, want) in [
            ("boot_completed", "getprop sys.boot_completed", Some("1")),
            ("shell_echo", "echo mas_health", Some("mas_health")),
            (
                "storage_writable",
                "touch /sdcard/.mas_health && rm /sdcard/.mas_health && echo ok",
                Some("ok"),
            ),
        ] {
            let out = ctx
                .device
                .run_shell(cmd, ctx.deadline.sub_deadline(SHELL_TIMEOUT_MS));
            let ok = match (&out, want) {
                (Ok(out), Some(want)) => out.ok() && out.stdout.trim() == want,
                (Ok(out), None) => out.ok(),
                (Err(_), _) => false,
            };
            checks.push((label.to_string(), ok));
            cmds.push(cmd.to_string());
        }
        Ok((checks, cmds))
    }
}

impl Oracle for BootHealthOracle {
    fn name(&self) -> &str {
        "boot_health"
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        vec![Capability::AdbShell]
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        self.check(ctx, OraclePhase::Pre)
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        self.check(ctx, OraclePhase::Post)
    }
}

impl BootHealthOracle {
    fn check(
        &mut self,
        ctx: &mut OracleContext<'_>,
        phase: OraclePhase,
    ) -> HarnessResult<Vec<OracleEventRecord>> {
        let serial = ctx.serial();
        let (checks, cmds) = self.probe(ctx)?;
        let healthy = checks.iter().all(|(_, ok)| *ok);
        let failed: Vec<&str> = checks
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(label, _)| label.as_str())
            .collect();
        let decision = if healthy {
            Decision::conclusive(true, "device healthy")
        } else {
            Decision::conclusive(false, format!("unhealthy: {}", failed.join(",")))
        };
        let queries = cmds
            .iter()
            .map(|cmd| shell_query(&serial, cmd, SHELL_TIMEOUT_MS))
            .collect();
        let checks_json = json!(checks);
        Ok(vec![make_event(
            self.name(),
            self.oracle_type(),
            phase,
            queries,
            &json!({ "checks": checks_json.clone() }),
            json!({ "healthy": healthy, "checks": checks_json }),
            decision,
            vec!["health probed via direct shell round-trips".to_string()],
            &self.capabilities_required(),
        )?])
    }
}

pub fn make_boot_health(_params: &Value) -> HarnessResult<Box<dyn Oracle>> {
    Ok(Box::new(BootHealthOracle))
}
