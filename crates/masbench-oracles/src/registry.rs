// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Compile-time oracle registration: a stable `id -> constructor` map. No
//! dynamic discovery; unknown ids surface as `oracle_inconclusive` at the
//! episode level rather than a crash.

use crate::composite::{CompositeMode, CompositeOracle};
use crate::oracle::Oracle;
use masbench_core::error::{HarnessError, HarnessResult};
use serde_json::Value;
use std::collections::BTreeMap;

pub type OracleCtor = fn(&Value) -> HarnessResult<Box<dyn Oracle>>;

pub const ALL_OF: &str = "all_of";
pub const ANY_OF: &str = "any_of";

pub struct OracleRegistry {
    ctors: BTreeMap<&'static str, OracleCtor>,
}

impl OracleRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("sms_provider", crate::providers::make_sms);
        registry.register("contacts_provider", crate::providers::make_contacts);
        registry.register("calendar_provider", crate::providers::make_calendar);
        registry.register("calllog_provider", crate::providers::make_calllog);
        registry.register("mediastore_provider", crate::providers::make_mediastore);
        registry.register("settings_check", crate::state::make_settings_check);
        registry.register("device_time", crate::state::make_device_time);
        registry.register("boot_health", crate::state::make_boot_health);
        registry.register("telephony_call_state", crate::dumpsys::make_telephony);
        registry.register("notifications_dumpsys", crate::dumpsys::make_notifications);
        registry.register("window_focus", crate::dumpsys::make_window_focus);
        registry.register("resumed_activity", crate::dumpsys::make_resumed_activity);
        registry.register("appops_check", crate::dumpsys::make_appops);
        registry.register("package_dumpsys", crate::dumpsys::make_package);
        registry.register("sdcard_json_receipt", crate::files::make_sdcard_json_receipt);
        registry.register("file_hash", crate::files::make_file_hash);
        registry.register(
            "notification_listener_receipt",
            crate::files::make_notification_listener_receipt,
        );
        registry.register("clipboard_receipt", crate::files::make_clipboard_receipt);
        registry.register("host_artifact_json", crate::host::make_host_artifact_json);
        registry.register("network_receipt", crate::host::make_network_receipt);
        registry.register("network_proxy", crate::host::make_network_proxy);
        registry.register("sqlite_pull_query", crate::sqlite::make_pull_query);
        registry.register("root_sqlite", crate::sqlite::make_root_query);
        registry.register("package_snapshot", crate::snapshot::make_package_snapshot);
        registry.register("settings_snapshot", crate::snapshot::make_settings_snapshot);
        registry
    }

    pub fn register(&mut self, id: &'static str, ctor: OracleCtor) {
        self.ctors.insert(id, ctor);
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self.ctors.keys().copied().collect();
        out.push(ALL_OF);
        out.push(ANY_OF);
        out.sort_unstable();
        out
    }

    pub fn contains(&self, id: &str) -> bool {
        id == ALL_OF || id == ANY_OF || self.ctors.contains_key(id)
    }

    pub fn make(&self, id: &str, params: &Value) -> HarnessResult<Box<dyn Oracle>> {
        match id {
            ALL_OF => self.make_composite(CompositeMode::AllOf, params),
            ANY_OF => self.make_composite(CompositeMode::AnyOf, params),
            _ => {
                let ctor = self.ctors.get(id).ok_or_else(|| {
                    HarnessError::SpecConflict(format!("unknown oracle id: {id}"))
                })?;
                ctor(params)
            }
        }
    }

    fn make_composite(
        &self,
        mode: CompositeMode,
        params: &Value,
    ) -> HarnessResult<Box<dyn Oracle>> {
        let children_spec = params
            .get("children")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                HarnessError::SpecSchema("composite oracle requires children[]".to_string())
            })?;
        if children_spec.is_empty() {
            return Err(HarnessError::SpecSchema(
                "composite oracle requires at least one child".to_string(),
            ));
        }
        let mut children = Vec::with_capacity(children_spec.len());
        for child in children_spec {
            let child_id = child
                .get("oracle")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    HarnessError::SpecSchema("composite child requires oracle id".to_string())
                })?;
            let child_params = child.get("params").cloned().unwrap_or(Value::Null);
            children.push(self.make(child_id, &child_params)?);
        }
        Ok(Box::new(CompositeOracle::new(mode, children)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_has_all_required_families() {
        let registry = OracleRegistry::builtin();
        for id in [
            "sms_provider",
            "contacts_provider",
            "calendar_provider",
            "calllog_provider",
            "mediastore_provider",
            "settings_check",
            "device_time",
            "boot_health",
            "telephony_call_state",
            "notifications_dumpsys",
            "window_focus",
            "resumed_activity",
            "appops_check",
            "package_dumpsys",
            "sdcard_json_receipt",
            "file_hash",
            "notification_listener_receipt",
            "clipboard_receipt",
            "host_artifact_json",
            "network_receipt",
            "network_proxy",
            "sqlite_pull_query",
            "root_sqlite",
            "package_snapshot",
            "settings_snapshot",
            "all_of",
            "any_of",
        ] {
            assert!(registry.contains(id), "missing oracle: {id}");
        }
    }

    #[test]
    fn unknown_oracle_id_is_a_spec_conflict() {
        let registry = OracleRegistry::builtin();
        let err = registry
            .make("made_up_oracle", &Value::Null)
            .err()
            .expect("must fail");
        assert!(matches!(err, HarnessError::SpecConflict(_)));
    }

    #[test]
    fn composite_requires_children() {
        let registry = OracleRegistry::builtin();
        assert!(registry.make(ALL_OF, &json!({})).is_err());
        assert!(registry.make(ALL_OF, &json!({"children": []})).is_err());
    }

    #[test]
    fn composite_builds_nested_children() {
        let registry = OracleRegistry::builtin();
        let oracle = registry
            .make(
                ALL_OF,
                &json!({"children": [
                    {"oracle": "package_snapshot", "params": {}},
                    {"oracle": "any_of", "params": {"children": [
                        {"oracle": "boot_health", "params": {}}
                    ]}}
                ]}),
            )
            .expect("composite");
        assert_eq!(oracle.name(), "all_of");
    }
}
