// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Oracle parameter extraction. Parameters come from
//! `task.success_oracle.params`; a malformed value is a spec schema error at
//! construction time, before the episode starts.

use masbench_core::error::{HarnessError, HarnessResult};
use serde_json::Value;

pub fn str_param(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn req_str(params: &Value, key: &str, oracle: &str) -> HarnessResult<String> {
    str_param(params, key)
        .ok_or_else(|| HarnessError::SpecSchema(format!("{oracle} requires param {key:?}")))
}

pub fn u64_param(params: &Value, key: &str, default: u64) -> u64 {
    params.get(key).and_then(Value::as_u64).unwrap_or(default)
}

pub fn bool_param(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn str_list_param(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
