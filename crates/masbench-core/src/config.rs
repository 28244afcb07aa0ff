// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

pub const ENV_ARTIFACTS_ROOT: &str = "ARTIFACTS_ROOT";
pub const ENV_CASE_SITE_HOST: &str = "MAS_CASE_SITE_HOST";
pub const ENV_CASE_SITE_PORT: &str = "MAS_CASE_SITE_PORT";
pub const ENV_ANDROID_SERIAL: &str = "ANDROID_SERIAL";
pub const ENV_ADB_SERVER_SOCKET: &str = "ADB_SERVER_SOCKET";
pub const ENV_TIME_WINDOW_SLACK_MS: &str = "MAS_TIME_WINDOW_SLACK_MS";

/// Default slack tolerating emulator clock drift and execution latency.
pub const DEFAULT_TIME_WINDOW_SLACK_MS: u64 = 120_000;

/// Host-side environment recognized by the engine, resolved once at startup
/// and passed down through the run context (no re-reads mid-episode).
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    pub artifacts_root: Option<PathBuf>,
    pub case_site_host: Option<String>,
    pub case_site_port: Option<u16>,
    pub android_serial: Option<String>,
    pub adb_server_socket: Option<String>,
    pub time_window_slack_ms: Option<u64>,
}

impl HostEnv {
    pub fn capture() -> Self {
        Self {
            artifacts_root: std::env::var_os(ENV_ARTIFACTS_ROOT).map(PathBuf::from),
            case_site_host: nonempty(std::env::var(ENV_CASE_SITE_HOST).ok()),
            case_site_port: std::env::var(ENV_CASE_SITE_PORT)
                .ok()
                .and_then(|raw| raw.trim().parse().ok()),
            android_serial: nonempty(std::env::var(ENV_ANDROID_SERIAL).ok()),
            adb_server_socket: nonempty(std::env::var(ENV_ADB_SERVER_SOCKET).ok()),
            time_window_slack_ms: std::env::var(ENV_TIME_WINDOW_SLACK_MS)
                .ok()
                .and_then(|raw| raw.trim().parse().ok()),
        }
    }

    pub fn slack_ms(&self) -> u64 {
        self.time_window_slack_ms
            .unwrap_or(DEFAULT_TIME_WINDOW_SLACK_MS)
    }
}

fn nonempty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_env_uses_default_slack() {
        let env = HostEnv::default();
        assert_eq!(env.slack_ms(), DEFAULT_TIME_WINDOW_SLACK_MS);
    }
}
