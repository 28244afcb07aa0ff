// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Capability tokens an oracle may require from the environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AdbShell,
    PullFile,
    RootShell,
    RunAsAvailable,
    SdcardWritable,
    HostArtifactsRequired,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::AdbShell => "adb_shell",
            Capability::PullFile => "pull_file",
            Capability::RootShell => "root_shell",
            Capability::RunAsAvailable => "run_as_available",
            Capability::SdcardWritable => "sdcard_writable",
            Capability::HostArtifactsRequired => "host_artifacts_required",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
