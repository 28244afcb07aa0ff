// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Environment capability probing. Runs once per episode before the oracle
//! pre phase; the result is written to `env_capabilities.json` and gates
//! every capability-requiring oracle.

use masbench_core::caps::Capability;
use masbench_core::device::{Deadline, DeviceControl};
use masbench_core::error::HarnessResult;
use masbench_core::evidence::manifest::EnvCapabilities;
use masbench_core::evidence::records::PACK_SCHEMA_VERSION;
use masbench_core::timewin::host_utc_ms;
use std::path::Path;

const PROBE_TIMEOUT_MS: u64 = 5_000;

pub fn probe_env_capabilities(
    device: &mut dyn DeviceControl,
    artifacts_root: Option<&Path>,
    deadline: Deadline,
) -> HarnessResult<EnvCapabilities> {
    let mut caps = EnvCapabilities {
        schema_version: PACK_SCHEMA_VERSION.to_string(),
        probed_at_ms: host_utc_ms(),
        ..EnvCapabilities::default()
    };

    let shell_ok = device
        .run_shell("echo mas_probe", deadline.sub_deadline(PROBE_TIMEOUT_MS))
        .map(|out| out.ok() && out.stdout.trim() == "mas_probe")
        .unwrap_or(false);
    caps.set(Capability::AdbShell, shell_ok);

    let pull_ok = shell_ok
        && device
            .pull("/proc/version", deadline.sub_deadline(PROBE_TIMEOUT_MS))
            .map(|bytes| !bytes.is_empty())
            .unwrap_or(false);
    caps.set(Capability::PullFile, pull_ok);

    let root_ok = shell_ok
        && device
            .run_shell("su 0 id", deadline.sub_deadline(PROBE_TIMEOUT_MS))
            .map(|out| out.ok() && out.stdout.contains("uid=0"))
            .unwrap_or(false);
    caps.set(Capability::RootShell, root_ok);

    let run_as_ok = shell_ok
        && device
            .run_shell(
                "run-as com.android.shell id",
                deadline.sub_deadline(PROBE_TIMEOUT_MS),
            )
            .map(|out| out.ok())
            .unwrap_or(false);
    caps.set(Capability::RunAsAvailable, run_as_ok);

    let sdcard_ok = shell_ok
        && device
            .run_shell(
                "touch /sdcard/.mas_probe && rm /sdcard/.mas_probe && echo ok",
                deadline.sub_deadline(PROBE_TIMEOUT_MS),
            )
            .map(|out| out.ok() && out.stdout.trim() == "ok")
            .unwrap_or(false);
    caps.set(Capability::SdcardWritable, sdcard_ok);

    caps.set(
        Capability::HostArtifactsRequired,
        artifacts_root.is_some_and(Path::is_dir),
    );

    Ok(caps)
}
