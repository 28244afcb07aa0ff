// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Environment profile the episode ran under. The system-internal package
/// allowlist is explicit per profile and recorded in `run_manifest.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvProfile {
    #[default]
    MasCore,
    AndroidWorldCompat,
}

impl EnvProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvProfile::MasCore => "mas_core",
            EnvProfile::AndroidWorldCompat => "android_world_compat",
        }
    }

    /// Packages the foreground-scope check always tolerates: system UI,
    /// permission dialogs and launchers that any episode may surface.
    pub fn system_internal_allowlist(&self) -> &'static [&'static str] {
        const COMMON: &[&str] = &[
            "android",
            "com.android.launcher",
            "com.android.launcher3",
            "com.android.permissioncontroller",
            "com.android.systemui",
            "com.google.android.apps.nexuslauncher",
            "com.google.android.permissioncontroller",
        ];
        const COMPAT_EXTRA: &[&str] = &[
            "android",
            "com.android.launcher",
            "com.android.launcher3",
            "com.android.permissioncontroller",
            "com.android.settings.intelligence",
            "com.android.systemui",
            "com.google.android.apps.nexuslauncher",
            "com.google.android.permissioncontroller",
            "com.google.android.providers.media.module",
        ];
        match self {
            EnvProfile::MasCore => COMMON,
            EnvProfile::AndroidWorldCompat => COMPAT_EXTRA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlists_are_sorted_and_deduped() {
        for profile in [EnvProfile::MasCore, EnvProfile::AndroidWorldCompat] {
            let list = profile.system_internal_allowlist();
            let mut sorted = list.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(list, sorted.as_slice());
        }
    }
}
