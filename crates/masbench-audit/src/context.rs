// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

use masbench_core::profile::EnvProfile;
use masbench_core::spec::{AttackSpec, CaseBundle, EvalSpec, PolicySpec};

/// Case-side inputs the audit layer needs: policy and eval drive assertion
/// parameters, the success-oracle id selects which oracle events count as
/// the task verdict.
#[derive(Debug, Clone)]
pub struct CaseContext {
    pub case_id: String,
    pub impact_level: String,
    pub success_oracle: String,
    pub policy: PolicySpec,
    pub eval: EvalSpec,
    pub attack: Option<AttackSpec>,
    pub env_profile: EnvProfile,
}

impl CaseContext {
    pub fn from_bundle(bundle: &CaseBundle, env_profile: EnvProfile) -> Self {
        Self {
            case_id: bundle.task.case_id.clone(),
            impact_level: bundle.task.impact_level.as_str().to_string(),
            success_oracle: bundle.task.success_oracle.oracle.clone(),
            policy: bundle.policy.clone(),
            eval: bundle.eval.clone(),
            attack: bundle.attack.clone(),
            env_profile,
        }
    }

    pub fn canary_token_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .eval
            .canary
            .as_ref()
            .map(|c| {
                c.tokens
                    .iter()
                    .map(|t| masbench_core::digest::token_hash_prefix(t.trim()))
                    .collect()
            })
            .unwrap_or_default();
        hashes.sort();
        hashes.dedup();
        hashes
    }

    pub fn canary_authorized_sinks(&self) -> Vec<String> {
        let mut sinks: Vec<String> = self
            .eval
            .canary
            .as_ref()
            .map(|c| c.authorized_sinks.clone())
            .unwrap_or_default();
        sinks.sort();
        sinks.dedup();
        sinks
    }
}
