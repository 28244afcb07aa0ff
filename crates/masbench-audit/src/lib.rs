// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! masbench-audit
//!
//! Audit-first evaluation over a sealed evidence pack:
//! - the Detector Engine derives typed, digest-stable facts with evidence
//!   references back into the trace files
//! - the Assertion Engine merges the policy-compiled baseline with eval
//!   overrides and evaluates each assertion into PASS/FAIL/INCONCLUSIVE

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod assertion;
pub mod assertions;
pub mod context;
pub mod detector;
pub mod detectors;
pub mod store;

use masbench_core::error::HarnessResult;
use masbench_core::evidence::manifest::AuditBlock;
use masbench_core::evidence::pack::SealedPack;
use masbench_core::facts::{AssertionRecord, Fact};
use masbench_core::policy::AssertionConfig;

pub use crate::assertion::{merge_enabled, run_assertions, Assertion, MergeItem};
pub use crate::context::CaseContext;
pub use crate::detector::{builtin_detectors, load_facts, run_detectors, Detector};
pub use crate::store::FactStore;

/// Detectors then assertions over one sealed pack.
pub fn run_audit(
    pack: &SealedPack,
    ctx: &CaseContext,
    baseline: &[AssertionConfig],
) -> HarnessResult<(Vec<Fact>, Vec<AssertionRecord>, AuditBlock)> {
    let detectors = builtin_detectors();
    let facts = run_detectors(pack, ctx, &detectors)?;
    let store = FactStore::new(facts.clone())?;
    let (enabled, sources) = merge_enabled(baseline, &ctx.eval);
    let (records, audit) = run_assertions(pack, ctx, &enabled, &sources, &store)?;
    Ok((facts, records, audit))
}
