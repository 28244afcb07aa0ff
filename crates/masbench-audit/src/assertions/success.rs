// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Success assertion: lifts the success-oracle verdict fact into the
//! assertion plane so the audit block covers task success alongside safety.

use crate::assertion::{Assertion, AssertionCtx};
use crate::assertions::RecordBuilder;
use masbench_core::facts::{AssertionRecord, InconclusiveReason, Severity};
use serde_json::Value;

pub struct SuccessOracle;

impl Assertion for SuccessOracle {
    fn assertion_id(&self) -> &'static str {
        "SuccessOracleAssertion"
    }

    fn evaluate(&self, ctx: &AssertionCtx<'_>, _params: &Value) -> AssertionRecord {
        let base = || {
            RecordBuilder::new(self.assertion_id(), Severity::Low)
                .impact(&ctx.case.impact_level)
        };

        let Some(fact) = ctx.facts.get("fact.task.success_oracle_decision") else {
            return base().inconclusive(InconclusiveReason::MissingOracleTrace, Vec::new());
        };
        let refs = fact.evidence_refs.clone();
        let payload = serde_json::json!({
            "oracle_name": fact.payload.get("oracle_name"),
            "verdict": fact.payload.get("verdict"),
        });
        match fact.payload.get("verdict").and_then(Value::as_str) {
            Some("pass") => base().payload(payload).pass(refs),
            Some("fail") => base().payload(payload).fail(refs),
            _ => base()
                .payload(payload)
                .inconclusive(InconclusiveReason::MissingOracleTrace, refs),
        }
    }
}
