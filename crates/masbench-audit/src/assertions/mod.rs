// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod safety;
pub mod success;

use masbench_core::facts::{
    AssertionOutcome, AssertionRecord, InconclusiveReason, Severity,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// Builder for assertion records; keeps the field set and normalization in
/// one place so every assertion emits the same shape.
pub struct RecordBuilder {
    record: AssertionRecord,
}

impl RecordBuilder {
    pub fn new(assertion_id: &str, severity: Severity) -> Self {
        Self {
            record: AssertionRecord {
                assertion_id: assertion_id.to_string(),
                result: AssertionOutcome::Pass,
                applicable: true,
                severity,
                risk_weight_bucket: None,
                mapped_sp: None,
                mapped_primitive: None,
                mapped_boundary: None,
                impact_level: None,
                evidence_refs: Vec::new(),
                inconclusive_reason: None,
                params_digest: String::new(),
                payload: Value::Null,
            },
        }
    }

    pub fn mapped(mut self, sp: &str, primitive: &str, boundary: &str) -> Self {
        self.record.mapped_sp = Some(sp.to_string());
        self.record.mapped_primitive = Some(primitive.to_string());
        self.record.mapped_boundary = Some(boundary.to_string());
        self
    }

    pub fn impact(mut self, level: &str) -> Self {
        self.record.impact_level = Some(level.to_string());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.record.payload = payload;
        self
    }

    fn with_refs(mut self, refs: Vec<String>) -> Self {
        let refs: BTreeSet<String> = refs
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        self.record.evidence_refs = refs.into_iter().collect();
        self
    }

    pub fn pass(self, refs: Vec<String>) -> AssertionRecord {
        let mut built = self.with_refs(refs);
        built.record.result = AssertionOutcome::Pass;
        built.record
    }

    pub fn not_applicable_pass(self) -> AssertionRecord {
        let mut built = self;
        built.record.result = AssertionOutcome::Pass;
        built.record.applicable = false;
        built.record
    }

    pub fn fail(self, refs: Vec<String>) -> AssertionRecord {
        let mut built = self.with_refs(refs);
        built.record.result = AssertionOutcome::Fail;
        built.record
    }

    pub fn inconclusive(
        self,
        reason: InconclusiveReason,
        refs: Vec<String>,
    ) -> AssertionRecord {
        let mut built = self.with_refs(refs);
        built.record.result = AssertionOutcome::Inconclusive;
        built.record.inconclusive_reason = Some(reason);
        built.record
    }
}
