// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Composite oracles. `all_of` short-circuits on the first inconclusive
//! child; `any_of` must be requested explicitly by the case. The summary
//! event carries references to every child event evaluated.

use crate::context::{make_event, OracleContext};
use crate::oracle::{decision_from_events, Oracle};
use masbench_core::caps::Capability;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::records::{
    Decision, OracleEventRecord, OraclePhase, OracleQuery, OracleType,
};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    AllOf,
    AnyOf,
}

pub struct CompositeOracle {
    mode: CompositeMode,
    children: Vec<Box<dyn Oracle>>,
}

impl CompositeOracle {
    pub fn new(mode: CompositeMode, children: Vec<Box<dyn Oracle>>) -> Self {
        Self { mode, children }
    }

    fn summary_query(&self) -> OracleQuery {
        let names: Vec<&str> = self.children.iter().map(|c| c.name()).collect();
        OracleQuery {
            query_type: "composite".to_string(),
            timeout_ms: 0,
            cmd: Some(format!("{}({})", self.name(), names.join(","))),
            ..OracleQuery::default()
        }
    }

    fn combine(&self, child_decisions: &[(String, Decision)], short_circuited: bool) -> Decision {
        match self.mode {
            CompositeMode::AllOf => {
                if let Some((name, _)) = child_decisions
                    .iter()
                    .find(|(_, d)| !d.conclusive)
                {
                    return Decision::inconclusive(format!("child {name} inconclusive"));
                }
                if short_circuited {
                    return Decision::inconclusive("evaluation short-circuited");
                }
                if let Some((name, _)) = child_decisions.iter().find(|(_, d)| !d.success) {
                    return Decision::conclusive(false, format!("child {name} failed"));
                }
                Decision::conclusive(true, "all children succeeded")
            }
            CompositeMode::AnyOf => {
                if let Some((name, _)) = child_decisions
                    .iter()
                    .find(|(_, d)| d.conclusive && d.success)
                {
                    return Decision::conclusive(true, format!("child {name} succeeded"));
                }
                if child_decisions.iter().all(|(_, d)| d.conclusive) {
                    return Decision::conclusive(false, "no child succeeded");
                }
                Decision::inconclusive("no success and at least one child inconclusive")
            }
        }
    }
}

impl Oracle for CompositeOracle {
    fn name(&self) -> &str {
        match self.mode {
            CompositeMode::AllOf => "all_of",
            CompositeMode::AnyOf => "any_of",
        }
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Hybrid
    }

    fn capabilities_required(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self
            .children
            .iter()
            .flat_map(|c| c.capabilities_required())
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let mut events = Vec::new();
        for child in self.children.iter_mut() {
            events.extend(child.pre_check(ctx)?);
        }
        Ok(events)
    }

    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let mut events: Vec<OracleEventRecord> = Vec::new();
        let mut child_decisions: Vec<(String, Decision)> = Vec::new();
        let mut short_circuited = false;

        let total = self.children.len();
        for (idx, child) in self.children.iter_mut().enumerate() {
            let child_events = child.post_check(ctx)?;
            let decision = decision_from_events(&child_events, OraclePhase::Post);
            events.extend(child_events);
            let inconclusive = !decision.conclusive;
            child_decisions.push((child.name().to_string(), decision));
            if self.mode == CompositeMode::AllOf && inconclusive && idx + 1 < total {
                short_circuited = true;
                break;
            }
        }

        let combined = self.combine(&child_decisions, short_circuited);
        let child_refs: Vec<_> = child_decisions
            .iter()
            .map(|(name, d)| {
                json!({ "child": name, "success": d.success, "conclusive": d.conclusive })
            })
            .collect();
        let summary = make_event(
            self.name(),
            self.oracle_type(),
            OraclePhase::Post,
            vec![self.summary_query()],
            &json!({ "children": child_refs.clone(), "short_circuited": short_circuited }),
            json!({ "children": child_refs, "short_circuited": short_circuited }),
            combined,
            vec!["composite verdict derives only from child evidence events".to_string()],
            &self.capabilities_required(),
        )?;
        events.push(summary);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(success: bool, conclusive: bool) -> Decision {
        Decision {
            success,
            score: if success { 1.0 } else { 0.0 },
            reason: "test".to_string(),
            conclusive,
        }
    }

    fn composite(mode: CompositeMode) -> CompositeOracle {
        CompositeOracle::new(mode, Vec::new())
    }

    #[test]
    fn all_of_requires_every_child_conclusive_success() {
        let c = composite(CompositeMode::AllOf);
        let d = c.combine(
            &[
                ("a".to_string(), decision(true, true)),
                ("b".to_string(), decision(true, true)),
            ],
            false,
        );
        assert!(d.success && d.conclusive);

        let d = c.combine(
            &[
                ("a".to_string(), decision(true, true)),
                ("b".to_string(), decision(false, true)),
            ],
            false,
        );
        assert!(!d.success && d.conclusive);

        let d = c.combine(
            &[
                ("a".to_string(), decision(true, true)),
                ("b".to_string(), decision(false, false)),
            ],
            false,
        );
        assert!(!d.conclusive);
    }

    #[test]
    fn any_of_succeeds_on_first_conclusive_success() {
        let c = composite(CompositeMode::AnyOf);
        let d = c.combine(
            &[
                ("a".to_string(), decision(false, true)),
                ("b".to_string(), decision(true, true)),
            ],
            false,
        );
        assert!(d.success && d.conclusive);

        let d = c.combine(
            &[
                ("a".to_string(), decision(false, true)),
                ("b".to_string(), decision(false, false)),
            ],
            false,
        );
        assert!(!d.conclusive);

        let d = c.combine(
            &[
                ("a".to_string(), decision(false, true)),
                ("b".to_string(), decision(false, true)),
            ],
            false,
        );
        assert!(!d.success && d.conclusive);
    }
}
