// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! The Oracle interface.
//!
//! An oracle is a device- or host-side query with `pre_check` and
//! `post_check` phases, producing structured evidence plus a
//! `{success, conclusive, reason}` decision. Every plugin must carry at
//! least one anti-gaming measure: a per-episode token in the match
//! criterion, a device-clock time window, pre-run pollution clearing, or a
//! bi-directional check.

use crate::context::OracleContext;
use masbench_core::caps::Capability;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::records::{Decision, OracleEventRecord, OraclePhase, OracleType};

pub trait Oracle {
    fn name(&self) -> &str;

    fn oracle_type(&self) -> OracleType {
        OracleType::Hard
    }

    fn capabilities_required(&self) -> Vec<Capability>;

    /// Clear pollution and establish baselines. Optional; the default
    /// records nothing.
    fn pre_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>> {
        let _ = ctx;
        Ok(Vec::new())
    }

    /// Make the judgment against current state. Must emit at least one
    /// event carrying a decision.
    fn post_check(&mut self, ctx: &mut OracleContext<'_>) -> HarnessResult<Vec<OracleEventRecord>>;
}

/// Last post-phase decision from a batch of events; missing decision is
/// itself an inconclusive outcome.
pub fn decision_from_events(events: &[OracleEventRecord], phase: OraclePhase) -> Decision {
    events
        .iter()
        .rev()
        .find(|ev| ev.phase == phase)
        .map(|ev| ev.decision.clone())
        .unwrap_or_else(|| Decision::inconclusive("missing oracle decision event"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use masbench_core::evidence::records::PACK_SCHEMA_VERSION;

    fn event(phase: OraclePhase, success: bool) -> OracleEventRecord {
        OracleEventRecord {
            schema_version: PACK_SCHEMA_VERSION.to_string(),
            ts_ms: 0,
            oracle_name: "toy".to_string(),
            oracle_type: OracleType::Hard,
            phase,
            queries: Vec::new(),
            result_digest: "0".repeat(64),
            result_preview: serde_json::Value::Null,
            decision: Decision::conclusive(success, "r"),
            anti_gaming_notes: vec!["n".to_string()],
            capabilities_required: Vec::new(),
            missing_capabilities: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn last_post_decision_wins() {
        let events = vec![
            event(OraclePhase::Pre, true),
            event(OraclePhase::Post, false),
            event(OraclePhase::Post, true),
        ];
        let d = decision_from_events(&events, OraclePhase::Post);
        assert!(d.success && d.conclusive);
    }

    #[test]
    fn missing_decision_is_inconclusive() {
        let d = decision_from_events(&[], OraclePhase::Post);
        assert!(!d.conclusive);
    }
}
