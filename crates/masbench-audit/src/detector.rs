// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Detector engine: pure, replayable functions from a sealed evidence pack
//! to typed facts. Detectors run in registration order; a failing detector
//! becomes a `fact.detector_error/<id>` fact, never a crash. Output is
//! sorted by fact id and written atomically to `facts.jsonl`.

use crate::context::CaseContext;
use masbench_core::error::HarnessResult;
use masbench_core::evidence::pack::SealedPack;
use masbench_core::evidence::records::FACTS_JSONL;
use masbench_core::facts::{Fact, OracleSource};
use serde_json::json;

pub trait Detector {
    fn detector_id(&self) -> &'static str;

    fn extract(&self, pack: &SealedPack, ctx: &CaseContext) -> HarnessResult<Vec<Fact>>;
}

pub fn builtin_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(crate::detectors::basics::ForegroundSeqDetector),
        Box::new(crate::detectors::basics::StepStatsDetector),
        Box::new(crate::detectors::basics::ActionEvidenceDetector),
        Box::new(crate::detectors::basics::EnvProfileDetector),
        Box::new(crate::detectors::oracle_index::OracleEventIndexDetector),
        Box::new(crate::detectors::oracle_index::OracleTypedFactsDetector),
        Box::new(crate::detectors::effects::PackageDiffDetector),
        Box::new(crate::detectors::effects::SettingsDiffDetector),
        Box::new(crate::detectors::effects::HighRiskEffectsDetector),
        Box::new(crate::detectors::consent::ConsentTraceDetector),
        Box::new(crate::detectors::consent::CanaryConfigDetector),
        Box::new(crate::detectors::consent::CanaryHitsDetector),
        Box::new(crate::detectors::consent::BindingStateDetector),
    ]
}

/// Run the detector zoo over a sealed pack, writing `facts.jsonl`.
pub fn run_detectors(
    pack: &SealedPack,
    ctx: &CaseContext,
    detectors: &[Box<dyn Detector>],
) -> HarnessResult<Vec<Fact>> {
    let mut raw: Vec<Fact> = Vec::new();
    for detector in detectors {
        match detector.extract(pack, ctx) {
            Ok(facts) => raw.extend(facts),
            Err(err) => {
                tracing::warn!(
                    target: "masbench.audit",
                    detector = detector.detector_id(),
                    error = %err,
                    "detector failed"
                );
                raw.push(Fact::new(
                    &format!("fact.detector_error/{}", detector.detector_id()),
                    OracleSource::None,
                    Vec::new(),
                    json!({
                        "detector_id": detector.detector_id(),
                        "error": err.to_string(),
                    }),
                ));
            }
        }
    }

    let mut finalized: Vec<Fact> = Vec::with_capacity(raw.len());
    let mut seen = std::collections::BTreeSet::new();
    for fact in raw {
        if !seen.insert(fact.fact_id.clone()) {
            return Err(masbench_core::error::HarnessError::SchemaViolation(format!(
                "duplicate fact_id produced by detectors: {}",
                fact.fact_id
            )));
        }
        finalized.push(fact.finalize()?);
    }
    finalized.sort_by(|a, b| a.fact_id.cmp(&b.fact_id));

    pack.write_jsonl_atomic(FACTS_JSONL, &finalized)?;
    Ok(finalized)
}

/// Load previously written facts (replay path).
pub fn load_facts(pack: &SealedPack) -> HarnessResult<Vec<Fact>> {
    let mut out = Vec::new();
    for (_, value) in pack.read_jsonl(FACTS_JSONL)? {
        out.push(serde_json::from_value(value)?);
    }
    Ok(out)
}
