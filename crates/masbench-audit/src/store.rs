// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fact index for deterministic assertion evaluation.

use masbench_core::error::{HarnessError, HarnessResult};
use masbench_core::facts::Fact;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct FactStore {
    facts: BTreeMap<String, Fact>,
}

impl FactStore {
    pub fn new(facts: Vec<Fact>) -> HarnessResult<Self> {
        let mut store = Self::default();
        for fact in facts {
            store.add(fact)?;
        }
        Ok(store)
    }

    pub fn add(&mut self, fact: Fact) -> HarnessResult<()> {
        if fact.fact_id.trim().is_empty() {
            return Err(HarnessError::SchemaViolation(
                "fact_id must be non-empty".to_string(),
            ));
        }
        if self.facts.contains_key(&fact.fact_id) {
            return Err(HarnessError::SchemaViolation(format!(
                "duplicate fact_id: {}",
                fact.fact_id
            )));
        }
        self.facts.insert(fact.fact_id.clone(), fact);
        Ok(())
    }

    pub fn get(&self, fact_id: &str) -> Option<&Fact> {
        self.facts.get(fact_id)
    }

    pub fn contains(&self, fact_id: &str) -> bool {
        self.facts.contains_key(fact_id)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.facts.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.values()
    }

    /// Facts whose id starts with the given prefix, in id order.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Fact> + 'a {
        self.facts
            .range(prefix.to_string()..)
            .take_while(move |(id, _)| id.starts_with(prefix))
            .map(|(_, fact)| fact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masbench_core::facts::OracleSource;
    use serde_json::json;

    fn fact(id: &str) -> Fact {
        Fact::new(id, OracleSource::None, vec![], json!({}))
            .finalize()
            .expect("finalize")
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut store = FactStore::default();
        store.add(fact("fact.a")).expect("first");
        assert!(store.add(fact("fact.a")).is_err());
    }

    #[test]
    fn prefix_scan_is_ordered() {
        let store = FactStore::new(vec![
            fact("fact.oracle_event_index/sms_provider/post"),
            fact("fact.oracle_event_index/boot_health/pre"),
            fact("fact.step_count"),
        ])
        .expect("store");
        let ids: Vec<&str> = store
            .with_prefix("fact.oracle_event_index/")
            .map(|f| f.fact_id.as_str())
            .collect();
        assert_eq!(
            ids,
            vec![
                "fact.oracle_event_index/boot_health/pre",
                "fact.oracle_event_index/sms_provider/post",
            ]
        );
    }
}
