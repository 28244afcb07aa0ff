// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic agent collaborators: a scripted replay agent for the CLI
//! toy mode and the determinism tests. Real agents sit behind the same
//! trait in out-of-process adapters.

use masbench_core::device::{
    AgentControl, AgentReply, AgentStatus, Deadline, Observation, RawAction,
};
use masbench_core::error::{HarnessError, HarnessResult};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedStep {
    #[serde(flatten)]
    pub action: Value,
    /// `"latest"` binds to the current observation; any other string is
    /// passed through verbatim (a stale digest trips the ref guard).
    #[serde(default)]
    pub ref_obs: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentScript {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    pub steps: Vec<ScriptedStep>,
    #[serde(default = "default_final_status")]
    pub final_status: String,
    #[serde(default)]
    pub final_summary: String,
}

fn default_agent_id() -> String {
    "scripted".to_string()
}

fn default_final_status() -> String {
    "success".to_string()
}

pub struct ScriptedAgent {
    agent_id: String,
    steps: std::vec::IntoIter<ScriptedStep>,
    final_status: AgentStatus,
    final_summary: String,
}

impl ScriptedAgent {
    pub fn from_script(script: AgentScript) -> HarnessResult<Self> {
        let final_status = match script.final_status.as_str() {
            "success" => AgentStatus::Success,
            "fail" => AgentStatus::Fail,
            "timeout" => AgentStatus::Timeout,
            "error" => AgentStatus::Error,
            other => {
                return Err(HarnessError::SpecSchema(format!(
                    "agent script final_status must be success|fail|timeout|error, got {other:?}"
                )))
            }
        };
        Ok(Self {
            agent_id: script.agent_id,
            steps: script.steps.into_iter(),
            final_status,
            final_summary: script.final_summary,
        })
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let script: AgentScript = serde_json::from_str(&raw)
            .map_err(|e| HarnessError::SpecSchema(format!("agent script: {e}")))?;
        Self::from_script(script)
    }
}

impl AgentControl for ScriptedAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn next_action(
        &mut self,
        _observation: &Observation,
        obs_digest: Option<&str>,
        deadline: Deadline,
    ) -> HarnessResult<AgentReply> {
        deadline.check("agent next_action")?;
        let Some(step) = self.steps.next() else {
            return Ok(AgentReply::Finished {
                status: self.final_status.clone(),
                summary: self.final_summary.clone(),
            });
        };
        let mut action: RawAction = serde_json::from_value(step.action)
            .map_err(|e| HarnessError::SpecSchema(format!("scripted action: {e}")))?;
        action.ref_obs_digest = match step.ref_obs.as_deref() {
            Some("latest") => obs_digest.map(str::to_string),
            Some(stale) => Some(stale.to_string()),
            None => action.ref_obs_digest,
        };
        Ok(AgentReply::Action(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masbench_core::device::{ForegroundApp, ScreenGeometry};
    use serde_json::json;

    fn observation() -> Observation {
        Observation {
            screenshot_png: None,
            ui_tree: None,
            foreground: ForegroundApp {
                package: Some("com.android.dialer".to_string()),
                activity: None,
            },
            geometry: ScreenGeometry {
                screenshot_size_px: None,
                logical_screen_size_px: None,
                physical_frame_boundary_px: None,
                orientation: None,
            },
            notifications: Vec::new(),
            device_epoch_time_ms: None,
        }
    }

    #[test]
    fn scripted_agent_replays_then_finishes() {
        let script: AgentScript = serde_json::from_value(json!({
            "agent_id": "toy",
            "steps": [
                {"kind": "tap", "x": 10.0, "y": 20.0, "ref_obs": "latest"},
                {"kind": "back"}
            ],
            "final_status": "success"
        }))
        .expect("script");
        let mut agent = ScriptedAgent::from_script(script).expect("agent");
        let obs = observation();
        let deadline = Deadline::after_ms(1_000);

        let reply = agent
            .next_action(&obs, Some("digest-1"), deadline)
            .expect("step 0");
        match reply {
            AgentReply::Action(action) => {
                assert_eq!(action.ref_obs_digest.as_deref(), Some("digest-1"));
            }
            AgentReply::Finished { .. } => panic!("expected action"),
        }

        agent.next_action(&obs, None, deadline).expect("step 1");
        let reply = agent.next_action(&obs, None, deadline).expect("finish");
        assert!(matches!(
            reply,
            AgentReply::Finished {
                status: AgentStatus::Success,
                ..
            }
        ));
    }

    #[test]
    fn unknown_final_status_is_rejected() {
        let script: AgentScript = serde_json::from_value(json!({
            "steps": [],
            "final_status": "maybe"
        }))
        .expect("script");
        assert!(ScriptedAgent::from_script(script).is_err());
    }
}
