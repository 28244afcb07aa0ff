// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collaborator contracts: the device handle (ADB-like) and the
//! agent-under-test handle. The engine never drives the device or the agent
//! itself; it talks to these traits, each call bounded by a deadline.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Deadline derived from the episode budget. Collaborator calls must return
/// (or be abandoned) before it expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Self {
            expires_at: Instant::now() + d,
        }
    }

    pub fn after_ms(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// A tighter deadline for a sub-call, never exceeding the parent.
    pub fn sub_deadline(&self, ms: u64) -> Deadline {
        let capped = self.remaining().min(Duration::from_millis(ms));
        Deadline::after(capped)
    }

    pub fn check(&self, what: &str) -> HarnessResult<()> {
        if self.expired() {
            return Err(HarnessError::DeadlineExpired(what.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForegroundApp {
    pub package: Option<String>,
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SizePx {
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameBoundaryPx {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenGeometry {
    pub screenshot_size_px: Option<SizePx>,
    pub logical_screen_size_px: Option<SizePx>,
    pub physical_frame_boundary_px: Option<FrameBoundaryPx>,
    pub orientation: Option<Orientation>,
}

/// One device observation as returned by the collaborator.
#[derive(Debug, Clone)]
pub struct Observation {
    pub screenshot_png: Option<Vec<u8>>,
    pub ui_tree: Option<Value>,
    pub foreground: ForegroundApp,
    pub geometry: ScreenGeometry,
    pub notifications: Vec<Value>,
    pub device_epoch_time_ms: Option<u64>,
}

/// Coordinate space of an incoming raw action. Execution always happens in
/// `PhysicalPx`; anything else is mapped by the normalizer and the mapping is
/// recorded as a `coord_transform`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordSpace {
    PhysicalPx,
    LogicalPx,
    Normalized01,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Tap { x: f64, y: f64 },
    LongPress { x: f64, y: f64 },
    Swipe { x1: f64, y1: f64, x2: f64, y2: f64, duration_ms: u64 },
    TypeText { text: String },
    KeyEvent { keycode: String },
    OpenApp { package: String },
    Back,
    Home,
    Wait { ms: u64 },
}

/// Action exactly as the agent produced it, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub coord_space: Option<CoordSpace>,
    #[serde(default)]
    pub ref_obs_digest: Option<String>,
}

/// Action after coordinate canonicalization: always `physical_px`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedAction {
    #[serde(flatten)]
    pub kind: ActionKind,
    pub coord_space: CoordSpace,
    pub ref_obs_digest: Option<String>,
    pub coord_transform: Option<CoordTransform>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordTransform {
    pub from_space: CoordSpace,
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputReceipt {
    pub success: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// ADB-like device contract. Connection parameters (`adb_server`,
/// `android_serial`) belong to the implementation.
pub trait DeviceControl {
    fn serial(&self) -> &str;

    fn observe(&mut self, deadline: Deadline) -> HarnessResult<Observation>;

    fn execute(
        &mut self,
        action: &NormalizedAction,
        deadline: Deadline,
    ) -> HarnessResult<InputReceipt>;

    fn run_shell(&mut self, cmd: &str, deadline: Deadline) -> HarnessResult<ShellOutput>;

    fn pull(&mut self, path: &str, deadline: Deadline) -> HarnessResult<Vec<u8>>;

    /// Load the named snapshot or perform the deterministic reset hook.
    fn reset(&mut self, snapshot: Option<&str>, deadline: Deadline) -> HarnessResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Fail,
    Timeout,
    Error,
}

/// What the agent returned for one step.
#[derive(Debug, Clone)]
pub enum AgentReply {
    Action(RawAction),
    Finished { status: AgentStatus, summary: String },
}

/// Agent-under-test contract. Timeout is terminal: the engine never retries
/// a step after the agent deadline expires.
pub trait AgentControl {
    fn agent_id(&self) -> &str;

    fn next_action(
        &mut self,
        observation: &Observation,
        obs_digest: Option<&str>,
        deadline: Deadline,
    ) -> HarnessResult<AgentReply>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_sub_deadline_never_exceeds_parent() {
        let parent = Deadline::after_ms(50);
        let child = parent.sub_deadline(10_000);
        assert!(child.remaining() <= parent.remaining() + Duration::from_millis(1));
    }

    #[test]
    fn expired_deadline_checks_fail() {
        let d = Deadline::after_ms(0);
        std::thread::sleep(Duration::from_millis(2));
        assert!(d.expired());
        assert!(d.check("observe").is_err());
    }
}
