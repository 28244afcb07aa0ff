// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! masbench-runner
//!
//! The Episode Runner: drives reset, health probe, oracle pre-checks, the
//! observe/act step loop with the ref-binding guard, oracle post-checks and
//! the final audit over one device episode. Also home to the concrete
//! collaborators: the `adb`-backed device handle and the scripted agent.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adb;
pub mod agents;
pub mod normalizer;
pub mod runner;

pub use crate::adb::AdbDevice;
pub use crate::agents::{AgentScript, ScriptedAgent};
pub use crate::runner::{EpisodeResult, EpisodeRunner, RunnerConfig};
