// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! masbench-oracles
//!
//! The Oracle Zoo: pluggable device/host side-channel queries behind one
//! `Oracle` interface with `pre_check`/`post_check` phases. A TaskSpec
//! selects a plugin by id; parameters drive the query. Every plugin carries
//! at least one anti-gaming measure (per-episode token, device-clock time
//! window, pollution clearing, or a bi-directional check).

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adb;
pub mod capabilities;
pub mod composite;
pub mod context;
pub mod dumpsys;
pub mod files;
pub mod host;
pub mod oracle;
pub mod params;
pub mod providers;
pub mod registry;
pub mod snapshot;
pub mod sqlite;
pub mod state;

pub use crate::context::OracleContext;
pub use crate::oracle::{decision_from_events, Oracle};
pub use crate::registry::OracleRegistry;
