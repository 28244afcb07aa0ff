// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("spec schema error: {0}")]
    SpecSchema(String),

    #[error("spec conflict: {0}")]
    SpecConflict(String),

    #[error("baseline assertion compilation is empty")]
    PolicyEmpty,

    #[error("trace schema violation: {0}")]
    SchemaViolation(String),

    #[error("step_idx monotonicity violation: {0}")]
    Monotonicity(String),

    #[error("evidence pack is sealed")]
    Sealed,

    #[error("infrastructure failure: {0}")]
    Infra(String),

    #[error("collaborator deadline expired: {0}")]
    DeadlineExpired(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error")]
    Internal,
}
