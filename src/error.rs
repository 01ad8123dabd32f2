/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use std::error;
use std::fmt;

/// Failure modes of the compiler core.
///
/// Broken in-memory invariants abort via assertions inside the passes;
/// only conditions the driver can act on surface as values.  A program
/// whose demand cannot be brought under the hardware bounds reports
/// `ResourceExhaustion` with `Program::num_waves` left at 0 so the driver
/// can retry the shader through a fallback backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompileError {
    InvariantViolation(String),
    Unsupported(String),
    ResourceExhaustion { sgpr_demand: u16, vgpr_demand: u16 },
    InternalInconsistency(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::InvariantViolation(msg) => {
                write!(f, "IR invariant violated: {}", msg)
            }
            CompileError::Unsupported(msg) => {
                write!(f, "unsupported: {}", msg)
            }
            CompileError::ResourceExhaustion {
                sgpr_demand,
                vgpr_demand,
            } => write!(
                f,
                "register demand exceeds hardware bounds \
                 (sgpr: {}, vgpr: {})",
                sgpr_demand, vgpr_demand
            ),
            CompileError::InternalInconsistency(msg) => {
                write!(f, "internal inconsistency: {}", msg)
            }
        }
    }
}

impl error::Error for CompileError {}
