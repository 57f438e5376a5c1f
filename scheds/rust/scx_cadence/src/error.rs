// SPDX-License-Identifier: GPL-2.0

use thiserror::Error;

use crate::host::CpuId;
use crate::host::Pid;

/// Errors surfaced by the engine.
///
/// Only initialization and task creation hand these back to the host. Every
/// other callback degrades to a conservative decision and bumps a counter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no context for task {0}")]
    MissingTask(Pid),

    #[error("no context for cpu {0}")]
    MissingCpu(CpuId),

    #[error("task table full ({0} entries)")]
    TableFull(usize),

    #[error("host does not support {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("failed to re-arm wakeup timer (period {0}ns)")]
    TimerArm(u64),
}
