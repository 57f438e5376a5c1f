// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host-agnostic scheduling policy engine.
//!
//! [`engine::Engine`] owns per-task and per-CPU state and answers the
//! scheduler framework's callbacks through the [`host::Host`] trait. Tasks
//! are classified into latency roles, ordered by virtual deadline and placed
//! on idle CPUs with topology, boost windows and a migration limiter in mind.
//! [`sim`] drives the engine with a deterministic in-memory host.

pub mod boost;
pub mod classify;
pub mod config;
pub mod cpu;
pub mod cpu_select;
pub mod engine;
pub mod error;
pub mod host;
pub mod migration;
pub mod perf;
pub mod sim;
pub mod stats;
pub mod task;
pub mod trigger;
pub mod vtime;

pub use engine::Engine;
pub use error::EngineError;

pub const SCHEDULER_NAME: &str = "scx_cadence";
