// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Engine tunables and the constants shared by the decision paths.

use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Maximum number of CPUs the fixed-size tables are dimensioned for.
pub const MAX_CPUS: usize = 256;
/// Upper bound on live task contexts.
pub const TASK_TABLE_MAX: usize = 32_768;

/// Full-scale performance level (cpuperf and utilization scale).
pub const SCX_CPUPERF_ONE: u64 = 1024;
pub const CPUFREQ_LOW: u64 = SCX_CPUPERF_ONE / 4;
pub const CPUFREQ_HIGH: u64 = SCX_CPUPERF_ONE - SCX_CPUPERF_ONE / 4;
/// Extra distance a level must travel back before a perf state is left.
pub const CPUFREQ_BAND: u64 = SCX_CPUPERF_ONE / 16;

/// Scale of one migration token.
pub const MIG_TOKEN_SCALE: u64 = 1024;

pub const WAKE_FREQ_SHIFT: u32 = 8;
pub const WAKE_FREQ_MAX: u64 = 10_000;
/// Wake frequencies are wakeups per 100ms: 256 is about 2.5kHz.
pub const INTERACTIVE_SLICE_SHRINK_THRESH: u64 = 256;
/// About 1.3kHz in wakeups per 100ms.
pub const INTERACTIVE_SMT_ALLOW_THRESH: u64 = 128;

/// Below this, context switch overhead dominates the slice.
pub const MIN_SLICE_NS: u64 = 5 * NSEC_PER_USEC;

pub const CHAIN_BOOST_MAX: u32 = 4;
pub const CHAIN_BOOST_STEP: u32 = 2;

pub const PGFAULT_PENALTY_THRESH: u64 = 50;

pub const MM_HINT_UPDATE_INTERVAL_NS: u64 = 2 * NSEC_PER_MSEC;
pub const PLACEMENT_CACHE_MAX_AGE_NS: u64 = 100 * NSEC_PER_MSEC;

pub const CLASSIFY_COMMIT_CONFIDENCE: u8 = 75;
pub const BEHAVIOR_RECLASSIFY_WAKES: u32 = 64;

/// Continuous input detection: trigger rate (events/sec EMA) hysteresis.
pub const CONTINUOUS_ENTER_RATE: u64 = 150;
pub const CONTINUOUS_EXIT_RATE: u64 = 75;
/// A lane that has been silent this long drops out of continuous mode.
pub const CONTINUOUS_IDLE_NS: u64 = 50 * NSEC_PER_MSEC;

pub const TIMER_MIN_PERIOD_NS: u64 = 250 * NSEC_PER_USEC;
/// Period multiplier applied when nothing latency-relevant is happening.
pub const TIMER_IDLE_SCALE: u64 = 4;

/// Immutable engine configuration, fixed for the lifetime of an engine.
///
/// The only runtime-updatable value, the foreground tgid, is seeded from
/// here and then double-buffered by [`crate::boost::BoostWindows`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub slice_ns: u64,
    pub slice_lag_ns: u64,
    pub mig_window_ns: u64,
    pub mig_max: u32,
    /// Migration limiter saturation enter level (0-1024 utilization scale).
    pub mig_saturation_enter: u64,
    pub mig_saturation_exit: u64,
    /// Utilization (0-1024) at or above which the system counts as busy.
    pub busy_threshold: u64,
    pub avoid_smt: bool,
    pub enable_numa: bool,
    pub mm_affinity: bool,
    pub disable_mm_hint: bool,
    pub mm_hint_size: u32,
    pub input_window_ns: u64,
    pub frame_window_ns: u64,
    pub napi_window_ns: u64,
    pub keyboard_boost_ns: u64,
    pub mouse_boost_ns: u64,
    pub controller_boost_ns: u64,
    pub prefer_napi_on_input: bool,
    pub wakeup_timer_ns: u64,
    pub behavior_stable_samples: u32,
    pub disable_cpufreq: bool,
    pub no_stats: bool,
    pub foreground_tgid: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slice_ns: 10 * NSEC_PER_USEC,
            slice_lag_ns: 20 * NSEC_PER_MSEC,
            mig_window_ns: 50 * NSEC_PER_MSEC,
            mig_max: 3,
            mig_saturation_enter: SCX_CPUPERF_ONE * 90 / 100,
            mig_saturation_exit: SCX_CPUPERF_ONE * 75 / 100,
            busy_threshold: SCX_CPUPERF_ONE * 75 / 100,
            avoid_smt: false,
            enable_numa: false,
            mm_affinity: false,
            disable_mm_hint: false,
            mm_hint_size: 8192,
            input_window_ns: 5 * NSEC_PER_MSEC,
            frame_window_ns: 4 * NSEC_PER_MSEC,
            napi_window_ns: 2 * NSEC_PER_MSEC,
            keyboard_boost_ns: 1000 * NSEC_PER_MSEC,
            mouse_boost_ns: 8 * NSEC_PER_MSEC,
            controller_boost_ns: 500 * NSEC_PER_MSEC,
            prefer_napi_on_input: false,
            wakeup_timer_ns: 500 * NSEC_PER_USEC,
            behavior_stable_samples: 4,
            disable_cpufreq: false,
            no_stats: false,
            foreground_tgid: 0,
        }
    }
}

impl EngineConfig {
    /// Clamp soft ranges and reject combinations the engine cannot run with.
    pub fn validated(mut self) -> Result<Self, EngineError> {
        if self.slice_ns == 0 {
            return Err(EngineError::InvalidConfig("slice must be non-zero".into()));
        }
        if self.slice_lag_ns < self.slice_ns {
            return Err(EngineError::InvalidConfig(format!(
                "slice lag ({}ns) shorter than slice ({}ns)",
                self.slice_lag_ns, self.slice_ns
            )));
        }
        if self.mig_max > 0 && self.mig_window_ns == 0 {
            return Err(EngineError::InvalidConfig(
                "migration quota set with a zero-length window".into(),
            ));
        }
        if self.mig_saturation_exit > self.mig_saturation_enter
            || self.mig_saturation_enter > SCX_CPUPERF_ONE
        {
            return Err(EngineError::InvalidConfig(format!(
                "saturation exit {} must not exceed enter {} (max {})",
                self.mig_saturation_exit, self.mig_saturation_enter, SCX_CPUPERF_ONE
            )));
        }
        self.busy_threshold = self.busy_threshold.min(SCX_CPUPERF_ONE);

        if self.slice_ns < MIN_SLICE_NS {
            warn!("slice {}ns below floor, using {}ns", self.slice_ns, MIN_SLICE_NS);
            self.slice_ns = MIN_SLICE_NS;
        }

        let hint = self.mm_hint_size.clamp(128, 65_536);
        if hint != self.mm_hint_size {
            warn!("mm hint size {} out of range, clamped to {}", self.mm_hint_size, hint);
            self.mm_hint_size = hint;
        }

        if self.wakeup_timer_ns != 0 && self.wakeup_timer_ns < TIMER_MIN_PERIOD_NS {
            info!(
                "wakeup timer {}us raised to {}us",
                self.wakeup_timer_ns / NSEC_PER_USEC,
                TIMER_MIN_PERIOD_NS / NSEC_PER_USEC
            );
            self.wakeup_timer_ns = TIMER_MIN_PERIOD_NS;
        }

        self.behavior_stable_samples = self.behavior_stable_samples.clamp(4, 20);

        Ok(self)
    }

    /// Base period of the housekeeping timer.
    pub fn timer_period_ns(&self) -> u64 {
        if self.wakeup_timer_ns != 0 {
            self.wakeup_timer_ns
        } else {
            self.slice_ns.max(TIMER_MIN_PERIOD_NS)
        }
    }

    pub fn max_mig_tokens(&self) -> u64 {
        self.mig_max as u64 * MIG_TOKEN_SCALE
    }

    pub fn migration_limited(&self) -> bool {
        self.mig_window_ns != 0 && self.mig_max != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = EngineConfig::default().validated().unwrap();
        assert_eq!(cfg.max_mig_tokens(), 3 * MIG_TOKEN_SCALE);
        assert_eq!(cfg.timer_period_ns(), 500 * NSEC_PER_USEC);
    }

    #[test]
    fn soft_ranges_are_clamped() {
        let cfg = EngineConfig {
            mm_hint_size: 4,
            wakeup_timer_ns: 10 * NSEC_PER_USEC,
            behavior_stable_samples: 100,
            slice_ns: 1,
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.mm_hint_size, 128);
        assert_eq!(cfg.wakeup_timer_ns, TIMER_MIN_PERIOD_NS);
        assert_eq!(cfg.behavior_stable_samples, 20);
        assert_eq!(cfg.slice_ns, MIN_SLICE_NS);
    }

    #[test]
    fn fatal_combinations_are_rejected() {
        let zero_window = EngineConfig {
            mig_window_ns: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_window.validated(),
            Err(EngineError::InvalidConfig(_))
        ));

        let short_lag = EngineConfig {
            slice_lag_ns: 1,
            ..Default::default()
        };
        assert!(short_lag.validated().is_err());

        let inverted = EngineConfig {
            mig_saturation_enter: 100,
            mig_saturation_exit: 200,
            ..Default::default()
        };
        assert!(inverted.validated().is_err());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"mig_max": 5}"#).unwrap();
        assert_eq!(cfg.mig_max, 5);
        assert_eq!(cfg.slice_lag_ns, EngineConfig::default().slice_lag_ns);
    }
}
