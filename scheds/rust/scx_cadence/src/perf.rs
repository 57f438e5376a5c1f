// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU performance hints.
//!
//! Utilization is sampled at every context switch, smoothed with the same
//! EMA the rest of the engine uses, and mapped onto three levels. A level
//! is only left once the smoothed load has moved [`CPUFREQ_BAND`] past the
//! threshold that entered it.

use crate::config::CPUFREQ_BAND;
use crate::config::CPUFREQ_HIGH;
use crate::config::CPUFREQ_LOW;
use crate::config::NSEC_PER_SEC;
use crate::config::SCX_CPUPERF_ONE;
use crate::vtime::calc_avg;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PerfState {
    Low,
    #[default]
    Mid,
    High,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfHint {
    /// Smoothed utilization, 0..=SCX_CPUPERF_ONE.
    pub level: u64,
    pub last_update: u64,
    pub state: PerfState,
    /// Last value handed to the host, to skip redundant requests.
    applied: Option<u32>,
}

impl PerfHint {
    /// Account `slice` ns of busy time ending at `now`.
    pub fn update_load(&mut self, now: u64, slice: u64) {
        let delta = now.saturating_sub(self.last_update);
        self.last_update = now;
        if delta == 0 || delta > NSEC_PER_SEC {
            return;
        }
        let util = (slice.saturating_mul(SCX_CPUPERF_ONE) / delta).min(SCX_CPUPERF_ONE);
        self.level = calc_avg(self.level, util);
        self.state = next_state(self.state, self.level);
    }

    /// Target performance level for the current state.
    pub fn target(&self) -> u32 {
        let perf = match self.state {
            PerfState::High => SCX_CPUPERF_ONE,
            PerfState::Low => SCX_CPUPERF_ONE / 2,
            PerfState::Mid => self.level.clamp(SCX_CPUPERF_ONE / 2, SCX_CPUPERF_ONE),
        };
        perf as u32
    }

    /// The level to request from the host, if it differs from the last one.
    pub fn pending(&mut self) -> Option<u32> {
        let target = self.target();
        if self.applied == Some(target) {
            return None;
        }
        self.applied = Some(target);
        Some(target)
    }
}

fn next_state(state: PerfState, level: u64) -> PerfState {
    match state {
        PerfState::Low if level >= CPUFREQ_HIGH => PerfState::High,
        PerfState::Low if level > CPUFREQ_LOW + CPUFREQ_BAND => PerfState::Mid,
        PerfState::Mid if level >= CPUFREQ_HIGH => PerfState::High,
        PerfState::Mid if level <= CPUFREQ_LOW => PerfState::Low,
        PerfState::High if level <= CPUFREQ_LOW => PerfState::Low,
        PerfState::High if level < CPUFREQ_HIGH - CPUFREQ_BAND => PerfState::Mid,
        s => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NSEC_PER_MSEC;

    fn run(hint: &mut PerfHint, start: u64, n: u64, busy_pct: u64) -> u64 {
        let mut now = start;
        for _ in 0..n {
            now += NSEC_PER_MSEC;
            hint.update_load(now, NSEC_PER_MSEC * busy_pct / 100);
        }
        now
    }

    #[test]
    fn saturated_cpu_goes_high_then_low() {
        let mut h = PerfHint {
            last_update: 1,
            ..Default::default()
        };
        let now = run(&mut h, 1, 32, 100);
        assert_eq!(h.state, PerfState::High);
        assert_eq!(h.pending(), Some(SCX_CPUPERF_ONE as u32));
        assert_eq!(h.pending(), None);

        run(&mut h, now, 64, 0);
        assert_eq!(h.state, PerfState::Low);
        assert_eq!(h.target(), (SCX_CPUPERF_ONE / 2) as u32);
    }

    #[test]
    fn high_state_holds_inside_band() {
        let mut h = PerfHint {
            level: CPUFREQ_HIGH,
            state: PerfState::High,
            ..Default::default()
        };
        assert_eq!(next_state(h.state, CPUFREQ_HIGH - CPUFREQ_BAND / 2), PerfState::High);
        h.state = next_state(h.state, CPUFREQ_HIGH - CPUFREQ_BAND - 1);
        assert_eq!(h.state, PerfState::Mid);
        assert_eq!(next_state(PerfState::Low, CPUFREQ_LOW + 1), PerfState::Low);
    }

    #[test]
    fn stale_or_zero_deltas_are_skipped() {
        let mut h = PerfHint::default();
        h.update_load(5 * NSEC_PER_SEC, NSEC_PER_MSEC);
        assert_eq!(h.level, 0);
        h.update_load(5 * NSEC_PER_SEC, NSEC_PER_MSEC);
        assert_eq!(h.level, 0);
    }
}
