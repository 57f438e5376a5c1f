// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::classify::NR_ROLES;
use crate::perf::PerfHint;

/// Event counters owned by one CPU, folded into the global statistics by
/// the housekeeping timer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub idle_pick: u64,
    pub placement_hit: u64,
    pub gpu_phys_kept: u64,
    pub mm_hint_hit: u64,
    pub sync_wake_fast: u64,
    pub sync_local: u64,
    pub napi_prefer: u64,
    pub dfl_fallback: u64,
    pub migrations: u64,
    pub mig_blocked: u64,
    pub frame_mig_block: u64,
    pub direct: u64,
    pub rr_enq: u64,
    pub edf_enq: u64,
    pub shared: u64,
    pub slice_extend: u64,
    pub reenq: u64,
    pub missing_ctx: u64,
    pub fg_runtime_ns: u64,
    pub total_runtime_ns: u64,
    /// Net change of live classified threads per role since the last drain.
    pub role_delta: [i64; NR_ROLES],
}

impl CpuCounters {
    /// Hand over the accumulated counters and start from zero.
    pub fn drain(&mut self) -> CpuCounters {
        std::mem::take(self)
    }
}

/// Per-CPU scheduling state owned by the engine.
#[derive(Clone, Debug, Default)]
pub struct CpuContext {
    /// Most advanced vruntime seen on this CPU. Never decreases.
    pub vtime_now: u64,
    /// EMA of the wakeup frequency of tasks that ran here.
    pub interactive_avg: u64,
    pub perf: PerfHint,
    /// Shared queue this CPU consumes from.
    pub shared_dsq: u64,
    pub counters: CpuCounters,
}

impl CpuContext {
    pub fn new(shared_dsq: u64) -> Self {
        Self {
            shared_dsq,
            ..Default::default()
        }
    }

    #[inline]
    pub fn advance_vtime(&mut self, vtime: u64) {
        if vtime > self.vtime_now {
            self.vtime_now = vtime;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtime_now_is_monotone() {
        let mut c = CpuContext::new(0);
        for v in [5, 3, 9, 1, 9, 12] {
            let before = c.vtime_now;
            c.advance_vtime(v);
            assert!(c.vtime_now >= before);
        }
        assert_eq!(c.vtime_now, 12);
    }

    #[test]
    fn drain_resets() {
        let mut c = CpuContext::new(0);
        c.counters.rr_enq = 3;
        c.counters.role_delta[1] = -1;
        let d = c.counters.drain();
        assert_eq!(d.rr_enq, 3);
        assert_eq!(d.role_delta[1], -1);
        assert_eq!(c.counters, CpuCounters::default());
    }
}
