// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Time slice and virtual deadline calculation.
//!
//! All arithmetic is integer shift/divide and monotone in its inputs.

use crate::boost::WindowView;
use crate::classify::Role;
use crate::config::EngineConfig;
use crate::config::CHAIN_BOOST_MAX;
use crate::config::INTERACTIVE_SLICE_SHRINK_THRESH;
use crate::config::MIN_SLICE_NS;
use crate::config::NSEC_PER_MSEC;
use crate::config::PGFAULT_PENALTY_THRESH;
use crate::config::WAKE_FREQ_MAX;
use crate::config::WAKE_FREQ_SHIFT;
use crate::cpu::CpuContext;
use crate::task::TaskContext;

/// Exponential moving average: 3/4 old + 1/4 new.
#[inline]
pub fn calc_avg(old: u64, new: u64) -> u64 {
    (old - (old >> 2)) + (new >> 2)
}

/// Fold one inter-wake interval into a wakeups-per-100ms EMA.
#[inline]
pub fn update_freq(freq: u64, interval: u64) -> u64 {
    if interval == 0 {
        return freq;
    }
    calc_avg(freq, (100 * NSEC_PER_MSEC) / interval).min(WAKE_FREQ_MAX)
}

#[inline]
pub fn scale_by_weight(value: u64, weight: u64) -> u64 {
    value.saturating_mul(weight) / 100
}

#[inline]
pub fn scale_inverse_weight(value: u64, weight: u64) -> u64 {
    value.saturating_mul(100) / weight.max(1)
}

/// Time slice for `task` on a CPU with context `cpu`.
pub fn task_slice(
    cfg: &EngineConfig,
    task: &TaskContext,
    cpu: &CpuContext,
    win: &WindowView,
    weight: u64,
) -> u64 {
    let mut slice = cfg.slice_ns;

    if task.foreground && win.input_active && !win.continuous_input {
        slice >>= 1;
    }
    // Both EMAs count wakeups per 100ms, not per second.
    if cpu.interactive_avg > INTERACTIVE_SLICE_SHRINK_THRESH {
        slice = slice * 3 / 4;
    }
    if task.wakeup_freq > INTERACTIVE_SLICE_SHRINK_THRESH && !win.continuous_input {
        slice >>= 1;
    }

    scale_by_weight(slice, weight).max(MIN_SLICE_NS)
}

/// How far back a task's vruntime may lag behind the CPU's.
pub fn lag_bound(cfg: &EngineConfig, task: &TaskContext, weight: u64) -> u64 {
    let wake_factor = wake_factor(task);
    scale_by_weight(cfg.slice_lag_ns.saturating_mul(wake_factor), weight)
}

fn wake_factor(task: &TaskContext) -> u64 {
    (1 + (task.wakeup_freq >> WAKE_FREQ_SHIFT)).min(4)
}

/// Latency term added on top of the task's vruntime.
pub fn exec_component(task: &TaskContext, win: &WindowView, weight: u64) -> u64 {
    let exec = scale_inverse_weight(task.exec_runtime, weight);
    let role = task.primary_role();

    let mut component = match role {
        Some(Role::Background) => exec << 2,
        Some(r) if !r.window_gated() || win.input_active => exec >> r.priority_shift(),
        _ => {
            let mut c = exec;
            if task.foreground {
                if win.input_active {
                    c >>= 4;
                }
            } else {
                c <<= 1;
            }
            c / wake_factor(task) / (1 + task.chain_boost.min(CHAIN_BOOST_MAX - 1) as u64)
        }
    };

    let exempt = matches!(
        role,
        Some(Role::Input | Role::SystemAudio | Role::GameAudio | Role::GpuSubmit)
    );
    if task.pgfault_rate > PGFAULT_PENALTY_THRESH && !exempt {
        component = component.saturating_mul(3) / 2;
    }
    component
}

/// Virtual deadline used to order `task` in the shared queue.
///
/// The task's vruntime is first pulled up to the CPU's vruntime minus the
/// lag bound, so long sleepers can't bank unbounded credit.
pub fn task_deadline(
    cfg: &EngineConfig,
    task: &mut TaskContext,
    cpu: &CpuContext,
    win: &WindowView,
    weight: u64,
) -> u64 {
    let vtime_min = cpu.vtime_now.saturating_sub(lag_bound(cfg, task, weight));
    if task.vtime < vtime_min {
        task.vtime = vtime_min;
    }
    task.vtime.saturating_add(exec_component(task, win, weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classification;
    use crate::classify::Source;
    use crate::host::TaskView;

    fn task(role: Option<Role>, exec_ms: u64) -> TaskContext {
        let mut t = TaskContext::new(&TaskView::new(1, 1, "t"), &EngineConfig::default(), 0);
        t.set_role(role.map(|role| Classification {
            role,
            confidence: 100,
            source: Source::Name,
        }));
        t.exec_runtime = exec_ms * NSEC_PER_MSEC;
        t.foreground = true;
        t
    }

    fn cpu(vtime_now: u64) -> CpuContext {
        CpuContext {
            vtime_now,
            ..Default::default()
        }
    }

    #[test]
    fn ema_helpers() {
        assert_eq!(calc_avg(0, 1024), 256);
        assert_eq!(calc_avg(1024, 1024), 1024);
        // 10ms interval -> 10 wakeups per 100ms.
        assert_eq!(update_freq(0, 10 * NSEC_PER_MSEC), 2);
        assert_eq!(update_freq(7, 0), 7);
        assert_eq!(update_freq(WAKE_FREQ_MAX, 1), WAKE_FREQ_MAX);
    }

    #[test]
    fn background_penalty_orders_after_unclassified() {
        let cfg = EngineConfig::default();
        let c = cpu(1_000_000);
        let win = WindowView::default();

        let mut a = task(Some(Role::Background), 8);
        let mut b = task(None, 1);
        let da = task_deadline(&cfg, &mut a, &c, &win, 100);
        let db = task_deadline(&cfg, &mut b, &c, &win, 100);
        assert!(db < da);
        assert_eq!(da, 32 * NSEC_PER_MSEC);
        assert_eq!(db, NSEC_PER_MSEC);
    }

    #[test]
    fn smaller_exec_runtime_never_gets_a_later_deadline() {
        let cfg = EngineConfig::default();
        let c = cpu(50 * NSEC_PER_MSEC);
        let roles = [None, Some(Role::Input), Some(Role::GpuSubmit), Some(Role::Background)];
        for active in [false, true] {
            let win = WindowView {
                input_active: active,
                ..Default::default()
            };
            for role in roles {
                let mut prev = 0;
                for exec in [0, 1, 2, 5, 10, 20] {
                    let mut t = task(role, exec);
                    t.vtime = 40 * NSEC_PER_MSEC;
                    let d = task_deadline(&cfg, &mut t, &c, &win, 100);
                    assert!(d >= prev, "{:?} exec {}ms", role, exec);
                    prev = d;
                }
            }
        }
    }

    #[test]
    fn input_boost_needs_a_window() {
        let win_on = WindowView {
            input_active: true,
            ..Default::default()
        };
        let t = task(Some(Role::Input), 16);
        assert_eq!(exec_component(&t, &win_on, 100), 16 * NSEC_PER_MSEC >> 7);
        // Outside the window the input handler is treated like any fg task.
        assert_eq!(exec_component(&t, &WindowView::default(), 100), 16 * NSEC_PER_MSEC);

        // GPU boost is unconditional.
        let g = task(Some(Role::GpuSubmit), 16);
        assert_eq!(exec_component(&g, &WindowView::default(), 100), 16 * NSEC_PER_MSEC >> 6);
    }

    #[test]
    fn non_foreground_and_fault_heavy_tasks_are_penalised() {
        let win = WindowView::default();
        let mut t = task(None, 4);
        t.foreground = false;
        assert_eq!(exec_component(&t, &win, 100), 8 * NSEC_PER_MSEC);

        let mut f = task(None, 4);
        f.pgfault_rate = PGFAULT_PENALTY_THRESH + 1;
        assert_eq!(exec_component(&f, &win, 100), 6 * NSEC_PER_MSEC);

        let mut g = task(Some(Role::GpuSubmit), 4);
        g.pgfault_rate = PGFAULT_PENALTY_THRESH + 1;
        assert_eq!(exec_component(&g, &win, 100), 4 * NSEC_PER_MSEC >> 6);
    }

    #[test]
    fn chain_boost_and_wake_frequency_shorten_generic_deadlines() {
        let win = WindowView::default();
        let mut t = task(None, 8);
        t.chain_boost = CHAIN_BOOST_MAX;
        assert_eq!(exec_component(&t, &win, 100), 2 * NSEC_PER_MSEC);
        t.chain_boost = 0;
        t.wakeup_freq = 3 << WAKE_FREQ_SHIFT;
        assert_eq!(exec_component(&t, &win, 100), 2 * NSEC_PER_MSEC);
    }

    #[test]
    fn long_sleepers_are_clamped_to_the_lag_bound() {
        let cfg = EngineConfig::default();
        let c = cpu(10 * cfg.slice_lag_ns);
        let mut sleeper = task(None, 0);
        let d = task_deadline(&cfg, &mut sleeper, &c, &WindowView::default(), 100);
        assert_eq!(d, 9 * cfg.slice_lag_ns);
        assert_eq!(sleeper.vtime, 9 * cfg.slice_lag_ns);

        // Frequent wakers keep more credit.
        let mut waker = task(None, 0);
        waker.wakeup_freq = 1 << WAKE_FREQ_SHIFT;
        let d = task_deadline(&cfg, &mut waker, &c, &WindowView::default(), 100);
        assert_eq!(d, 8 * cfg.slice_lag_ns);
    }

    #[test]
    fn slice_shrinks_and_floors() {
        let cfg = EngineConfig {
            slice_ns: 1000 * 1000,
            ..Default::default()
        };
        let t = task(None, 0);
        let mut c = cpu(0);
        let win = WindowView {
            input_active: true,
            ..Default::default()
        };
        assert_eq!(task_slice(&cfg, &t, &c, &WindowView::default(), 100), 1_000_000);
        assert_eq!(task_slice(&cfg, &t, &c, &win, 100), 500_000);

        c.interactive_avg = INTERACTIVE_SLICE_SHRINK_THRESH + 1;
        assert_eq!(task_slice(&cfg, &t, &c, &win, 100), 375_000);

        let mut hot = task(None, 0);
        hot.wakeup_freq = INTERACTIVE_SLICE_SHRINK_THRESH + 1;
        assert_eq!(task_slice(&cfg, &hot, &c, &win, 100), 187_500);

        // Continuous input suppresses both the window and frequency shrink.
        let cont = WindowView {
            input_active: true,
            continuous_input: true,
            ..Default::default()
        };
        assert_eq!(task_slice(&cfg, &hot, &c, &cont, 100), 750_000);

        assert_eq!(task_slice(&cfg, &hot, &c, &win, 1), MIN_SLICE_NS);
    }

    #[test]
    fn slice_shrink_starts_between_two_and_four_khz() {
        let cfg = EngineConfig::default();
        let c = cpu(0);
        let win = WindowView::default();
        let settle = |interval: u64| (0..64).fold(0, |f, _| update_freq(f, interval));

        let mut t = task(None, 0);
        t.wakeup_freq = settle(NSEC_PER_MSEC / 2);
        assert!(t.wakeup_freq <= INTERACTIVE_SLICE_SHRINK_THRESH);
        assert_eq!(task_slice(&cfg, &t, &c, &win, 100), cfg.slice_ns);

        t.wakeup_freq = settle(NSEC_PER_MSEC / 4);
        assert!(t.wakeup_freq > INTERACTIVE_SLICE_SHRINK_THRESH);
        assert_eq!(task_slice(&cfg, &t, &c, &win, 100), cfg.slice_ns / 2);
    }
}
