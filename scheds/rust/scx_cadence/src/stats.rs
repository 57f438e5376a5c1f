// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Local;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

use crate::classify::Role;
use crate::classify::NR_ROLES;
use crate::cpu::CpuCounters;

#[stat_doc]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "CPU utilization (0-1024)")]
    pub cpu_util: u64,
    #[stat(desc = "CPU utilization EMA (0-1024)")]
    pub cpu_util_avg: u64,
    #[stat(desc = "Migration limiter bypassed by saturation (1=yes)")]
    pub saturated: u64,
    #[stat(desc = "Live task contexts")]
    pub nr_tasks: u64,
    #[stat(desc = "Housekeeping timer period (ns)")]
    pub timer_period_ns: u64,
    #[stat(desc = "RR enqueues in interval")]
    pub rr_enq: u64,
    #[stat(desc = "EDF enqueues in interval")]
    pub edf_enq: u64,
    #[stat(desc = "Direct dispatches in interval")]
    pub direct: u64,
    #[stat(desc = "Shared dispatches in interval")]
    pub shared: u64,
    #[stat(desc = "Slice extensions in interval")]
    pub slice_extend: u64,
    #[stat(desc = "Tasks re-enqueued after CPU release in interval")]
    pub reenq: u64,
    #[stat(desc = "Migrations in interval")]
    pub migrations: u64,
    #[stat(desc = "Migrations blocked by limiter in interval")]
    pub mig_blocked: u64,
    #[stat(desc = "GPU migrations blocked during input window in interval")]
    pub frame_mig_block: u64,
    #[stat(desc = "Sync wake kept local in interval")]
    pub sync_local: u64,
    #[stat(desc = "SYNC wake fast path hits in interval")]
    pub sync_wake_fast: u64,
    #[stat(desc = "Idle CPU pick hits in interval")]
    pub idle_pick: u64,
    #[stat(desc = "Placement cache hits in interval")]
    pub placement_hit: u64,
    #[stat(desc = "Dedicated tasks placed on a physical core in interval")]
    pub gpu_phys_kept: u64,
    #[stat(desc = "Per-mm hint hits in interval")]
    pub mm_hint_hit: u64,
    #[stat(desc = "Softirq CPU kept during IO window in interval")]
    pub napi_prefer: u64,
    #[stat(desc = "Legacy placement fallbacks in interval")]
    pub dfl_fallback: u64,
    #[stat(desc = "Callbacks without a task context in interval")]
    pub missing_ctx: u64,
    #[stat(desc = "Task contexts dropped, table full (total)")]
    pub table_full: u64,
    #[stat(desc = "Classification hints dropped (total)")]
    pub hint_dropped: u64,
    #[stat(desc = "Foreground TGID (0=off)")]
    pub fg_pid: u64,
    #[stat(desc = "Foreground runtime share % (0-100)")]
    pub fg_cpu_pct: u64,
    #[stat(desc = "Input window time (ns, total)")]
    pub win_input_ns: u64,
    #[stat(desc = "Frame window time (ns, total)")]
    pub win_frame_ns: u64,
    #[stat(desc = "Wake timer elapsed (ns, total)")]
    pub timer_elapsed_ns: u64,
    #[stat(desc = "Input triggers in interval")]
    pub input_trig: u64,
    #[stat(desc = "Frame triggers in interval")]
    pub frame_trig: u64,
    #[stat(desc = "IO preference triggers in interval")]
    pub io_trig: u64,
    #[stat(desc = "Input trigger rate (events/sec, EMA)")]
    pub input_trigger_rate: u64,
    #[stat(desc = "Continuous input mode active (1=yes, 0=no)")]
    pub continuous_input_mode: u64,
    #[stat(desc = "Input handler threads detected (live count)")]
    pub input_handler_threads: u64,
    #[stat(desc = "GPU submission threads detected (live count)")]
    pub gpu_submit_threads: u64,
    #[stat(desc = "Game network threads detected (live count)")]
    pub game_network_threads: u64,
    #[stat(desc = "Interrupt threads detected (live count)")]
    pub interrupt_threads: u64,
    #[stat(desc = "Network threads detected (live count)")]
    pub network_threads: u64,
    #[stat(desc = "Compositor threads detected (live count)")]
    pub compositor_threads: u64,
    #[stat(desc = "System audio threads detected (live count)")]
    pub system_audio_threads: u64,
    #[stat(desc = "Game audio threads detected (live count)")]
    pub game_audio_threads: u64,
    #[stat(desc = "Storage threads detected (live count)")]
    pub storage_threads: u64,
    #[stat(desc = "Background/batch threads detected (live count)")]
    pub background_threads: u64,
}

impl Metrics {
    /// Copy the per-CPU event totals into the matching fields.
    pub fn set_counters(&mut self, c: &CpuCounters) {
        self.rr_enq = c.rr_enq;
        self.edf_enq = c.edf_enq;
        self.direct = c.direct;
        self.shared = c.shared;
        self.slice_extend = c.slice_extend;
        self.reenq = c.reenq;
        self.migrations = c.migrations;
        self.mig_blocked = c.mig_blocked;
        self.frame_mig_block = c.frame_mig_block;
        self.sync_local = c.sync_local;
        self.sync_wake_fast = c.sync_wake_fast;
        self.idle_pick = c.idle_pick;
        self.placement_hit = c.placement_hit;
        self.gpu_phys_kept = c.gpu_phys_kept;
        self.mm_hint_hit = c.mm_hint_hit;
        self.napi_prefer = c.napi_prefer;
        self.dfl_fallback = c.dfl_fallback;
        self.missing_ctx = c.missing_ctx;
        self.fg_cpu_pct = if c.total_runtime_ns > 0 {
            c.fg_runtime_ns.saturating_mul(100) / c.total_runtime_ns
        } else {
            0
        };
    }

    pub fn set_live(&mut self, live: &[u64; NR_ROLES]) {
        let n = |r: Role| live[r.idx()];
        self.input_handler_threads = n(Role::Input);
        self.gpu_submit_threads = n(Role::GpuSubmit);
        self.game_network_threads = n(Role::GamingNetwork);
        self.interrupt_threads = n(Role::Interrupt);
        self.network_threads = n(Role::Network);
        self.compositor_threads = n(Role::Compositor);
        self.system_audio_threads = n(Role::SystemAudio);
        self.game_audio_threads = n(Role::GameAudio);
        self.storage_threads = n(Role::Storage);
        self.background_threads = n(Role::Background);
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let edf_pct = if self.rr_enq + self.edf_enq > 0 {
            (self.edf_enq as f64) * 100.0 / (self.rr_enq + self.edf_enq) as f64
        } else {
            0.0
        };
        let fg = if self.fg_pid != 0 {
            format!("  FG {}", self.fg_pid)
        } else {
            String::new()
        };
        let (in_pct, fr_pct) = if self.timer_elapsed_ns > 0 {
            (
                (self.win_input_ns as f64) * 100.0 / (self.timer_elapsed_ns as f64),
                (self.win_frame_ns as f64) * 100.0 / (self.timer_elapsed_ns as f64),
            )
        } else {
            (0.0, 0.0)
        };
        let direct_pct = if self.rr_enq + self.direct > 0 {
            (self.direct as f64) * 100.0 / (self.rr_enq + self.direct) as f64
        } else {
            0.0
        };

        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::SCHEDULER_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ CPU {:>5.1}% (avg {:>5.1}%{})  EDF {:>4.1}%  tasks {:>5}{}",
            (self.cpu_util as f64) * 100.0 / 1024.0,
            (self.cpu_util_avg as f64) * 100.0 / 1024.0,
            if self.saturated != 0 { " sat" } else { "" },
            edf_pct,
            self.nr_tasks,
            fg
        )?;
        writeln!(
            w,
            "│ q: rr {:>6}  edf {:>6}  dir {:>6} ({:>4.0}%)  sh {:>6}  ext {:>6}  reenq {:>4}",
            self.rr_enq,
            self.edf_enq,
            self.direct,
            direct_pct,
            self.shared,
            self.slice_extend,
            self.reenq
        )?;
        let input_mode = if self.continuous_input_mode != 0 {
            format!("CONT@{}/s", self.input_trigger_rate)
        } else {
            format!("i:{:>5}", self.input_trig)
        };
        writeln!(
            w,
            "│ win: in {:>4.0}%  fr {:>4.0}%   FG {:>3}%   trig {} f:{:>5} io:{:>5}",
            in_pct, fr_pct, self.fg_cpu_pct, input_mode, self.frame_trig, self.io_trig
        )?;
        writeln!(
            w,
            "│ pick: idle {:>6}  phys {:>6}  cache {:>6}  mm {:>6}  napi {:>6}  dfl {:>6}",
            self.idle_pick,
            self.gpu_phys_kept,
            self.placement_hit,
            self.mm_hint_hit,
            self.napi_prefer,
            self.dfl_fallback
        )?;
        writeln!(
            w,
            "│ mig {:>6}  blk {:>6}  sync {:>6}  fblk {:>6}  syncfast {:>6}",
            self.migrations,
            self.mig_blocked,
            self.sync_local,
            self.frame_mig_block,
            self.sync_wake_fast
        )?;
        writeln!(
            w,
            "│ threads: input {:>2}  gpu {:>2}  gnet {:>2}  irq {:>2}  net {:>2}  comp {:>2}  sys_aud {:>2}  gm_aud {:>2}  io {:>2}  bg {:>2}",
            self.input_handler_threads,
            self.gpu_submit_threads,
            self.game_network_threads,
            self.interrupt_threads,
            self.network_threads,
            self.compositor_threads,
            self.system_audio_threads,
            self.game_audio_threads,
            self.storage_threads,
            self.background_threads
        )?;
        if self.missing_ctx + self.table_full + self.hint_dropped > 0 {
            writeln!(
                w,
                "│ degraded: no-ctx {:>5}  table-full {:>5}  hint-drop {:>5}",
                self.missing_ctx, self.table_full, self.hint_dropped
            )?;
        }
        writeln!(w, "└─")?;
        Ok(())
    }

    fn delta(&self, prev: &Self) -> Self {
        Self {
            rr_enq: self.rr_enq.saturating_sub(prev.rr_enq),
            edf_enq: self.edf_enq.saturating_sub(prev.edf_enq),
            direct: self.direct.saturating_sub(prev.direct),
            shared: self.shared.saturating_sub(prev.shared),
            slice_extend: self.slice_extend.saturating_sub(prev.slice_extend),
            reenq: self.reenq.saturating_sub(prev.reenq),
            migrations: self.migrations.saturating_sub(prev.migrations),
            mig_blocked: self.mig_blocked.saturating_sub(prev.mig_blocked),
            frame_mig_block: self.frame_mig_block.saturating_sub(prev.frame_mig_block),
            sync_local: self.sync_local.saturating_sub(prev.sync_local),
            sync_wake_fast: self.sync_wake_fast.saturating_sub(prev.sync_wake_fast),
            idle_pick: self.idle_pick.saturating_sub(prev.idle_pick),
            placement_hit: self.placement_hit.saturating_sub(prev.placement_hit),
            gpu_phys_kept: self.gpu_phys_kept.saturating_sub(prev.gpu_phys_kept),
            mm_hint_hit: self.mm_hint_hit.saturating_sub(prev.mm_hint_hit),
            napi_prefer: self.napi_prefer.saturating_sub(prev.napi_prefer),
            dfl_fallback: self.dfl_fallback.saturating_sub(prev.dfl_fallback),
            missing_ctx: self.missing_ctx.saturating_sub(prev.missing_ctx),
            win_input_ns: self.win_input_ns.saturating_sub(prev.win_input_ns),
            win_frame_ns: self.win_frame_ns.saturating_sub(prev.win_frame_ns),
            timer_elapsed_ns: self.timer_elapsed_ns.saturating_sub(prev.timer_elapsed_ns),
            input_trig: self.input_trig.saturating_sub(prev.input_trig),
            frame_trig: self.frame_trig.saturating_sub(prev.frame_trig),
            io_trig: self.io_trig.saturating_sub(prev.io_trig),
            // Live values, totals and rates pass through.
            ..self.clone()
        }
    }
}

/// Read-only view of the most recently published metrics.
pub type MetricsHandle = Arc<ArcSwap<Metrics>>;

/// Folds per-CPU counters into global totals and keeps the live per-role
/// thread counts. Only the housekeeping timer mutates it.
#[derive(Debug)]
pub struct StatsAggregator {
    totals: CpuCounters,
    live: [u64; NR_ROLES],
    /// Role deltas absorbed since the last settle, summed over all CPUs.
    pending: [i64; NR_ROLES],
    epoch: u32,
    snapshot: MetricsHandle,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            totals: CpuCounters::default(),
            live: [0; NR_ROLES],
            pending: [0; NR_ROLES],
            epoch: 0,
            snapshot: Arc::new(ArcSwap::from_pointee(Metrics::default())),
        }
    }

    /// Add one CPU's drained counters.
    pub fn absorb(&mut self, c: &CpuCounters) {
        let t = &mut self.totals;
        t.idle_pick += c.idle_pick;
        t.placement_hit += c.placement_hit;
        t.gpu_phys_kept += c.gpu_phys_kept;
        t.mm_hint_hit += c.mm_hint_hit;
        t.sync_wake_fast += c.sync_wake_fast;
        t.sync_local += c.sync_local;
        t.napi_prefer += c.napi_prefer;
        t.dfl_fallback += c.dfl_fallback;
        t.migrations += c.migrations;
        t.mig_blocked += c.mig_blocked;
        t.frame_mig_block += c.frame_mig_block;
        t.direct += c.direct;
        t.rr_enq += c.rr_enq;
        t.edf_enq += c.edf_enq;
        t.shared += c.shared;
        t.slice_extend += c.slice_extend;
        t.reenq += c.reenq;
        t.missing_ctx += c.missing_ctx;
        t.fg_runtime_ns += c.fg_runtime_ns;
        t.total_runtime_ns += c.total_runtime_ns;

        for (sum, &delta) in self.pending.iter_mut().zip(&c.role_delta) {
            *sum += delta;
        }
    }

    /// Apply the role deltas absorbed since the last call.
    ///
    /// A thread's +1 and -1 may land on different CPUs, so only the net sum
    /// over every absorbed CPU is applied and clamped.
    pub fn settle_live(&mut self) {
        for (live, sum) in self.live.iter_mut().zip(self.pending.iter_mut()) {
            let delta = std::mem::take(sum);
            *live = if delta < 0 {
                live.saturating_sub(delta.unsigned_abs())
            } else {
                live.saturating_add(delta as u64)
            };
        }
    }

    pub fn totals(&self) -> &CpuCounters {
        &self.totals
    }

    pub fn live(&self) -> &[u64; NR_ROLES] {
        &self.live
    }

    pub fn live_count(&self, role: Role) -> u64 {
        self.live[role.idx()]
    }

    /// Epoch the live counts belong to.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Zero the live counts and start a new epoch. Tasks counted under an
    /// older epoch are no longer subtracted when they exit.
    pub fn reset_live(&mut self) -> u32 {
        self.live = [0; NR_ROLES];
        self.pending = [0; NR_ROLES];
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    pub fn publish(&self, m: Metrics) {
        self.snapshot.store(Arc::new(m));
    }

    pub fn handle(&self) -> MetricsHandle {
        self.snapshot.clone()
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    scx_utils::monitor_stats::<Metrics>(
        &[],
        intv,
        || shutdown.load(Ordering::Relaxed),
        |metrics| metrics.format(&mut std::io::stdout()),
    )
}
