// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The policy engine.
//!
//! [`Engine`] owns every task and CPU context and implements the host
//! callback surface, the periodic housekeeping [`Engine::tick`] and the
//! trigger surface. Callbacks never fail: when state is missing they fall
//! back to a conservative decision and bump `missing_ctx`. Only
//! [`Engine::init`], [`Engine::on_task_created`] and a failed timer re-arm
//! in [`Engine::tick`] return errors.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use rustc_hash::FxHashMap;

use crate::boost::BoostWindows;
use crate::boost::InputLane;
use crate::boost::WindowView;
use crate::classify::BehaviorChange;
use crate::classify::Classification;
use crate::classify::ClassifierChain;
use crate::classify::ClassifyInput;
use crate::classify::Role;
use crate::classify::RoleFlags;
use crate::classify::RoleHint;
use crate::classify::Scope;
use crate::classify::Source;
use crate::classify::ROLES;
use crate::config::EngineConfig;
use crate::config::BEHAVIOR_RECLASSIFY_WAKES;
use crate::config::CHAIN_BOOST_MAX;
use crate::config::CHAIN_BOOST_STEP;
use crate::config::CPUFREQ_LOW;
use crate::config::MAX_CPUS;
use crate::config::MM_HINT_UPDATE_INTERVAL_NS;
use crate::config::NSEC_PER_MSEC;
use crate::config::NSEC_PER_USEC;
use crate::config::SCX_CPUPERF_ONE;
use crate::config::TASK_TABLE_MAX;
use crate::config::TIMER_IDLE_SCALE;
use crate::config::TIMER_MIN_PERIOD_NS;
use crate::cpu::CpuContext;
use crate::cpu::CpuCounters;
use crate::cpu_select::SelectCtx;
use crate::cpu_select::Selector;
use crate::cpu_select::Topology;
use crate::error::EngineError;
use crate::host::CpuId;
use crate::host::DispatchDecision;
use crate::host::EnqFlags;
use crate::host::EnqueueDecision;
use crate::host::Host;
use crate::host::Pid;
use crate::host::TaskView;
use crate::host::WakeDecision;
use crate::host::WakeFlags;
use crate::host::Waker;
use crate::migration::allow_migration;
use crate::migration::Admission;
use crate::migration::MigrationCtx;
use crate::migration::SaturationGate;
use crate::stats::Metrics;
use crate::stats::MetricsHandle;
use crate::stats::StatsAggregator;
use crate::task::TaskContext;
use crate::trigger::HintQueue;
use crate::trigger::TriggerHandle;
use crate::trigger::TriggerOps;
use crate::trigger::WindowTrigger;
use crate::vtime::calc_avg;
use crate::vtime::scale_inverse_weight;
use crate::vtime::task_deadline;
use crate::vtime::task_slice;
use crate::vtime::update_freq;

/// Shared queue used by every CPU unless NUMA splits it per node.
pub const SHARED_DSQ: u64 = MAX_CPUS as u64;

const KICK_WORDS: usize = MAX_CPUS / 64;

/// Hints applied per tick; the rest wait for the next one.
const HINT_DRAIN_MAX: usize = 256;

type InputTriggerFn = fn(&WindowTrigger, &BoostWindows, InputLane, u64);

static GENERATION: AtomicU32 = AtomicU32::new(0);

/// Next process-wide engine generation. Never the "unclassified" marker.
fn next_generation() -> u32 {
    let gen = GENERATION.fetch_add(1, Ordering::Relaxed);
    if gen == u32::MAX {
        GENERATION.fetch_add(1, Ordering::Relaxed)
    } else {
        gen
    }
}

fn counters_of<'a>(
    cpus: &'a mut [CpuContext],
    stray: &'a mut CpuCounters,
    cpu: CpuId,
) -> &'a mut CpuCounters {
    match usize::try_from(cpu).ok().and_then(|i| cpus.get_mut(i)) {
        Some(c) => &mut c.counters,
        None => stray,
    }
}

fn count_roles(counters: &mut CpuCounters, flags: RoleFlags, delta: i64) {
    for role in ROLES {
        if flags.contains(role.flag()) {
            counters.role_delta[role.idx()] += delta;
        }
    }
}

fn apply_role(
    tctx: &mut TaskContext,
    class: Option<Classification>,
    counters: &mut CpuCounters,
) -> bool {
    let (removed, added) = tctx.set_role(class);
    count_roles(counters, removed, -1);
    count_roles(counters, added, 1);
    !(removed.is_empty() && added.is_empty())
}

/// Classification state borrowed from the engine for one callback.
struct Classify<'a> {
    chain: &'a ClassifierChain,
    windows: &'a BoostWindows,
    generation: u32,
    epoch: u32,
}

impl Classify<'_> {
    fn scope(&self, task: &TaskView) -> Scope {
        let fg = self.windows.foreground();
        Scope {
            foreground: self.windows.is_foreground(task.tgid),
            fg_main: fg != 0 && fg as Pid == task.tgid && task.pid == task.tgid,
        }
    }

    /// Bring the task's roles up to date. Returns whether they changed.
    fn refresh(
        &self,
        tctx: &mut TaskContext,
        task: &TaskView,
        counters: &mut CpuCounters,
        periodic: bool,
    ) -> bool {
        let scope = self.scope(task);
        tctx.foreground = scope.foreground;

        let class = if tctx.needs_classification(self.generation) {
            if tctx.counted_epoch == self.epoch {
                count_roles(counters, tctx.roles, -1);
            }
            tctx.forget_roles();
            tctx.generation = self.generation;
            tctx.counted_epoch = self.epoch;

            let hint = tctx.pending_hint.take();
            let input = ClassifyInput {
                comm: &task.comm,
                scope,
                hint,
                behavior: &tctx.behavior,
            };
            self.chain.classify(&input)
        } else if let Some(hint) = tctx.pending_hint.take() {
            if tctx.source == Some(Source::Name) || !scope.admits(hint.role) {
                return false;
            }
            Some(hint)
        } else if periodic && !matches!(tctx.source, Some(Source::Name | Source::Hint)) {
            tctx.behavior
                .verdict()
                .filter(|c| c.committed() && scope.admits(c.role))
        } else {
            return false;
        };

        apply_role(tctx, class, counters)
    }

    /// Follow a commit or revoke reported by the behavior tracker.
    fn behavior_changed(
        &self,
        tctx: &mut TaskContext,
        task: &TaskView,
        change: BehaviorChange,
        counters: &mut CpuCounters,
    ) -> bool {
        // Stale tasks are redone from scratch at their next wakeup.
        if tctx.needs_classification(self.generation)
            || matches!(tctx.source, Some(Source::Name | Source::Hint))
        {
            return false;
        }
        let class = match change {
            BehaviorChange::Committed(_) => {
                let scope = self.scope(task);
                tctx.behavior.verdict().filter(|c| scope.admits(c.role))
            }
            BehaviorChange::Revoked(_) => None,
        };
        apply_role(tctx, class, counters)
    }
}

pub struct Engine<H: Host> {
    cfg: EngineConfig,
    host: H,
    selector: Selector,
    chain: ClassifierChain,
    tasks: FxHashMap<Pid, TaskContext>,
    cpus: Vec<CpuContext>,
    /// Counters for events that could not be tied to a known CPU.
    stray: CpuCounters,

    windows: Arc<BoostWindows>,
    hints: Arc<HintQueue>,
    trigger: WindowTrigger,
    input_trigger_fn: InputTriggerFn,

    stats: StatsAggregator,
    generation: u32,
    kick: [u64; KICK_WORDS],
    saturation: SaturationGate,
    cpu_util: u64,
    cpu_util_avg: u64,
    /// Wake frequency EMA over foreground tasks.
    interactive_sys_avg: u64,

    timer_period: u64,
    last_tick: u64,
    timer_elapsed_ns: u64,
    win_input_ns: u64,
    win_frame_ns: u64,
    table_full: u64,
}

impl<H: Host> Engine<H> {
    pub fn init(cfg: EngineConfig, topo: Topology, mut host: H) -> Result<Self, EngineError> {
        let cfg = cfg.validated()?;

        if !host.supports_idle_and() {
            if !host.supports_select_cpu_dfl() {
                return Err(EngineError::Unsupported("idle CPU selection"));
            }
            info!("host lacks mask-based idle search, using legacy CPU selection");
        }

        let numa = cfg.enable_numa && topo.nr_nodes() > 1;
        let cpus = (0..topo.nr_cpus())
            .map(|cpu| {
                let dsq = if numa {
                    topo.node(cpu as CpuId) as u64
                } else {
                    SHARED_DSQ
                };
                CpuContext::new(dsq)
            })
            .collect();

        // Mouse input is the lane that tends to race network replies.
        let input_trigger_fn: InputTriggerFn = if cfg.prefer_napi_on_input {
            |trig, windows, lane, now| match lane {
                InputLane::Mouse => trig.trigger_input_with_napi_lane(windows, lane, now),
                _ => trig.trigger_input_lane(windows, lane, now),
            }
        } else {
            |trig, windows, lane, now| trig.trigger_input_lane(windows, lane, now)
        };

        let period = cfg.timer_period_ns();
        if !host.arm_timer(period) {
            return Err(EngineError::TimerArm(period));
        }

        let chain = ClassifierChain::default();
        info!(
            "{} engine: {} cpus, {} node(s), SMT {}, slice {}us, lag {}ms, classifiers {:?}",
            crate::SCHEDULER_NAME,
            topo.nr_cpus(),
            topo.nr_nodes(),
            if topo.smt_enabled() { "on" } else { "off" },
            cfg.slice_ns / NSEC_PER_USEC,
            cfg.slice_lag_ns / NSEC_PER_MSEC,
            chain.names(),
        );
        if cfg.migration_limited() {
            info!(
                "migration limit: {} per {}ms",
                cfg.mig_max,
                cfg.mig_window_ns / NSEC_PER_MSEC
            );
        }

        let now = host.now();
        Ok(Self {
            windows: Arc::new(BoostWindows::new(&cfg)),
            hints: Arc::new(HintQueue::default()),
            trigger: WindowTrigger,
            input_trigger_fn,
            selector: Selector::new(topo, &cfg),
            chain,
            tasks: FxHashMap::default(),
            cpus,
            stray: CpuCounters::default(),
            stats: StatsAggregator::new(),
            generation: next_generation(),
            kick: [0; KICK_WORDS],
            saturation: SaturationGate::new(cfg.mig_saturation_enter, cfg.mig_saturation_exit),
            cpu_util: 0,
            cpu_util_avg: 0,
            interactive_sys_avg: 0,
            timer_period: period,
            last_tick: now,
            timer_elapsed_ns: 0,
            win_input_ns: 0,
            win_frame_ns: 0,
            table_full: 0,
            host,
            cfg,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn topology(&self) -> &Topology {
        self.selector.topology()
    }

    pub fn task(&self, pid: Pid) -> Option<&TaskContext> {
        self.tasks.get(&pid)
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&CpuContext> {
        self.cpu_idx(cpu).map(|i| &self.cpus[i])
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn windows(&self) -> Arc<BoostWindows> {
        self.windows.clone()
    }

    pub fn metrics(&self) -> MetricsHandle {
        self.stats.handle()
    }

    pub fn cpu_util_avg(&self) -> u64 {
        self.cpu_util_avg
    }

    pub fn timer_period(&self) -> u64 {
        self.timer_period
    }

    /// Hand out the trigger surface to event sources on other threads.
    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle::new(self.windows.clone(), self.hints.clone())
    }

    /// Give up the task table, e.g. to a restarted engine.
    pub fn into_tasks(self) -> FxHashMap<Pid, TaskContext> {
        self.tasks
    }

    /// Take over task contexts left by a previous engine.
    ///
    /// Their classification belongs to another generation and is redone at
    /// the next wakeup. Their old roles were never counted here.
    pub fn adopt_tasks(&mut self, tasks: FxHashMap<Pid, TaskContext>) {
        let stale_epoch = self.stats.epoch().wrapping_sub(1);
        for (pid, mut tctx) in tasks {
            if self.tasks.len() >= TASK_TABLE_MAX {
                self.table_full += 1;
                continue;
            }
            tctx.counted_epoch = stale_epoch;
            self.tasks.entry(pid).or_insert(tctx);
        }
    }

    #[inline]
    fn cpu_idx(&self, cpu: CpuId) -> Option<usize> {
        usize::try_from(cpu).ok().filter(|&i| i < self.cpus.len())
    }

    #[inline]
    fn busy(&self) -> bool {
        self.cpu_util_avg >= self.cfg.busy_threshold
    }

    pub fn on_task_created(&mut self, task: &TaskView, cpu: CpuId) -> Result<(), EngineError> {
        if self.tasks.contains_key(&task.pid) {
            return Ok(());
        }
        if self.tasks.len() >= TASK_TABLE_MAX {
            if self.table_full == 0 {
                warn!(
                    "task table full ({} entries), new tasks are left to host defaults",
                    TASK_TABLE_MAX
                );
            }
            self.table_full += 1;
            return Err(EngineError::TableFull(TASK_TABLE_MAX));
        }

        let vtime = self.cpu_idx(cpu).map_or(0, |i| self.cpus[i].vtime_now);
        let mut tctx = TaskContext::new(task, &self.cfg, vtime);
        tctx.last_cpu = cpu;

        let class = Classify {
            chain: &self.chain,
            windows: &self.windows,
            generation: self.generation,
            epoch: self.stats.epoch(),
        };
        let counters = counters_of(&mut self.cpus, &mut self.stray, cpu);
        class.refresh(&mut tctx, task, counters, false);

        self.tasks.insert(task.pid, tctx);
        Ok(())
    }

    /// The task became runnable. Refreshes its classification and tries to
    /// place it on an idle CPU.
    pub fn on_wakeup(
        &mut self,
        task: &TaskView,
        prev_cpu: CpuId,
        flags: WakeFlags,
        waker: Option<Waker>,
    ) -> WakeDecision {
        let now = self.host.now();
        let busy = self.busy();
        let Some(ci) = self.cpu_idx(prev_cpu) else {
            self.stray.missing_ctx += 1;
            return WakeDecision::Default;
        };
        let cpu = &mut self.cpus[ci];
        let Some(tctx) = self.tasks.get_mut(&task.pid) else {
            cpu.counters.missing_ctx += 1;
            return WakeDecision::Default;
        };

        let interval = if tctx.last_woke_at == 0 {
            0
        } else {
            now.saturating_sub(tctx.last_woke_at)
        };
        tctx.wakeup_freq = update_freq(tctx.wakeup_freq, interval);
        tctx.wake_interval = interval;
        tctx.last_woke_at = now;
        tctx.exec_runtime = 0;
        tctx.chain_boost >>= 1;
        tctx.wakes = tctx.wakes.wrapping_add(1);
        cpu.interactive_avg = calc_avg(cpu.interactive_avg, tctx.wakeup_freq);

        let periodic = tctx.wakes % BEHAVIOR_RECLASSIFY_WAKES == 0;
        let class = Classify {
            chain: &self.chain,
            windows: &self.windows,
            generation: self.generation,
            epoch: self.stats.epoch(),
        };
        class.refresh(tctx, task, &mut cpu.counters, periodic);

        if tctx.foreground {
            self.interactive_sys_avg = calc_avg(self.interactive_sys_avg, tctx.wakeup_freq);
        }

        let win = self.windows.view(now);
        let dedicated = tctx.has(Role::GpuSubmit);

        if flags.contains(WakeFlags::SYNC) && tctx.foreground && !dedicated && win.input_active {
            tctx.chain_boost = (tctx.chain_boost + CHAIN_BOOST_STEP).min(CHAIN_BOOST_MAX);
            let target = waker
                .map(|w| w.cpu)
                .filter(|&c| self.selector.topology().contains(c) && self.host.cpu_allowed(task, c))
                .unwrap_or(prev_cpu);
            cpu.counters.sync_wake_fast += 1;
            return WakeDecision::Dispatch {
                cpu: target,
                slice_ns: task_slice(&self.cfg, tctx, cpu, &win, task.weight),
            };
        }

        let sctx = SelectCtx {
            task,
            prev_cpu,
            flags,
            from_enqueue: false,
            dedicated,
            foreground: tctx.foreground,
            win,
            busy,
            interactive_avg: self.interactive_sys_avg,
            now,
        };

        if let Some(target) = self.selector.wake_affine(&mut self.host, &sctx, waker) {
            cpu.counters.sync_local += 1;
            return WakeDecision::Dispatch {
                cpu: target,
                slice_ns: task_slice(&self.cfg, tctx, cpu, &win, task.weight),
            };
        }

        match self.selector.pick_idle_cpu(
            &mut self.host,
            &sctx,
            &mut tctx.placement,
            &mut cpu.counters,
        ) {
            Some(target) => WakeDecision::Dispatch {
                cpu: target,
                slice_ns: task_slice(&self.cfg, tctx, cpu, &win, task.weight),
            },
            None => WakeDecision::Default,
        }
    }

    /// Queue a runnable task. `cpu` is the CPU the task is currently
    /// assigned to.
    pub fn on_enqueue(&mut self, task: &TaskView, cpu: CpuId, flags: EnqFlags) -> EnqueueDecision {
        let now = self.host.now();
        let busy = self.busy();
        let saturated = self.saturation.saturated();
        let Some(ci) = self.cpu_idx(cpu) else {
            self.stray.missing_ctx += 1;
            return EnqueueDecision::Shared {
                dsq: SHARED_DSQ,
                slice_ns: self.cfg.slice_ns,
                deadline: 0,
            };
        };
        let smt_contended = self.selector.smt_contended(&self.host, cpu);
        let win = self.windows.view(now);
        let cpu_ctx = &mut self.cpus[ci];

        let Some(tctx) = self.tasks.get_mut(&task.pid) else {
            cpu_ctx.counters.missing_ctx += 1;
            self.kick[ci / 64] |= 1 << (ci % 64);
            return EnqueueDecision::Local {
                cpu,
                slice_ns: self.cfg.slice_ns,
            };
        };

        let attempt = smt_contended
            || flags.contains(EnqFlags::REENQ)
            || !flags.intersects(EnqFlags::CPU_SELECTED | EnqFlags::PREEMPTED);

        if attempt {
            let frame_block =
                tctx.has(Role::GpuSubmit) && (win.input_active || win.frame_active);
            let mctx = MigrationCtx {
                now,
                pinned: task.is_pinned(),
                disabled: frame_block,
                smt_contended,
                saturated,
                window_ns: self.cfg.mig_window_ns,
                max_tokens: self.cfg.max_mig_tokens(),
            };

            match allow_migration(&mut tctx.bucket, &mctx) {
                Admission::Blocked => cpu_ctx.counters.mig_blocked += 1,
                Admission::Denied if frame_block && !mctx.pinned => {
                    cpu_ctx.counters.frame_mig_block += 1
                }
                adm if adm.allowed() => {
                    cpu_ctx.counters.migrations += 1;
                    let sctx = SelectCtx {
                        task,
                        prev_cpu: cpu,
                        flags: WakeFlags::empty(),
                        from_enqueue: true,
                        dedicated: tctx.has(Role::GpuSubmit),
                        foreground: tctx.foreground,
                        win,
                        busy,
                        interactive_avg: self.interactive_sys_avg,
                        now,
                    };
                    if let Some(target) = self.selector.pick_idle_cpu(
                        &mut self.host,
                        &sctx,
                        &mut tctx.placement,
                        &mut cpu_ctx.counters,
                    ) {
                        cpu_ctx.counters.direct += 1;
                        self.host.kick_cpu(target);
                        return EnqueueDecision::Direct {
                            cpu: target,
                            slice_ns: task_slice(&self.cfg, tctx, cpu_ctx, &win, task.weight),
                        };
                    }
                }
                _ => {}
            }
        }

        let slice_ns = task_slice(&self.cfg, tctx, cpu_ctx, &win, task.weight);
        if !busy || (tctx.foreground && win.input_active) {
            cpu_ctx.counters.rr_enq += 1;
            self.kick[ci / 64] |= 1 << (ci % 64);
            return EnqueueDecision::Local { cpu, slice_ns };
        }

        let deadline = task_deadline(&self.cfg, tctx, cpu_ctx, &win, task.weight);
        cpu_ctx.counters.edf_enq += 1;
        EnqueueDecision::Shared {
            dsq: cpu_ctx.shared_dsq,
            slice_ns,
            deadline,
        }
    }

    /// `cpu` ran out of local work. `prev` is the task that just ran there,
    /// passed only if it is still runnable.
    pub fn on_dispatch(&mut self, cpu: CpuId, prev: Option<&TaskView>) -> DispatchDecision {
        let Some(ci) = self.cpu_idx(cpu) else {
            self.stray.missing_ctx += 1;
            return DispatchDecision::Idle;
        };

        if self.host.move_shared_to_local(self.cpus[ci].shared_dsq, cpu) {
            self.cpus[ci].counters.shared += 1;
            return DispatchDecision::Consumed;
        }

        let Some(prev) = prev else {
            return DispatchDecision::Idle;
        };
        if self.selector.smt_contended(&self.host, cpu) {
            return DispatchDecision::Idle;
        }

        let win = self.windows.view(self.host.now());
        let slice_ns = match self.tasks.get(&prev.pid) {
            Some(tctx) => task_slice(&self.cfg, tctx, &self.cpus[ci], &win, prev.weight),
            None => self.cfg.slice_ns,
        };
        self.cpus[ci].counters.slice_extend += 1;
        DispatchDecision::ExtendPrev { slice_ns }
    }

    pub fn on_running(&mut self, task: &TaskView, cpu: CpuId) {
        let now = self.host.now();
        let Some(ci) = self.cpu_idx(cpu) else {
            self.stray.missing_ctx += 1;
            return;
        };
        let cpu_ctx = &mut self.cpus[ci];
        let Some(tctx) = self.tasks.get_mut(&task.pid) else {
            cpu_ctx.counters.missing_ctx += 1;
            return;
        };

        tctx.last_run_at = now;
        tctx.last_cpu = cpu;
        cpu_ctx.advance_vtime(tctx.vtime);

        if !self.cfg.disable_cpufreq {
            if let Some(perf) = cpu_ctx.perf.pending() {
                self.host.set_cpuperf(cpu, perf);
            }
        }

        if self.selector.mm_hint_enabled()
            && task.mm != 0
            && (tctx.mm_hint_last_update == 0
                || now.saturating_sub(tctx.mm_hint_last_update) >= MM_HINT_UPDATE_INTERVAL_NS)
        {
            self.selector.note_mm_cpu(task.mm, cpu);
            tctx.mm_hint_last_update = now;
        }
    }

    /// The task stopped running. `runnable` is false when it is going to
    /// sleep, which ends its wake cycle.
    pub fn on_stopping(&mut self, task: &TaskView, cpu: CpuId, runnable: bool) {
        let now = self.host.now();
        let Some(ci) = self.cpu_idx(cpu) else {
            self.stray.missing_ctx += 1;
            return;
        };
        let cpu_ctx = &mut self.cpus[ci];
        let Some(tctx) = self.tasks.get_mut(&task.pid) else {
            cpu_ctx.counters.missing_ctx += 1;
            return;
        };

        let slice = now.saturating_sub(tctx.last_run_at).min(self.cfg.slice_ns);
        tctx.vtime = tctx
            .vtime
            .saturating_add(scale_inverse_weight(slice, task.weight));
        tctx.exec_runtime = (tctx.exec_runtime + slice).min(self.cfg.slice_lag_ns);
        tctx.exec_avg = calc_avg(tctx.exec_avg, tctx.exec_runtime);

        let faults = task.pgfault_total.saturating_sub(tctx.last_pgfault_total);
        tctx.last_pgfault_total = task.pgfault_total;
        tctx.pgfault_rate = calc_avg(tctx.pgfault_rate, faults);

        if !self.cfg.disable_cpufreq {
            cpu_ctx.perf.update_load(now, slice);
        }
        cpu_ctx.counters.total_runtime_ns += slice;
        if tctx.foreground {
            cpu_ctx.counters.fg_runtime_ns += slice;
        }

        if runnable {
            if tctx.chain_boost > 0 {
                tctx.chain_boost = (tctx.chain_boost - 1).max(1);
            }
            return;
        }

        if tctx.wake_interval == 0 {
            return;
        }
        if let Some(change) = tctx.behavior.update(tctx.wake_interval, tctx.exec_runtime) {
            let class = Classify {
                chain: &self.chain,
                windows: &self.windows,
                generation: self.generation,
                epoch: self.stats.epoch(),
            };
            class.behavior_changed(tctx, task, change, &mut cpu_ctx.counters);
        }
    }

    /// A higher priority scheduling class took `cpu`; push its local queue
    /// back through enqueue.
    pub fn on_cpu_release(&mut self, cpu: CpuId) {
        let n = self.host.reenqueue_local(cpu);
        counters_of(&mut self.cpus, &mut self.stray, cpu).reenq += n as u64;
    }

    pub fn on_task_destroyed(&mut self, task: &TaskView) {
        let Some(tctx) = self.tasks.remove(&task.pid) else {
            return;
        };
        // Counts from before the last reset are gone already.
        if tctx.counted_epoch == self.stats.epoch() {
            let counters = counters_of(&mut self.cpus, &mut self.stray, tctx.last_cpu);
            count_roles(counters, tctx.roles, -1);
        }
    }

    pub fn trigger_input_boost(&self, lane: InputLane) {
        (self.input_trigger_fn)(&self.trigger, &self.windows, lane, self.host.now());
    }

    pub fn trigger_frame_boost(&self) {
        self.trigger.trigger_frame(&self.windows, self.host.now());
    }

    pub fn trigger_io_preference_window(&self) {
        self.trigger
            .trigger_io_preference(&self.windows, self.host.now());
    }

    /// Queue a classification hint, applied at the task's next wakeup.
    pub fn post_hint(&self, hint: RoleHint) -> bool {
        self.hints.post(hint)
    }

    /// Stage a new foreground process. Adopted by the next tick.
    pub fn set_foreground(&self, tgid: u32) {
        self.windows.stage_foreground(tgid);
    }

    /// Housekeeping timer body. Must be serialized with itself.
    pub fn tick(&mut self) -> Result<(), EngineError> {
        let now = self.host.now();
        let elapsed = now.saturating_sub(self.last_tick);
        self.last_tick = now;

        self.flush_kicks();

        let nr_cpus = self.cpus.len() as u64;
        let busy = (0..self.cpus.len())
            .filter(|&cpu| !self.host.is_cpu_idle(cpu as CpuId))
            .count() as u64;
        self.cpu_util = busy * SCX_CPUPERF_ONE / nr_cpus.max(1);
        self.cpu_util_avg = calc_avg(self.cpu_util_avg, self.cpu_util);
        if self.saturation.update(self.cpu_util_avg) {
            info!(
                "migration limiter {} (util {}/{})",
                if self.saturation.saturated() { "bypassed" } else { "engaged" },
                self.cpu_util_avg,
                SCX_CPUPERF_ONE
            );
        }

        self.windows.drain_commands(now);
        let win = self.windows.view(now);
        self.timer_elapsed_ns += elapsed;
        if win.input_active {
            self.win_input_ns += elapsed;
        }
        if win.frame_active {
            self.win_frame_ns += elapsed;
        }
        self.windows.expire(now);

        self.drain_hints();

        for cpu in &mut self.cpus {
            self.stats.absorb(&cpu.counters.drain());
        }
        self.stats.absorb(&self.stray.drain());
        self.stats.settle_live();

        if let Some((old, new)) = self.windows.adopt_foreground() {
            info!("foreground {} -> {}, live role counts reset", old, new);
            self.stats.reset_live();
            self.generation = next_generation();
        }

        if !self.cfg.no_stats {
            self.stats.publish(self.snapshot());
        }

        let period = self.next_period(&win);
        if !self.host.arm_timer(period) {
            return Err(EngineError::TimerArm(period));
        }
        if period != self.timer_period {
            debug!("timer period {}us", period / NSEC_PER_USEC);
            self.timer_period = period;
        }
        Ok(())
    }

    fn flush_kicks(&mut self) {
        for (w, word) in self.kick.iter_mut().enumerate() {
            let mut mask = std::mem::take(word);
            while mask != 0 {
                let cpu = (w * 64 + mask.trailing_zeros() as usize) as CpuId;
                mask &= mask - 1;
                if self.host.local_queued(cpu) > 0 && self.host.is_cpu_idle(cpu) {
                    self.host.kick_cpu(cpu);
                }
            }
        }
    }

    fn drain_hints(&mut self) {
        for _ in 0..HINT_DRAIN_MAX {
            let Some(hint) = self.hints.pop() else {
                break;
            };
            let class = Classification {
                role: hint.role,
                confidence: hint.confidence,
                source: Source::Hint,
            };
            if !class.committed() {
                continue;
            }
            if let Some(tctx) = self.tasks.get_mut(&hint.pid) {
                tctx.pending_hint = Some(class);
            }
        }
    }

    fn next_period(&self, win: &WindowView) -> u64 {
        let base = self.cfg.timer_period_ns();
        let quiet = !win.input_active
            && !win.frame_active
            && !win.io_active
            && self.cpu_util_avg < CPUFREQ_LOW;

        if win.continuous_input {
            (base / 2).max(TIMER_MIN_PERIOD_NS)
        } else if self.cfg.no_stats || quiet {
            base * TIMER_IDLE_SCALE
        } else {
            base
        }
    }

    /// Current metrics, built from the last aggregated totals.
    pub fn snapshot(&self) -> Metrics {
        let mut m = Metrics {
            cpu_util: self.cpu_util,
            cpu_util_avg: self.cpu_util_avg,
            saturated: u64::from(self.saturation.saturated()),
            nr_tasks: self.tasks.len() as u64,
            timer_period_ns: self.timer_period,
            table_full: self.table_full,
            hint_dropped: self.hints.dropped(),
            fg_pid: self.windows.foreground() as u64,
            win_input_ns: self.win_input_ns,
            win_frame_ns: self.win_frame_ns,
            timer_elapsed_ns: self.timer_elapsed_ns,
            input_trig: self.windows.input_trig.load(Ordering::Relaxed),
            frame_trig: self.windows.frame_trig.load(Ordering::Relaxed),
            io_trig: self.windows.io_trig.load(Ordering::Relaxed),
            input_trigger_rate: self.windows.input_rate(),
            continuous_input_mode: u64::from(self.windows.continuous_input()),
            ..Default::default()
        };
        m.set_counters(self.stats.totals());
        m.set_live(self.stats.live());
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::Window;
    use crate::host::mock::MockHost;

    const MS: u64 = NSEC_PER_MSEC;

    fn engine_with(cfg: EngineConfig, host: MockHost) -> Engine<MockHost> {
        let topo = Topology::flat(host.idle.len()).unwrap();
        Engine::init(cfg, topo, host).unwrap()
    }

    fn engine(nr_cpus: usize) -> Engine<MockHost> {
        engine_with(EngineConfig::default(), MockHost::new(nr_cpus))
    }

    /// Configuration under which every CPU counts as busy.
    fn busy_cfg() -> EngineConfig {
        EngineConfig {
            busy_threshold: 0,
            ..Default::default()
        }
    }

    fn at(e: &mut Engine<MockHost>, now: u64) {
        e.host_mut().now = now;
    }

    fn spawn(e: &mut Engine<MockHost>, pid: Pid, tgid: Pid, name: &str) -> TaskView {
        let t = TaskView::new(pid, tgid, name);
        e.on_task_created(&t, 0).unwrap();
        t
    }

    /// One full wake cycle: wake, run for `run` ns, sleep.
    fn cycle(e: &mut Engine<MockHost>, t: &TaskView, wake_at: u64, run: u64) {
        at(e, wake_at);
        e.on_wakeup(t, 0, WakeFlags::empty(), None);
        e.host_mut().idle[0] = true;
        e.on_running(t, 0);
        at(e, wake_at + run);
        e.on_stopping(t, 0, false);
    }

    #[test]
    fn init_arms_the_timer() {
        let e = engine(4);
        assert_eq!(e.host().armed, vec![500 * NSEC_PER_USEC]);
        assert_eq!(e.cpu(3).unwrap().shared_dsq, SHARED_DSQ);
        assert!(e.cpu(4).is_none());
    }

    #[test]
    fn init_reports_fatal_environment_errors() {
        let host = MockHost {
            timer_ok: false,
            ..MockHost::new(2)
        };
        let err = Engine::init(EngineConfig::default(), Topology::flat(2).unwrap(), host);
        assert!(matches!(err, Err(EngineError::TimerArm(_))));

        let host = MockHost {
            legacy: true,
            no_dfl: true,
            ..MockHost::new(2)
        };
        let err = Engine::init(EngineConfig::default(), Topology::flat(2).unwrap(), host);
        assert!(matches!(err, Err(EngineError::Unsupported(_))));

        let bad = EngineConfig {
            slice_ns: 0,
            ..Default::default()
        };
        let err = Engine::init(bad, Topology::flat(2).unwrap(), MockHost::new(2));
        assert!(matches!(err, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn numa_splits_the_shared_queue_per_node() {
        let cfg = EngineConfig {
            enable_numa: true,
            ..Default::default()
        };
        let topo = Topology::new(4, &[], &[0, 0, 1, 1]).unwrap();
        let e = Engine::init(cfg, topo, MockHost::new(4)).unwrap();
        assert_eq!(e.cpu(0).unwrap().shared_dsq, 0);
        assert_eq!(e.cpu(3).unwrap().shared_dsq, 1);
    }

    #[test]
    fn vtime_now_never_decreases() {
        let mut e = engine(2);
        let a = spawn(&mut e, 10, 10, "a");
        let b = spawn(&mut e, 11, 11, "b");

        e.tasks.get_mut(&10).unwrap().vtime = 5_000;
        e.on_running(&a, 0);
        assert_eq!(e.cpu(0).unwrap().vtime_now, 5_000);

        e.tasks.get_mut(&11).unwrap().vtime = 1_000;
        e.on_running(&b, 0);
        assert_eq!(e.cpu(0).unwrap().vtime_now, 5_000);

        at(&mut e, 8 * NSEC_PER_USEC);
        e.on_stopping(&a, 0, true);
        e.on_running(&a, 0);
        assert!(e.cpu(0).unwrap().vtime_now > 5_000);
    }

    #[test]
    fn fourth_migration_in_the_window_is_blocked() {
        let mut e = engine(8);
        let t = spawn(&mut e, 10, 10, "worker");

        let mut direct = 0;
        for i in 0..4 {
            at(&mut e, MS + i * 3 * MS);
            match e.on_enqueue(&t, 0, EnqFlags::WAKEUP) {
                EnqueueDecision::Direct { .. } => direct += 1,
                EnqueueDecision::Local { cpu, .. } => assert_eq!(cpu, 0),
                d => panic!("unexpected {:?}", d),
            }
        }
        assert_eq!(direct, 3);

        e.tick().unwrap();
        let totals = e.stats().totals();
        assert_eq!(totals.migrations, 3);
        assert_eq!(totals.mig_blocked, 1);
    }

    #[test]
    fn selected_or_pinned_tasks_do_not_migrate() {
        let mut e = engine(4);
        let t = spawn(&mut e, 10, 10, "worker");
        let d = e.on_enqueue(&t, 1, EnqFlags::WAKEUP | EnqFlags::CPU_SELECTED);
        assert!(matches!(d, EnqueueDecision::Local { cpu: 1, .. }));

        let pinned = TaskView {
            nr_cpus_allowed: 1,
            ..TaskView::new(11, 11, "pinned")
        };
        e.on_task_created(&pinned, 2).unwrap();
        let d = e.on_enqueue(&pinned, 2, EnqFlags::WAKEUP);
        assert!(matches!(d, EnqueueDecision::Local { cpu: 2, .. }));
    }

    #[test]
    fn gpu_submit_stays_put_while_frames_are_in_flight() {
        let mut e = engine(4);
        let t = spawn(&mut e, 10, 10, "dxvk-submit");
        assert!(e.task(10).unwrap().has(Role::GpuSubmit));

        at(&mut e, MS);
        e.trigger_frame_boost();
        let d = e.on_enqueue(&t, 1, EnqFlags::WAKEUP);
        assert!(matches!(d, EnqueueDecision::Local { cpu: 1, .. }));

        e.tick().unwrap();
        assert_eq!(e.stats().totals().frame_mig_block, 1);
        assert_eq!(e.stats().totals().migrations, 0);
    }

    #[test]
    fn busy_system_queues_by_deadline() {
        let mut e = engine_with(busy_cfg(), MockHost::new(2).all_busy());
        let bg = spawn(&mut e, 10, 10, "bg");
        let fg = spawn(&mut e, 11, 11, "fg");
        e.tasks.get_mut(&10).unwrap().set_role(Some(Classification {
            role: Role::Background,
            confidence: 100,
            source: Source::Hint,
        }));
        e.tasks.get_mut(&10).unwrap().exec_runtime = 8 * MS;
        e.tasks.get_mut(&11).unwrap().exec_runtime = MS;

        let flags = EnqFlags::WAKEUP | EnqFlags::CPU_SELECTED;
        let EnqueueDecision::Shared { dsq, deadline: d_bg, .. } = e.on_enqueue(&bg, 0, flags) else {
            panic!("expected shared queue");
        };
        let EnqueueDecision::Shared { deadline: d_fg, .. } = e.on_enqueue(&fg, 0, flags) else {
            panic!("expected shared queue");
        };
        assert_eq!(dsq, SHARED_DSQ);
        assert!(d_fg < d_bg);
    }

    #[test]
    fn input_window_keeps_foreground_local_when_busy() {
        let mut e = engine_with(busy_cfg(), MockHost::new(2).all_busy());
        let t = spawn(&mut e, 10, 10, "worker");
        e.trigger_input_boost(InputLane::Keyboard);
        let d = e.on_enqueue(&t, 1, EnqFlags::WAKEUP | EnqFlags::CPU_SELECTED);
        assert!(matches!(d, EnqueueDecision::Local { cpu: 1, .. }));
    }

    #[test]
    fn deferred_kicks_hit_idle_cpus_with_work() {
        let mut e = engine(4);
        let t = spawn(&mut e, 10, 10, "worker");
        let flags = EnqFlags::WAKEUP | EnqFlags::CPU_SELECTED;
        e.on_enqueue(&t, 1, flags);
        e.on_enqueue(&t, 2, flags);
        e.host_mut().queued[1] = 1;
        e.host_mut().queued[2] = 1;
        e.host_mut().idle[2] = false;

        e.tick().unwrap();
        assert_eq!(e.host().kicked, vec![1]);

        // The bitmap was cleared.
        e.tick().unwrap();
        assert_eq!(e.host().kicked, vec![1]);
    }

    #[test]
    fn sync_wakeup_during_input_stays_with_the_waker() {
        let mut e = engine(4);
        let t = spawn(&mut e, 10, 10, "worker");
        at(&mut e, MS);
        e.trigger_input_boost(InputLane::Keyboard);

        let waker = Waker { cpu: 3, mm: 99 };
        let d = e.on_wakeup(&t, 0, WakeFlags::SYNC, Some(waker));
        assert_eq!(d.target(), Some(3));
        assert_eq!(e.task(10).unwrap().chain_boost, CHAIN_BOOST_STEP);

        // Without an input window the normal idle search runs.
        at(&mut e, 5 * NSEC_PER_MSEC * 1000);
        let d = e.on_wakeup(&t, 0, WakeFlags::SYNC, Some(waker));
        assert_eq!(d.target(), Some(0));

        e.tick().unwrap();
        assert_eq!(e.stats().totals().sync_wake_fast, 1);
    }

    #[test]
    fn chain_boost_halves_on_wake_and_decays_on_stop() {
        let mut e = engine(2);
        let t = spawn(&mut e, 10, 10, "worker");
        e.tasks.get_mut(&10).unwrap().chain_boost = CHAIN_BOOST_MAX;

        e.on_stopping(&t, 0, true);
        assert_eq!(e.task(10).unwrap().chain_boost, CHAIN_BOOST_MAX - 1);
        e.on_wakeup(&t, 0, WakeFlags::empty(), None);
        assert_eq!(e.task(10).unwrap().chain_boost, (CHAIN_BOOST_MAX - 1) >> 1);
    }

    #[test]
    fn no_idle_cpu_leaves_placement_to_the_host() {
        let mut e = engine(2);
        e.host_mut().idle = vec![false, false];
        let t = spawn(&mut e, 10, 10, "worker");
        assert_eq!(e.on_wakeup(&t, 1, WakeFlags::empty(), None), WakeDecision::Default);
    }

    #[test]
    fn dispatch_consumes_shared_then_extends_prev() {
        let mut e = engine(2);
        let t = spawn(&mut e, 10, 10, "worker");
        e.host_mut().shared = vec![(SHARED_DSQ, 1)];

        assert_eq!(e.on_dispatch(0, Some(&t)), DispatchDecision::Consumed);
        assert_eq!(e.host().queued[0], 1);
        assert!(matches!(
            e.on_dispatch(0, Some(&t)),
            DispatchDecision::ExtendPrev { .. }
        ));
        assert_eq!(e.on_dispatch(0, None), DispatchDecision::Idle);
    }

    #[test]
    fn cpu_release_reenqueues_local_work() {
        let mut e = engine(2);
        e.host_mut().queued[1] = 3;
        e.on_cpu_release(1);
        e.tick().unwrap();
        assert_eq!(e.stats().totals().reenq, 3);
        assert_eq!(e.host().reenqueued, vec![1]);
    }

    #[test]
    fn missing_context_degrades_to_defaults() {
        let mut e = engine(2);
        let ghost = TaskView::new(77, 77, "ghost");

        assert_eq!(e.on_wakeup(&ghost, 1, WakeFlags::empty(), None), WakeDecision::Default);
        let d = e.on_enqueue(&ghost, 1, EnqFlags::WAKEUP);
        assert_eq!(
            d,
            EnqueueDecision::Local {
                cpu: 1,
                slice_ns: e.config().slice_ns
            }
        );
        e.on_running(&ghost, 1);
        e.on_stopping(&ghost, 1, false);
        e.on_wakeup(&ghost, 42, WakeFlags::empty(), None);
        e.on_task_destroyed(&ghost);

        e.tick().unwrap();
        assert_eq!(e.stats().totals().missing_ctx, 5);
    }

    #[test]
    fn live_role_counts_follow_task_lifetimes() {
        let mut e = engine(2);
        let gpu = spawn(&mut e, 10, 10, "dxvk-submit");
        let _comp = spawn(&mut e, 20, 20, "kwin_wayland");
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 1);
        assert_eq!(e.stats().live_count(Role::Compositor), 1);

        e.on_task_destroyed(&gpu);
        e.on_task_destroyed(&gpu);
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 0);
        assert_eq!(e.snapshot().compositor_threads, 1);
    }

    #[test]
    fn short_lived_thread_moving_cpus_is_not_left_counted() {
        let mut e = engine(2);
        let t = TaskView::new(10, 10, "dxvk-submit");
        e.on_task_created(&t, 1).unwrap();
        at(&mut e, MS);
        e.on_running(&t, 0);
        at(&mut e, 2 * MS);
        e.on_stopping(&t, 0, false);
        e.on_task_destroyed(&t);
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 0);
        assert_eq!(e.snapshot().gpu_submit_threads, 0);
    }

    #[test]
    fn foreground_switch_resets_counts_without_going_negative() {
        let mut e = engine(2);
        let gpu = spawn(&mut e, 10, 10, "dxvk-submit");
        let gen = e.generation();
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 1);

        e.set_foreground(500);
        e.tick().unwrap();
        assert_ne!(e.generation(), gen);
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 0);
        assert_eq!(e.snapshot().fg_pid, 500);

        // Counted under the old epoch: its exit must not subtract.
        e.on_task_destroyed(&gpu);
        let game = spawn(&mut e, 501, 500, "dxvk-submit");
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 1);
        assert!(e.task(game.pid).unwrap().foreground);
    }

    #[test]
    fn foreground_switch_reclassifies_on_next_wakeup() {
        let mut e = engine(2);
        let render = spawn(&mut e, 10, 10, "RenderThread");
        assert!(e.task(10).unwrap().has(Role::GpuSubmit));

        // A different game takes the foreground; this render thread is no
        // longer in scope.
        e.set_foreground(900);
        e.tick().unwrap();
        e.on_wakeup(&render, 0, WakeFlags::empty(), None);
        let t = e.task(10).unwrap();
        assert!(!t.foreground);
        assert!(t.roles.is_empty());

        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 0);
    }

    #[test]
    fn foreground_main_thread_is_input() {
        let cfg = EngineConfig {
            foreground_tgid: 300,
            ..Default::default()
        };
        let mut e = engine_with(cfg, MockHost::new(2));
        spawn(&mut e, 300, 300, "game.exe");
        spawn(&mut e, 301, 300, "worker");
        assert!(e.task(300).unwrap().has(Role::Input));
        assert!(e.task(301).unwrap().roles.is_empty());
    }

    #[test]
    fn hint_applies_at_next_wakeup() {
        let mut e = engine(2);
        let t = spawn(&mut e, 10, 10, "wine-thread");
        let weak = RoleHint {
            pid: 10,
            role: Role::GameAudio,
            confidence: 40,
        };
        let strong = RoleHint {
            pid: 10,
            role: Role::GpuSubmit,
            confidence: 95,
        };
        assert!(e.post_hint(weak));
        e.tick().unwrap();
        e.on_wakeup(&t, 0, WakeFlags::empty(), None);
        assert!(e.task(10).unwrap().roles.is_empty());

        assert!(e.trigger_handle().hint(strong));
        e.tick().unwrap();
        assert!(e.task(10).unwrap().roles.is_empty());
        e.on_wakeup(&t, 0, WakeFlags::empty(), None);
        let tctx = e.task(10).unwrap();
        assert!(tctx.has(Role::GpuSubmit));
        assert_eq!(tctx.source, Some(Source::Hint));

        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 1);
    }

    #[test]
    fn hints_do_not_override_name_matches() {
        let mut e = engine(2);
        let t = spawn(&mut e, 10, 10, "pipewire");
        e.post_hint(RoleHint {
            pid: 10,
            role: Role::Background,
            confidence: 100,
        });
        e.tick().unwrap();
        e.on_wakeup(&t, 0, WakeFlags::empty(), None);
        assert!(e.task(10).unwrap().has(Role::SystemAudio));
    }

    #[test]
    fn behavioral_role_commits_once() {
        let mut e = engine(2);
        let t = spawn(&mut e, 10, 10, "worker");

        // 1kHz wakeups with 10us bursts: input-like.
        let mut now = MS;
        for _ in 0..40 {
            cycle(&mut e, &t, now, 10 * NSEC_PER_USEC);
            now += MS;
        }
        let tctx = e.task(10).unwrap();
        assert!(tctx.has(Role::Input));
        assert_eq!(tctx.source, Some(Source::Behavior));

        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::Input), 1);

        for _ in 0..100 {
            cycle(&mut e, &t, now, 10 * NSEC_PER_USEC);
            now += MS;
        }
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::Input), 1);
    }

    #[test]
    fn restarted_engine_reclassifies_adopted_tasks() {
        let mut old = engine(2);
        let t = spawn(&mut old, 10, 10, "dxvk-submit");
        old.tick().unwrap();
        let tasks = old.into_tasks();

        let mut e = engine(2);
        e.adopt_tasks(tasks);
        assert!(e.task(10).unwrap().needs_classification(e.generation()));

        e.on_wakeup(&t, 0, WakeFlags::empty(), None);
        e.tick().unwrap();
        assert_eq!(e.stats().live_count(Role::GpuSubmit), 1);
        assert!(!e.task(10).unwrap().needs_classification(e.generation()));
    }

    #[test]
    fn perf_hint_is_applied_when_running() {
        let mut e = engine(2);
        let t = spawn(&mut e, 10, 10, "worker");
        e.on_running(&t, 1);
        assert_eq!(e.host().perf.len(), 1);
        // Unchanged target is not re-sent.
        e.on_running(&t, 1);
        assert_eq!(e.host().perf.len(), 1);

        let mut off = engine_with(
            EngineConfig {
                disable_cpufreq: true,
                ..Default::default()
            },
            MockHost::new(2),
        );
        let t = spawn(&mut off, 10, 10, "worker");
        off.on_running(&t, 1);
        assert!(off.host().perf.is_empty());
    }

    #[test]
    fn page_faults_feed_the_rate_ema() {
        let mut e = engine(2);
        let mut t = spawn(&mut e, 10, 10, "loader");
        e.on_running(&t, 0);
        t.pgfault_total = 400;
        e.on_stopping(&t, 0, true);
        assert_eq!(e.task(10).unwrap().pgfault_rate, 100);
        e.on_stopping(&t, 0, true);
        assert_eq!(e.task(10).unwrap().pgfault_rate, 75);
    }

    #[test]
    fn foreground_runtime_share_is_reported() {
        let cfg = EngineConfig {
            foreground_tgid: 10,
            ..Default::default()
        };
        let mut e = engine_with(cfg, MockHost::new(2));
        let fg = spawn(&mut e, 10, 10, "game");
        let other = spawn(&mut e, 20, 20, "other");
        for t in [&fg, &other] {
            at(&mut e, 0);
            e.on_running(t, 0);
            at(&mut e, 8 * NSEC_PER_USEC);
            e.on_stopping(t, 0, true);
        }
        e.tick().unwrap();
        assert_eq!(e.snapshot().fg_cpu_pct, 50);
    }

    #[test]
    fn timer_period_adapts() {
        let mut e = engine(2);
        e.tick().unwrap();
        assert_eq!(e.timer_period(), 500 * NSEC_PER_USEC * TIMER_IDLE_SCALE);

        at(&mut e, MS);
        e.trigger_frame_boost();
        e.tick().unwrap();
        assert_eq!(e.timer_period(), 500 * NSEC_PER_USEC);

        let mut now = 2 * MS;
        for _ in 0..20 {
            at(&mut e, now);
            e.trigger_input_boost(InputLane::Mouse);
            now += 2 * MS;
        }
        at(&mut e, now);
        e.tick().unwrap();
        assert!(e.windows().continuous_input());
        assert_eq!(e.timer_period(), 250 * NSEC_PER_USEC);
        assert_eq!(*e.host().armed.last().unwrap(), 250 * NSEC_PER_USEC);
    }

    #[test]
    fn failed_rearm_is_fatal() {
        let mut e = engine(2);
        e.host_mut().timer_ok = false;
        assert!(matches!(e.tick(), Err(EngineError::TimerArm(_))));
    }

    #[test]
    fn tick_drains_posted_commands_and_accounts_windows() {
        let mut e = engine(2);
        let h = e.trigger_handle();
        h.input();
        at(&mut e, MS);
        e.tick().unwrap();
        assert!(e.windows().is_active(Window::Input, MS + 1));

        at(&mut e, 3 * MS);
        e.tick().unwrap();
        let m = e.snapshot();
        assert_eq!(m.input_trig, 1);
        // Each interval is charged to the window state seen at its tick.
        assert_eq!(m.win_input_ns, 3 * MS);
        assert_eq!(m.timer_elapsed_ns, 3 * MS);
        assert_eq!(*e.metrics().load_full(), m);
    }

    #[test]
    fn napi_preference_follows_mouse_input() {
        let cfg = EngineConfig {
            prefer_napi_on_input: true,
            ..Default::default()
        };
        let mut e = engine_with(cfg, MockHost::new(2));
        at(&mut e, MS);
        e.trigger_input_boost(InputLane::Keyboard);
        assert!(!e.windows().is_active(Window::IoPreference, MS));
        e.trigger_input_boost(InputLane::Mouse);
        assert!(e.windows().is_active(Window::IoPreference, MS));
    }

    #[test]
    fn utilization_drives_saturation() {
        let mut e = engine_with(EngineConfig::default(), MockHost::new(4).all_busy());
        for i in 1..=10 {
            at(&mut e, i * MS);
            e.tick().unwrap();
        }
        let m = e.snapshot();
        assert_eq!(m.cpu_util, SCX_CPUPERF_ONE);
        assert!(m.cpu_util_avg >= e.config().mig_saturation_enter);
        assert_eq!(m.saturated, 1);
    }
}
