// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic event-driven host.
//!
//! A [`Scenario`] describes CPUs, tasks with run/sleep phases and external
//! triggers. [`Simulator`] replays it against an [`Engine`] on a virtual
//! clock and reports per-role dispatch counts and wake-to-run latency.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::boost::InputLane;
use crate::boost::Window;
use crate::classify::Role;
use crate::classify::RoleHint;
use crate::config::EngineConfig;
use crate::config::NSEC_PER_MSEC;
use crate::config::NSEC_PER_USEC;
use crate::cpu_select::Topology;
use crate::engine::Engine;
use crate::host::Comm;
use crate::host::CpuId;
use crate::host::DispatchDecision;
use crate::host::EnqFlags;
use crate::host::EnqueueDecision;
use crate::host::Host;
use crate::host::Pid;
use crate::host::TaskView;
use crate::host::WakeDecision;
use crate::host::WakeFlags;
use crate::stats::Metrics;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    pub pid: Pid,
    /// Defaults to `pid`.
    pub tgid: Option<Pid>,
    pub weight: u64,
    pub run_us: u64,
    pub sleep_us: u64,
    /// Uniform jitter applied to both phases, in percent.
    pub jitter_pct: u64,
    pub start_us: u64,
    pub exit_ms: Option<u64>,
    pub pinned_cpu: Option<CpuId>,
    pub pgfaults_per_run: u64,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            pid: 0,
            tgid: None,
            weight: 100,
            run_us: 100,
            sleep_us: 1000,
            jitter_pct: 10,
            start_us: 0,
            exit_ms: None,
            pinned_cpu: None,
            pgfaults_per_run: 0,
        }
    }
}

/// A periodic trigger source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSpec {
    pub window: Window,
    pub lane: InputLane,
    pub start_ms: u64,
    pub every_us: u64,
    pub stop_ms: Option<u64>,
    /// CPU that handles the softirq work behind an IO trigger.
    pub softirq_cpu: Option<CpuId>,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            window: Window::Input,
            lane: InputLane::Mouse,
            start_ms: 0,
            every_us: 1000,
            stop_ms: None,
            softirq_cpu: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HintSpec {
    pub at_ms: u64,
    #[serde(flatten)]
    pub hint: RoleHint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForegroundSpec {
    pub at_ms: u64,
    pub tgid: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseSpec {
    pub at_ms: u64,
    pub cpu: CpuId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub nr_cpus: usize,
    pub smt_pairs: Vec<(CpuId, CpuId)>,
    pub nodes: Vec<u32>,
    pub config: EngineConfig,
    /// Foreground tgid at start; 0 treats every task as foreground.
    pub foreground: u32,
    pub duration_ms: u64,
    pub seed: u64,
    /// Run without the mask-based idle primitive.
    pub legacy_host: bool,
    pub tasks: Vec<TaskSpec>,
    pub triggers: Vec<TriggerSpec>,
    pub hints: Vec<HintSpec>,
    pub foreground_switches: Vec<ForegroundSpec>,
    pub cpu_releases: Vec<ReleaseSpec>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            nr_cpus: 4,
            smt_pairs: Vec::new(),
            nodes: Vec::new(),
            config: EngineConfig::default(),
            foreground: 0,
            duration_ms: 1000,
            seed: 0,
            legacy_host: false,
            tasks: Vec::new(),
            triggers: Vec::new(),
            hints: Vec::new(),
            foreground_switches: Vec::new(),
            cpu_releases: Vec::new(),
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let scenario: Scenario = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))?;
        scenario.check()?;
        Ok(scenario)
    }

    fn check(&self) -> Result<()> {
        if self.duration_ms == 0 {
            bail!("scenario duration must be non-zero");
        }
        let mut pids = BTreeSet::new();
        for t in &self.tasks {
            if t.pid <= 0 || !pids.insert(t.pid) {
                bail!("task {:?}: pid {} is invalid or duplicated", t.name, t.pid);
            }
            if t.run_us == 0 {
                bail!("task {:?}: run_us must be non-zero", t.name);
            }
            if let Some(cpu) = t.pinned_cpu {
                if cpu < 0 || cpu as usize >= self.nr_cpus {
                    bail!("task {:?}: pinned to missing cpu {}", t.name, cpu);
                }
            }
        }
        if self.triggers.iter().any(|t| t.every_us == 0) {
            bail!("trigger period must be non-zero");
        }
        Ok(())
    }

    /// A small gaming desktop: a game with input, render and audio
    /// threads, a compositor, and background batch work.
    pub fn demo() -> Self {
        let task = |pid: Pid, tgid: Pid, name: &str, run_us: u64, sleep_us: u64| TaskSpec {
            name: name.into(),
            pid,
            tgid: Some(tgid),
            run_us,
            sleep_us,
            ..Default::default()
        };
        let mut tasks = vec![
            task(1000, 1000, "game.exe", 300, 700),
            task(1001, 1000, "RenderThread", 2000, 4900),
            task(1002, 1000, "dxvk-submit", 800, 6100),
            task(1003, 1000, "FAudio", 80, 2600),
            task(1004, 1000, "UdpSocket", 40, 4000),
            task(2000, 2000, "kwin_wayland", 400, 6500),
            task(2100, 2100, "pipewire", 60, 2600),
        ];
        for i in 0..6 {
            tasks.push(TaskSpec {
                pgfaults_per_run: 200,
                ..task(3000 + i, 3000, "cc1plus", 20_000, 500)
            });
        }
        Self {
            nr_cpus: 8,
            smt_pairs: vec![(0, 4), (1, 5), (2, 6), (3, 7)],
            foreground: 1000,
            duration_ms: 2000,
            tasks,
            triggers: vec![
                TriggerSpec {
                    start_ms: 100,
                    every_us: 1000,
                    stop_ms: Some(1500),
                    ..Default::default()
                },
                TriggerSpec {
                    window: Window::Frame,
                    every_us: 6944,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct SimCpu {
    current: Option<Pid>,
    local: VecDeque<Pid>,
    /// Claimed by the engine for a task that has not started yet.
    reserved: bool,
    perf: u32,
}

/// In-memory host backing the simulator.
#[derive(Debug)]
pub struct SimHost {
    now: u64,
    cpus: Vec<SimCpu>,
    shared: FxHashMap<u64, BTreeSet<(u64, u64, Pid)>>,
    shared_seq: u64,
    pinned: FxHashMap<Pid, CpuId>,
    softirq_until: Vec<u64>,
    legacy: bool,
    kicks: Vec<CpuId>,
    reenqueued: Vec<Pid>,
    timer_period: u64,
    perf_requests: u64,
}

impl SimHost {
    pub fn new(nr_cpus: usize, legacy: bool) -> Self {
        Self {
            now: 0,
            cpus: (0..nr_cpus).map(|_| SimCpu::default()).collect(),
            shared: FxHashMap::default(),
            shared_seq: 0,
            pinned: FxHashMap::default(),
            softirq_until: vec![0; nr_cpus],
            legacy,
            kicks: Vec::new(),
            reenqueued: Vec::new(),
            timer_period: 0,
            perf_requests: 0,
        }
    }

    fn cpu(&self, cpu: CpuId) -> Option<&SimCpu> {
        usize::try_from(cpu).ok().and_then(|i| self.cpus.get(i))
    }

    fn cpu_mut(&mut self, cpu: CpuId) -> Option<&mut SimCpu> {
        usize::try_from(cpu).ok().and_then(|i| self.cpus.get_mut(i))
    }

    fn push_shared(&mut self, dsq: u64, deadline: u64, pid: Pid) {
        self.shared_seq += 1;
        self.shared
            .entry(dsq)
            .or_default()
            .insert((deadline, self.shared_seq, pid));
    }

    pub fn shared_len(&self) -> usize {
        self.shared.values().map(BTreeSet::len).sum()
    }

    pub fn perf(&self, cpu: CpuId) -> Option<u32> {
        self.cpu(cpu).map(|c| c.perf)
    }
}

impl Host for SimHost {
    fn now(&self) -> u64 {
        self.now
    }

    fn is_cpu_idle(&self, cpu: CpuId) -> bool {
        self.cpu(cpu)
            .is_some_and(|c| c.current.is_none() && c.local.is_empty() && !c.reserved)
    }

    fn claim_idle_cpu(&mut self, cpu: CpuId) -> bool {
        if !self.is_cpu_idle(cpu) {
            return false;
        }
        if let Some(c) = self.cpu_mut(cpu) {
            c.reserved = true;
        }
        true
    }

    fn cpu_allowed(&self, task: &TaskView, cpu: CpuId) -> bool {
        match self.pinned.get(&task.pid) {
            Some(&p) => p == cpu,
            None => self.cpu(cpu).is_some(),
        }
    }

    fn supports_idle_and(&self) -> bool {
        !self.legacy
    }

    fn select_cpu_dfl(&mut self, task: &TaskView, prev_cpu: CpuId, _flags: WakeFlags) -> Option<CpuId> {
        let nr = self.cpus.len() as CpuId;
        let start = prev_cpu.clamp(0, nr - 1);
        (0..nr)
            .map(|i| (start + i) % nr)
            .find(|&cpu| self.cpu_allowed(task, cpu) && self.claim_idle_cpu(cpu))
    }

    fn move_shared_to_local(&mut self, dsq: u64, cpu: CpuId) -> bool {
        let Some(local) = usize::try_from(cpu)
            .ok()
            .and_then(|i| self.cpus.get_mut(i))
            .map(|c| &mut c.local)
        else {
            return false;
        };
        let Some((_, _, pid)) = self.shared.get_mut(&dsq).and_then(BTreeSet::pop_first) else {
            return false;
        };
        local.push_back(pid);
        true
    }

    fn local_queued(&self, cpu: CpuId) -> u32 {
        self.cpu(cpu).map_or(0, |c| c.local.len() as u32)
    }

    fn kick_cpu(&mut self, cpu: CpuId) {
        self.kicks.push(cpu);
    }

    fn reenqueue_local(&mut self, cpu: CpuId) -> u32 {
        let Some(c) = self.cpu_mut(cpu) else {
            return 0;
        };
        let drained: Vec<Pid> = c.local.drain(..).collect();
        let n = drained.len() as u32;
        self.reenqueued.extend(drained);
        n
    }

    fn set_cpuperf(&mut self, cpu: CpuId, perf: u32) {
        if let Some(c) = self.cpu_mut(cpu) {
            c.perf = perf;
        }
        self.perf_requests += 1;
    }

    fn recent_softirq(&self, cpu: CpuId) -> bool {
        usize::try_from(cpu)
            .ok()
            .and_then(|i| self.softirq_until.get(i))
            .is_some_and(|&until| self.now < until)
    }

    fn arm_timer(&mut self, period_ns: u64) -> bool {
        self.timer_period = period_ns;
        period_ns > 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    Create(Pid),
    Wake(Pid),
    RunEnd { cpu: CpuId, pid: Pid },
    Resched(CpuId),
    Timer,
    Trigger(usize),
    Hint(usize),
    Foreground(u32),
    Release(CpuId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Event {
    at: u64,
    seq: u64,
    kind: EventKind,
}

#[derive(Debug)]
struct SimTask {
    spec: TaskSpec,
    tgid: Pid,
    comm: Comm,
    cpu: CpuId,
    pgfault_total: u64,
    remaining: u64,
    run_len: u64,
    slice: u64,
    woke_at: Option<u64>,
    alive: bool,
    dispatches: u64,
    latency_sum: u64,
    latency_max: u64,
    wakeups: u64,
}

impl SimTask {
    fn view(&self, nr_cpus: usize) -> TaskView {
        TaskView {
            pid: self.spec.pid,
            tgid: self.tgid,
            mm: self.tgid as u64,
            weight: self.spec.weight,
            nr_cpus_allowed: if self.spec.pinned_cpu.is_some() {
                1
            } else {
                nr_cpus as u32
            },
            comm: self.comm,
            pgfault_total: self.pgfault_total,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub pid: Pid,
    pub name: String,
    pub role: String,
    pub dispatches: u64,
    pub wakeups: u64,
    pub mean_latency_ns: u64,
    pub max_latency_ns: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleReport {
    pub tasks: u64,
    pub dispatches: u64,
    pub wakeups: u64,
    pub mean_latency_ns: u64,
    pub max_latency_ns: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub duration_ns: u64,
    pub tasks: Vec<TaskReport>,
    pub roles: BTreeMap<String, RoleReport>,
    pub metrics: Metrics,
}

impl Report {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "simulated {}ms, {} tasks",
            self.duration_ns / NSEC_PER_MSEC,
            self.tasks.len()
        )?;
        writeln!(
            w,
            "{:<10} {:>6} {:>10} {:>10} {:>12} {:>12}",
            "role", "tasks", "dispatch", "wakeups", "mean_lat_us", "max_lat_us"
        )?;
        for (role, r) in &self.roles {
            writeln!(
                w,
                "{:<10} {:>6} {:>10} {:>10} {:>12.1} {:>12.1}",
                role,
                r.tasks,
                r.dispatches,
                r.wakeups,
                r.mean_latency_ns as f64 / NSEC_PER_USEC as f64,
                r.max_latency_ns as f64 / NSEC_PER_USEC as f64,
            )?;
        }
        Ok(())
    }
}

pub struct Simulator {
    engine: Engine<SimHost>,
    tasks: BTreeMap<Pid, SimTask>,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    rng: StdRng,
    end: u64,
    triggers: Vec<TriggerSpec>,
    hints: Vec<HintSpec>,
}

impl Simulator {
    pub fn new(scenario: Scenario) -> Result<Self> {
        scenario.check()?;

        let topo = Topology::new(scenario.nr_cpus, &scenario.smt_pairs, &scenario.nodes)?;
        let mut host = SimHost::new(scenario.nr_cpus, scenario.legacy_host);
        let mut config = scenario.config.clone();
        config.foreground_tgid = scenario.foreground;

        let mut tasks = BTreeMap::new();
        for spec in scenario.tasks {
            if let Some(cpu) = spec.pinned_cpu {
                host.pinned.insert(spec.pid, cpu);
            }
            let cpu = spec
                .pinned_cpu
                .unwrap_or(spec.pid.rem_euclid(scenario.nr_cpus as Pid));
            tasks.insert(
                spec.pid,
                SimTask {
                    tgid: spec.tgid.unwrap_or(spec.pid),
                    comm: Comm::new(&spec.name),
                    cpu,
                    pgfault_total: 0,
                    remaining: 0,
                    run_len: 0,
                    slice: 0,
                    woke_at: None,
                    alive: false,
                    dispatches: 0,
                    latency_sum: 0,
                    latency_max: 0,
                    wakeups: 0,
                    spec,
                },
            );
        }

        let engine = Engine::init(config, topo, host).context("failed to initialize engine")?;
        let mut sim = Self {
            engine,
            tasks,
            events: BinaryHeap::new(),
            seq: 0,
            rng: StdRng::seed_from_u64(scenario.seed),
            end: scenario.duration_ms * NSEC_PER_MSEC,
            triggers: scenario.triggers,
            hints: scenario.hints,
        };

        let starts: Vec<(Pid, u64)> = sim
            .tasks
            .values()
            .map(|t| (t.spec.pid, t.spec.start_us * NSEC_PER_USEC))
            .collect();
        for (pid, at) in starts {
            sim.push(at, EventKind::Create(pid));
        }
        for i in 0..sim.triggers.len() {
            sim.push(sim.triggers[i].start_ms * NSEC_PER_MSEC, EventKind::Trigger(i));
        }
        for i in 0..sim.hints.len() {
            sim.push(sim.hints[i].at_ms * NSEC_PER_MSEC, EventKind::Hint(i));
        }
        for s in scenario.foreground_switches {
            sim.push(s.at_ms * NSEC_PER_MSEC, EventKind::Foreground(s.tgid));
        }
        for r in scenario.cpu_releases {
            sim.push(r.at_ms * NSEC_PER_MSEC, EventKind::Release(r.cpu));
        }
        let period = sim.engine.host().timer_period;
        sim.push(period, EventKind::Timer);

        Ok(sim)
    }

    pub fn engine(&self) -> &Engine<SimHost> {
        &self.engine
    }

    fn push(&mut self, at: u64, kind: EventKind) {
        self.seq += 1;
        self.events.push(Reverse(Event {
            at,
            seq: self.seq,
            kind,
        }));
    }

    fn now(&self) -> u64 {
        self.engine.host().now
    }

    fn nr_cpus(&self) -> usize {
        self.engine.host().cpus.len()
    }

    fn jitter(&mut self, base: u64, pct: u64) -> u64 {
        if pct == 0 || base == 0 {
            return base;
        }
        let span = base * pct.min(100) / 100;
        (base - span + self.rng.gen_range(0..=2 * span)).max(1)
    }

    /// Virtual time at which the scenario ends.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn done(&self) -> bool {
        self.now() >= self.end
    }

    /// Process every event up to `until` (capped at the scenario end) and
    /// move the clock there.
    pub fn advance(&mut self, until: u64) -> Result<()> {
        let until = until.min(self.end);
        while let Some(&Reverse(ev)) = self.events.peek() {
            if ev.at > until {
                break;
            }
            self.events.pop();
            self.engine.host_mut().now = ev.at;
            self.handle(ev.kind)?;

            let kicks = std::mem::take(&mut self.engine.host_mut().kicks);
            for cpu in kicks {
                self.push(ev.at, EventKind::Resched(cpu));
            }
        }
        if self.now() < until {
            self.engine.host_mut().now = until;
        }
        Ok(())
    }

    /// Replay the rest of the scenario and build the report.
    pub fn run(mut self) -> Result<Report> {
        self.advance(self.end)?;
        self.engine.tick()?;
        Ok(self.report())
    }

    fn handle(&mut self, kind: EventKind) -> Result<()> {
        match kind {
            EventKind::Create(pid) => self.create(pid),
            EventKind::Wake(pid) => self.wake(pid),
            EventKind::RunEnd { cpu, pid } => self.run_end(cpu, pid),
            EventKind::Resched(cpu) => self.resched(cpu),
            EventKind::Timer => {
                self.engine.tick().context("housekeeping timer failed")?;
                let next = self.now() + self.engine.host().timer_period;
                self.push(next, EventKind::Timer);
            }
            EventKind::Trigger(i) => self.fire(i),
            EventKind::Hint(i) => {
                let hint = self.hints[i].hint;
                if !self.engine.post_hint(hint) {
                    debug!("hint for {} dropped", hint.pid);
                }
            }
            EventKind::Foreground(tgid) => self.engine.set_foreground(tgid),
            EventKind::Release(cpu) => self.release(cpu),
        }
        Ok(())
    }

    fn create(&mut self, pid: Pid) {
        let nr_cpus = self.nr_cpus();
        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        let view = t.view(nr_cpus);
        if let Err(e) = self.engine.on_task_created(&view, t.cpu) {
            debug!("task {} left unmanaged: {}", pid, e);
        }
        t.alive = true;
        let now = self.now();
        self.push(now, EventKind::Wake(pid));
    }

    fn wake(&mut self, pid: Pid) {
        let nr_cpus = self.nr_cpus();
        let now = self.now();
        let Some((run_us, pct)) = self
            .tasks
            .get(&pid)
            .filter(|t| t.alive)
            .map(|t| (t.spec.run_us, t.spec.jitter_pct))
        else {
            return;
        };
        let remaining = self.jitter(run_us * NSEC_PER_USEC, pct);

        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        t.remaining = remaining;
        t.woke_at = Some(now);
        t.wakeups += 1;
        let view = t.view(nr_cpus);
        let prev = t.cpu;

        match self.engine.on_wakeup(&view, prev, WakeFlags::empty(), None) {
            WakeDecision::Dispatch { cpu, slice_ns } => {
                t.slice = slice_ns;
                if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
                    c.local.push_back(pid);
                }
                self.push(now, EventKind::Resched(cpu));
            }
            WakeDecision::Default => {
                let flags = EnqFlags::WAKEUP | EnqFlags::CPU_SELECTED;
                let d = self.engine.on_enqueue(&view, prev, flags);
                self.place(pid, d);
            }
        }
    }

    fn place(&mut self, pid: Pid, decision: EnqueueDecision) {
        let now = self.now();
        let (slice_ns, dsq) = match decision {
            EnqueueDecision::Direct { cpu, slice_ns } => {
                if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
                    c.local.push_front(pid);
                }
                (slice_ns, None)
            }
            EnqueueDecision::Local { cpu, slice_ns } => {
                if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
                    c.local.push_back(pid);
                }
                (slice_ns, None)
            }
            EnqueueDecision::Shared {
                dsq,
                slice_ns,
                deadline,
            } => {
                self.engine.host_mut().push_shared(dsq, deadline, pid);
                (slice_ns, Some(dsq))
            }
        };
        if let Some(t) = self.tasks.get_mut(&pid) {
            t.slice = slice_ns;
        }

        // Idle CPUs serving the queue pick the task up on their own.
        if let Some(dsq) = dsq {
            let idle = (0..self.nr_cpus() as CpuId).find(|&cpu| {
                self.engine.host().is_cpu_idle(cpu)
                    && self.engine.cpu(cpu).is_some_and(|c| c.shared_dsq == dsq)
            });
            if let Some(cpu) = idle {
                self.push(now, EventKind::Resched(cpu));
            }
        }
    }

    fn resched(&mut self, cpu: CpuId) {
        let Some(c) = self.engine.host_mut().cpu_mut(cpu) else {
            return;
        };
        if c.current.is_some() {
            return;
        }
        let next = match c.local.pop_front() {
            Some(pid) => Some(pid),
            None => match self.engine.on_dispatch(cpu, None) {
                DispatchDecision::Consumed => self
                    .engine
                    .host_mut()
                    .cpu_mut(cpu)
                    .and_then(|c| c.local.pop_front()),
                _ => None,
            },
        };
        match next {
            Some(pid) => self.start(cpu, pid),
            None => {
                if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
                    c.reserved = false;
                }
            }
        }
    }

    fn start(&mut self, cpu: CpuId, pid: Pid) {
        let nr_cpus = self.nr_cpus();
        let now = self.now();
        if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
            c.current = Some(pid);
            c.reserved = false;
        }
        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        t.cpu = cpu;
        t.dispatches += 1;
        t.pgfault_total += t.spec.pgfaults_per_run;
        if let Some(woke) = t.woke_at.take() {
            let lat = now.saturating_sub(woke);
            t.latency_sum += lat;
            t.latency_max = t.latency_max.max(lat);
        }
        let view = t.view(nr_cpus);
        self.engine.on_running(&view, cpu);

        t.run_len = t.remaining.min(t.slice.max(1));
        let at = now + t.run_len;
        self.push(at, EventKind::RunEnd { cpu, pid });
    }

    fn run_end(&mut self, cpu: CpuId, pid: Pid) {
        let nr_cpus = self.nr_cpus();
        let now = self.now();
        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        t.remaining = t.remaining.saturating_sub(t.run_len);
        let view = t.view(nr_cpus);

        if t.remaining > 0 {
            let contended = self.engine.host().local_queued(cpu) > 0;
            if !contended {
                if let DispatchDecision::ExtendPrev { slice_ns } =
                    self.engine.on_dispatch(cpu, Some(&view))
                {
                    t.slice = slice_ns;
                    t.run_len = t.remaining.min(slice_ns.max(1));
                    let at = now + t.run_len;
                    self.push(at, EventKind::RunEnd { cpu, pid });
                    return;
                }
            }
            self.engine.on_stopping(&view, cpu, true);
            if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
                c.current = None;
            }
            let d = self.engine.on_enqueue(&view, cpu, EnqFlags::PREEMPTED);
            self.place(pid, d);
        } else {
            self.engine.on_stopping(&view, cpu, false);
            if let Some(c) = self.engine.host_mut().cpu_mut(cpu) {
                c.current = None;
            }
            let exiting = t.spec.exit_ms.is_some_and(|ms| now >= ms * NSEC_PER_MSEC);
            if exiting {
                t.alive = false;
                self.engine.on_task_destroyed(&view);
            } else {
                let (sleep_us, pct) = (t.spec.sleep_us, t.spec.jitter_pct);
                let sleep = self.jitter(sleep_us * NSEC_PER_USEC, pct);
                self.push(now + sleep, EventKind::Wake(pid));
            }
        }
        self.resched(cpu);
    }

    fn fire(&mut self, i: usize) {
        let now = self.now();
        let spec = self.triggers[i].clone();
        match spec.window {
            Window::Input => self.engine.trigger_input_boost(spec.lane),
            Window::Frame => self.engine.trigger_frame_boost(),
            Window::IoPreference => {
                let until = now + self.engine.config().napi_window_ns;
                let host = self.engine.host_mut();
                if let Some(slot) = spec
                    .softirq_cpu
                    .and_then(|c| usize::try_from(c).ok())
                    .and_then(|c| host.softirq_until.get_mut(c))
                {
                    *slot = until;
                }
                self.engine.trigger_io_preference_window();
            }
        }
        let next = now + spec.every_us * NSEC_PER_USEC;
        if spec.stop_ms.map_or(true, |ms| next < ms * NSEC_PER_MSEC) {
            self.push(next, EventKind::Trigger(i));
        }
    }

    fn release(&mut self, cpu: CpuId) {
        let nr_cpus = self.nr_cpus();
        self.engine.on_cpu_release(cpu);
        let pids = std::mem::take(&mut self.engine.host_mut().reenqueued);
        for pid in pids {
            let Some(view) = self.tasks.get(&pid).map(|t| t.view(nr_cpus)) else {
                continue;
            };
            let d = self.engine.on_enqueue(&view, cpu, EnqFlags::REENQ);
            self.place(pid, d);
        }
    }

    fn report(&self) -> Report {
        let mut roles: BTreeMap<String, RoleReport> = BTreeMap::new();
        let mut tasks = Vec::with_capacity(self.tasks.len());
        let mut lat_sums: BTreeMap<String, u64> = BTreeMap::new();

        for t in self.tasks.values() {
            let role = self
                .engine
                .task(t.spec.pid)
                .and_then(|c| c.primary_role())
                .map_or("none", Role::name)
                .to_string();
            let started = t.wakeups.min(t.dispatches).max(1);
            tasks.push(TaskReport {
                pid: t.spec.pid,
                name: t.spec.name.clone(),
                role: role.clone(),
                dispatches: t.dispatches,
                wakeups: t.wakeups,
                mean_latency_ns: t.latency_sum / started,
                max_latency_ns: t.latency_max,
            });

            let r = roles.entry(role.clone()).or_default();
            r.tasks += 1;
            r.dispatches += t.dispatches;
            r.wakeups += t.wakeups;
            r.max_latency_ns = r.max_latency_ns.max(t.latency_max);
            *lat_sums.entry(role).or_default() += t.latency_sum;
        }
        for (role, r) in roles.iter_mut() {
            if r.wakeups > 0 {
                r.mean_latency_ns = lat_sums.get(role).copied().unwrap_or(0) / r.wakeups;
            }
        }

        Report {
            duration_ns: self.end,
            tasks,
            roles,
            metrics: self.engine.snapshot(),
        }
    }
}
