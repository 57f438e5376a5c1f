// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Idle CPU selection.
//!
//! Candidate scans walk fixed-size arrays bounded by [`MAX_CPUS`]. The
//! preferred order puts the first sibling of every SMT core ahead of the
//! hyperthreads, so tasks that need a dedicated core find one first.

use std::collections::HashMap;

use ahash::RandomState;
use log::info;

use crate::boost::WindowView;
use crate::config::EngineConfig;
use crate::config::INTERACTIVE_SMT_ALLOW_THRESH;
use crate::config::MAX_CPUS;
use crate::cpu::CpuCounters;
use crate::error::EngineError;
use crate::host::CpuId;
use crate::host::Host;
use crate::host::TaskView;
use crate::host::WakeFlags;
use crate::host::Waker;
use crate::task::PlacementCache;

/// CPU layout the selector plans against.
#[derive(Clone, Debug)]
pub struct Topology {
    nr_cpus: usize,
    sibling: [CpuId; MAX_CPUS],
    node: [u32; MAX_CPUS],
    /// Physical cores first, then hyperthreads, each by id. `-1` terminated.
    preferred: [CpuId; MAX_CPUS],
    smt: bool,
    nr_nodes: u32,
}

impl Topology {
    /// `nr_cpus` CPUs without SMT on a single node.
    pub fn flat(nr_cpus: usize) -> Result<Self, EngineError> {
        Self::new(nr_cpus, &[], &[])
    }

    /// `smt_pairs` lists sibling pairs; `nodes[cpu]` is the NUMA node of each
    /// CPU (missing entries default to node 0).
    pub fn new(
        nr_cpus: usize,
        smt_pairs: &[(CpuId, CpuId)],
        nodes: &[u32],
    ) -> Result<Self, EngineError> {
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(EngineError::InvalidTopology(format!(
                "{} CPUs, supported range is 1..={}",
                nr_cpus, MAX_CPUS
            )));
        }

        let mut topo = Topology {
            nr_cpus,
            sibling: [-1; MAX_CPUS],
            node: [0; MAX_CPUS],
            preferred: [-1; MAX_CPUS],
            smt: !smt_pairs.is_empty(),
            nr_nodes: 1,
        };

        let valid = |c: CpuId| c >= 0 && (c as usize) < nr_cpus;
        for &(a, b) in smt_pairs {
            if !valid(a) || !valid(b) || a == b {
                return Err(EngineError::InvalidTopology(format!(
                    "bad SMT pair ({}, {})",
                    a, b
                )));
            }
            if topo.sibling[a as usize] >= 0 || topo.sibling[b as usize] >= 0 {
                return Err(EngineError::InvalidTopology(format!(
                    "CPU listed in more than one SMT pair ({}, {})",
                    a, b
                )));
            }
            topo.sibling[a as usize] = b;
            topo.sibling[b as usize] = a;
        }

        for (cpu, &node) in nodes.iter().enumerate().take(nr_cpus) {
            topo.node[cpu] = node;
            topo.nr_nodes = topo.nr_nodes.max(node + 1);
        }

        let mut order: Vec<CpuId> = (0..nr_cpus as CpuId).collect();
        order.sort_unstable_by_key(|&c| (!topo.is_physical(c), c));
        topo.preferred[..nr_cpus].copy_from_slice(&order);

        info!(
            "topology: {} CPUs, {} nodes, SMT {}",
            nr_cpus,
            topo.nr_nodes,
            if topo.smt { "on" } else { "off" }
        );
        Ok(topo)
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn nr_nodes(&self) -> u32 {
        self.nr_nodes
    }

    pub fn smt_enabled(&self) -> bool {
        self.smt
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu >= 0 && (cpu as usize) < self.nr_cpus
    }

    pub fn sibling(&self, cpu: CpuId) -> Option<CpuId> {
        if !self.contains(cpu) {
            return None;
        }
        let s = self.sibling[cpu as usize];
        (s >= 0).then_some(s)
    }

    /// First sibling of its core, or a CPU without SMT.
    pub fn is_physical(&self, cpu: CpuId) -> bool {
        self.contains(cpu) && self.sibling(cpu).map_or(true, |s| cpu < s)
    }

    pub fn node(&self, cpu: CpuId) -> u32 {
        if self.contains(cpu) {
            self.node[cpu as usize]
        } else {
            0
        }
    }

    pub fn preferred(&self) -> &[CpuId] {
        &self.preferred[..self.nr_cpus]
    }
}

/// Approximate LRU of the last CPU used by each address space.
///
/// Two generations of fixed capacity: lookups promote from the old
/// generation, and once the young one fills up the old one is dropped.
/// Both maps are allocated up front and only ever cleared.
#[derive(Debug)]
pub struct MmHintCache {
    young: HashMap<u64, CpuId, RandomState>,
    old: HashMap<u64, CpuId, RandomState>,
    gen_cap: usize,
}

impl MmHintCache {
    pub fn new(capacity: usize) -> Self {
        let gen_cap = (capacity / 2).max(1);
        Self {
            young: HashMap::with_capacity_and_hasher(gen_cap, RandomState::new()),
            old: HashMap::with_capacity_and_hasher(gen_cap, RandomState::new()),
            gen_cap,
        }
    }

    pub fn get(&mut self, mm: u64) -> Option<CpuId> {
        if let Some(&cpu) = self.young.get(&mm) {
            return Some(cpu);
        }
        let cpu = self.old.remove(&mm)?;
        self.insert(mm, cpu);
        Some(cpu)
    }

    pub fn insert(&mut self, mm: u64, cpu: CpuId) {
        if !self.young.contains_key(&mm) && self.young.len() >= self.gen_cap {
            std::mem::swap(&mut self.young, &mut self.old);
            self.young.clear();
        }
        self.young.insert(mm, cpu);
    }

    pub fn len(&self) -> usize {
        self.young.len() + self.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-call facts the selector needs beyond the task view.
#[derive(Clone, Copy, Debug)]
pub struct SelectCtx<'a> {
    pub task: &'a TaskView,
    pub prev_cpu: CpuId,
    pub flags: WakeFlags,
    pub from_enqueue: bool,
    /// The task holds a role that wants a core of its own.
    pub dedicated: bool,
    pub foreground: bool,
    pub win: WindowView,
    pub busy: bool,
    /// System-wide foreground wake frequency EMA.
    pub interactive_avg: u64,
    pub now: u64,
}

/// Which rule produced a selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectPath {
    PrevPhysical,
    PlacementCache,
    Preferred,
    IoPreference,
    MmHint,
    Idle,
    Legacy,
}

pub struct Selector {
    topo: Topology,
    avoid_smt: bool,
    numa: bool,
    mm_affinity: bool,
    prefer_napi_on_input: bool,
    mm_hint: Option<MmHintCache>,
}

impl Selector {
    pub fn new(topo: Topology, cfg: &EngineConfig) -> Self {
        Self {
            avoid_smt: cfg.avoid_smt && topo.smt_enabled(),
            numa: cfg.enable_numa && topo.nr_nodes() > 1,
            mm_affinity: cfg.mm_affinity,
            prefer_napi_on_input: cfg.prefer_napi_on_input,
            mm_hint: (!cfg.disable_mm_hint).then(|| MmHintCache::new(cfg.mm_hint_size as usize)),
            topo,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Every sibling of `cpu`'s core is busy.
    pub fn smt_contended<H: Host>(&self, host: &H, cpu: CpuId) -> bool {
        if !self.avoid_smt {
            return false;
        }
        match self.topo.sibling(cpu) {
            Some(s) => !host.is_cpu_idle(cpu) && !host.is_cpu_idle(s),
            None => false,
        }
    }

    fn core_idle<H: Host>(&self, host: &H, cpu: CpuId) -> bool {
        host.is_cpu_idle(cpu) && self.topo.sibling(cpu).map_or(true, |s| host.is_cpu_idle(s))
    }

    fn try_claim<H: Host>(&self, host: &mut H, task: &TaskView, cpu: CpuId) -> bool {
        self.topo.contains(cpu) && host.cpu_allowed(task, cpu) && host.claim_idle_cpu(cpu)
    }

    /// Keep a same-address-space wakee on the waker's CPU when that is also
    /// where the wakee last ran.
    pub fn wake_affine<H: Host>(
        &self,
        host: &mut H,
        ctx: &SelectCtx<'_>,
        waker: Option<Waker>,
    ) -> Option<CpuId> {
        let waker = waker?;
        if !self.mm_affinity || ctx.busy || ctx.dedicated {
            return None;
        }
        if ctx.task.mm == 0 || waker.mm != ctx.task.mm || waker.cpu != ctx.prev_cpu {
            return None;
        }
        self.try_claim(host, ctx.task, waker.cpu).then_some(waker.cpu)
    }

    /// Find and claim an idle CPU for the task, or `None`.
    pub fn pick_idle_cpu<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &SelectCtx<'_>,
        placement: &mut PlacementCache,
        counters: &mut CpuCounters,
    ) -> Option<CpuId> {
        let (cpu, path) = self.pick(host, ctx, placement)?;
        counters.idle_pick += 1;
        match path {
            SelectPath::PrevPhysical | SelectPath::Preferred => counters.gpu_phys_kept += 1,
            SelectPath::PlacementCache => counters.placement_hit += 1,
            SelectPath::IoPreference => counters.napi_prefer += 1,
            SelectPath::MmHint => counters.mm_hint_hit += 1,
            SelectPath::Legacy => counters.dfl_fallback += 1,
            SelectPath::Idle => {}
        }
        Some(cpu)
    }

    fn pick<H: Host>(
        &mut self,
        host: &mut H,
        ctx: &SelectCtx<'_>,
        placement: &mut PlacementCache,
    ) -> Option<(CpuId, SelectPath)> {
        let task = ctx.task;
        let prev = ctx.prev_cpu;

        if ctx.dedicated {
            if self.topo.is_physical(prev) && self.try_claim(host, task, prev) {
                return Some((prev, SelectPath::PrevPhysical));
            }

            if let Some(cpu) = placement.get(ctx.now) {
                if self.try_claim(host, task, cpu) {
                    placement.hit(ctx.now);
                    return Some((cpu, SelectPath::PlacementCache));
                }
            }

            for i in 0..self.topo.nr_cpus().min(MAX_CPUS) {
                let cpu = self.topo.preferred[i];
                if self.try_claim(host, task, cpu) {
                    placement.fill(cpu, ctx.now);
                    return Some((cpu, SelectPath::Preferred));
                }
            }
        }

        let io_window = ctx.win.io_active || (self.prefer_napi_on_input && ctx.win.input_active);
        if io_window && ctx.foreground && host.recent_softirq(prev) && self.try_claim(host, task, prev)
        {
            return Some((prev, SelectPath::IoPreference));
        }

        if ctx.foreground && task.mm != 0 {
            if let Some(cpu) = self.mm_hint.as_mut().and_then(|h| h.get(task.mm)) {
                if self.try_claim(host, task, cpu) {
                    return Some((cpu, SelectPath::MmHint));
                }
            }
        }

        if !host.supports_idle_and() {
            if ctx.from_enqueue {
                return None;
            }
            return host
                .select_cpu_dfl(task, prev, ctx.flags)
                .map(|cpu| (cpu, SelectPath::Legacy));
        }

        let allow_smt = !ctx.dedicated
            && (!self.avoid_smt || (!ctx.busy && ctx.interactive_avg < INTERACTIVE_SMT_ALLOW_THRESH));
        self.scan_idle(host, ctx, allow_smt)
            .map(|cpu| (cpu, SelectPath::Idle))
    }

    /// Generic search: previous CPU first, then the preferred order,
    /// restricted to the previous CPU's node with NUMA enabled.
    fn scan_idle<H: Host>(&self, host: &mut H, ctx: &SelectCtx<'_>, allow_smt: bool) -> Option<CpuId> {
        let node = self.topo.node(ctx.prev_cpu);
        let eligible = |host: &H, cpu: CpuId| {
            (!self.numa || self.topo.node(cpu) == node)
                && host.cpu_allowed(ctx.task, cpu)
                && if allow_smt {
                    host.is_cpu_idle(cpu)
                } else {
                    self.core_idle(host, cpu)
                }
        };

        if self.topo.contains(ctx.prev_cpu)
            && eligible(host, ctx.prev_cpu)
            && host.claim_idle_cpu(ctx.prev_cpu)
        {
            return Some(ctx.prev_cpu);
        }
        for i in 0..self.topo.nr_cpus().min(MAX_CPUS) {
            let cpu = self.topo.preferred[i];
            if cpu != ctx.prev_cpu && eligible(host, cpu) && host.claim_idle_cpu(cpu) {
                return Some(cpu);
            }
        }
        None
    }

    /// Remember the CPU an address space last ran on.
    pub fn note_mm_cpu(&mut self, mm: u64, cpu: CpuId) {
        if mm == 0 || !self.topo.contains(cpu) {
            return;
        }
        if let Some(h) = self.mm_hint.as_mut() {
            h.insert(mm, cpu);
        }
    }

    pub fn mm_hint_enabled(&self) -> bool {
        self.mm_hint.is_some()
    }
}
