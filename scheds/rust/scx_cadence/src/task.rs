// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::classify::priority_shift;
use crate::classify::primary_role;
use crate::classify::BehaviorTracker;
use crate::classify::Classification;
use crate::classify::Role;
use crate::classify::RoleFlags;
use crate::classify::Source;
use crate::config::EngineConfig;
use crate::config::PLACEMENT_CACHE_MAX_AGE_NS;
use crate::host::CpuId;
use crate::host::Pid;
use crate::host::TaskView;
use crate::migration::TokenBucket;

/// Last CPU a dedicated-placement task ran well on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlacementCache {
    pub cpu: CpuId,
    pub hits: u32,
    pub last_hit: u64,
}

impl Default for PlacementCache {
    fn default() -> Self {
        Self {
            cpu: -1,
            hits: 0,
            last_hit: 0,
        }
    }
}

impl PlacementCache {
    /// Cached CPU, dropping the entry once it has gone stale.
    pub fn get(&mut self, now: u64) -> Option<CpuId> {
        if self.cpu < 0 {
            return None;
        }
        if now.saturating_sub(self.last_hit) > PLACEMENT_CACHE_MAX_AGE_NS {
            self.invalidate();
            return None;
        }
        Some(self.cpu)
    }

    pub fn hit(&mut self, now: u64) {
        self.hits = self.hits.saturating_add(1);
        self.last_hit = now;
    }

    pub fn fill(&mut self, cpu: CpuId, now: u64) {
        self.cpu = cpu;
        self.hits = 0;
        self.last_hit = now;
    }

    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// Per-thread scheduling state owned by the engine.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub pid: Pid,
    pub tgid: Pid,

    /// Engine generation the classification below belongs to.
    pub generation: u32,
    pub roles: RoleFlags,
    pub priority_shift: u8,
    pub source: Option<Source>,
    pub confidence: u8,
    /// Role counter epoch `roles` were counted under.
    pub counted_epoch: u32,
    pub pending_hint: Option<Classification>,
    pub behavior: BehaviorTracker,
    pub wakes: u32,
    pub foreground: bool,

    /// Runtime since the last sleep.
    pub exec_runtime: u64,
    pub last_run_at: u64,
    /// EMA of wakeups per 100ms.
    pub wakeup_freq: u64,
    pub last_woke_at: u64,
    /// Interval that ended at the last wakeup.
    pub wake_interval: u64,
    pub exec_avg: u64,
    pub vtime: u64,
    pub chain_boost: u32,

    pub bucket: TokenBucket,
    pub placement: PlacementCache,
    pub mm_hint_last_update: u64,

    pub last_pgfault_total: u64,
    /// EMA of page faults per wake cycle.
    pub pgfault_rate: u64,

    pub last_cpu: CpuId,
}

impl TaskContext {
    pub fn new(task: &TaskView, cfg: &EngineConfig, vtime: u64) -> Self {
        Self {
            pid: task.pid,
            tgid: task.tgid,
            // Never equal to a live generation, forces classification.
            generation: u32::MAX,
            roles: RoleFlags::empty(),
            priority_shift: 0,
            source: None,
            confidence: 0,
            counted_epoch: 0,
            pending_hint: None,
            behavior: BehaviorTracker::new(cfg.behavior_stable_samples),
            wakes: 0,
            foreground: false,
            exec_runtime: 0,
            last_run_at: 0,
            wakeup_freq: 0,
            last_woke_at: 0,
            wake_interval: 0,
            exec_avg: 0,
            vtime,
            chain_boost: 0,
            bucket: TokenBucket::full(cfg.max_mig_tokens()),
            placement: PlacementCache::default(),
            mm_hint_last_update: 0,
            last_pgfault_total: task.pgfault_total,
            pgfault_rate: 0,
            last_cpu: -1,
        }
    }

    /// State from another engine generation can't be trusted.
    #[inline]
    pub fn needs_classification(&self, generation: u32) -> bool {
        self.generation != generation
    }

    #[inline]
    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(role.flag())
    }

    pub fn primary_role(&self) -> Option<Role> {
        primary_role(self.roles)
    }

    /// Replace the task's role, clearing conflicting bits.
    ///
    /// Returns the bits that were cleared and the bits that were set so the
    /// caller can keep live counters exact.
    pub fn set_role(&mut self, class: Option<Classification>) -> (RoleFlags, RoleFlags) {
        let new = class.map_or(RoleFlags::empty(), |c| c.role.flag());
        let removed = self.roles - new;
        let added = new - self.roles;

        self.roles = new;
        self.priority_shift = priority_shift(new);
        self.source = class.map(|c| c.source);
        self.confidence = class.map_or(0, |c| c.confidence);
        if !self.has(Role::GpuSubmit) {
            self.placement.invalidate();
        }
        (removed, added)
    }

    /// Drop the classification without reporting transitions.
    pub fn forget_roles(&mut self) {
        self.roles = RoleFlags::empty();
        self.priority_shift = 0;
        self.source = None;
        self.confidence = 0;
        self.placement.invalidate();
    }
}
