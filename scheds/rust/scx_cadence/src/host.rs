// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The boundary between the engine and the scheduler framework that hosts it.
//!
//! The host owns threads, CPUs and run queues. It hands the engine a
//! [`TaskView`] on every callback and exposes the few primitives the
//! decision paths need through the [`Host`] trait. Decisions flow back as
//! plain values ([`EnqueueDecision`], [`DispatchDecision`]) for the host to
//! apply.

use std::fmt;

use bitflags::bitflags;

pub type Pid = i32;
pub type CpuId = i32;

pub const TASK_COMM_LEN: usize = 16;

/// Fixed-size thread name, NUL padded like the kernel's `comm`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Comm([u8; TASK_COMM_LEN]);

impl Comm {
    /// Build from a string, truncated to 15 bytes.
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; TASK_COMM_LEN];
        let len = name.len().min(TASK_COMM_LEN - 1);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
        &self.0[..len]
    }

    #[inline]
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.as_bytes().starts_with(prefix)
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

bitflags! {
    /// Wakeup flags passed to CPU selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WakeFlags: u32 {
        /// The waker is about to sleep; wakee may take its CPU.
        const SYNC = 1 << 0;
        /// First wakeup after fork.
        const FORK = 1 << 1;
    }
}

bitflags! {
    /// Enqueue flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnqFlags: u64 {
        const WAKEUP = 1 << 0;
        /// CPU selection already ran for this enqueue.
        const CPU_SELECTED = 1 << 1;
        /// Re-enqueued after a higher priority class took the CPU.
        const REENQ = 1 << 2;
        /// The task was running when it got enqueued (slice expiry).
        const PREEMPTED = 1 << 3;
    }
}

/// The host's view of a task, handed to each callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskView {
    pub pid: Pid,
    pub tgid: Pid,
    /// Address space identity, 0 for threads without one.
    pub mm: u64,
    /// Scheduling weight, 100 for the default nice level.
    pub weight: u64,
    pub nr_cpus_allowed: u32,
    pub comm: Comm,
    /// Cumulative minor + major page faults.
    pub pgfault_total: u64,
}

impl TaskView {
    pub fn new(pid: Pid, tgid: Pid, name: &str) -> Self {
        Self {
            pid,
            tgid,
            mm: tgid as u64,
            weight: 100,
            nr_cpus_allowed: u32::MAX,
            comm: Comm::new(name),
            pgfault_total: 0,
        }
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.nr_cpus_allowed == 1
    }
}

/// The task that triggered a wakeup, if it is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Waker {
    pub cpu: CpuId,
    pub mm: u64,
}

/// Placement chosen when a task wakes up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeDecision {
    /// Inserted straight into `cpu`'s local queue; no enqueue follows.
    Dispatch { cpu: CpuId, slice_ns: u64 },
    /// No opinion. The host keeps its own placement and enqueues with
    /// [`EnqFlags::CPU_SELECTED`].
    Default,
}

impl WakeDecision {
    pub fn target(&self) -> Option<CpuId> {
        match *self {
            WakeDecision::Dispatch { cpu, .. } => Some(cpu),
            WakeDecision::Default => None,
        }
    }
}

/// Where an enqueued task goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueDecision {
    /// Insert at the head of an idle CPU's local queue.
    Direct { cpu: CpuId, slice_ns: u64 },
    /// Round-robin on a CPU's local queue; the CPU gets kicked later.
    Local { cpu: CpuId, slice_ns: u64 },
    /// Deadline-ordered shared queue.
    Shared { dsq: u64, slice_ns: u64, deadline: u64 },
}

/// Outcome of a dispatch callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchDecision {
    /// A task was moved from the shared queue to the CPU's local queue.
    Consumed,
    /// Keep running the previous task for another slice.
    ExtendPrev { slice_ns: u64 },
    Idle,
}

/// Primitives the engine needs from the scheduler framework.
///
/// Every method must return promptly: the engine calls them from inside
/// scheduling callbacks.
pub trait Host {
    /// Monotonic clock in nanoseconds.
    fn now(&self) -> u64;

    fn is_cpu_idle(&self, cpu: CpuId) -> bool;

    /// Atomically claim an idle CPU. Returns false if it was not idle.
    fn claim_idle_cpu(&mut self, cpu: CpuId) -> bool;

    fn cpu_allowed(&self, task: &TaskView, cpu: CpuId) -> bool;

    /// Whether the host can search idle CPUs within an arbitrary allowed
    /// mask. Without it the engine relies on [`Host::select_cpu_dfl`].
    fn supports_idle_and(&self) -> bool {
        true
    }

    /// Whether [`Host::select_cpu_dfl`] is usable.
    fn supports_select_cpu_dfl(&self) -> bool {
        true
    }

    /// The host's own legacy placement primitive.
    fn select_cpu_dfl(&mut self, task: &TaskView, prev_cpu: CpuId, flags: WakeFlags)
        -> Option<CpuId>;

    /// Move the head of a shared queue to `cpu`'s local queue.
    fn move_shared_to_local(&mut self, dsq: u64, cpu: CpuId) -> bool;

    fn local_queued(&self, cpu: CpuId) -> u32;

    fn kick_cpu(&mut self, cpu: CpuId);

    /// Re-enqueue everything on `cpu`'s local queue. Returns the count.
    fn reenqueue_local(&mut self, cpu: CpuId) -> u32;

    fn set_cpuperf(&mut self, cpu: CpuId, perf: u32);

    /// Whether `cpu` serviced network softirq work recently.
    fn recent_softirq(&self, _cpu: CpuId) -> bool {
        false
    }

    /// (Re-)arm the housekeeping timer. Returns false on failure.
    fn arm_timer(&mut self, period_ns: u64) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_truncates_and_matches_prefix() {
        let c = Comm::new("vkd3d-swapchain-long-name");
        assert_eq!(c.as_bytes().len(), TASK_COMM_LEN - 1);
        assert!(c.starts_with(b"vkd3"));
        assert!(!c.starts_with(b"dxvk-"));
        assert_eq!(Comm::new("").as_bytes(), b"");
        assert_eq!(format!("{}", Comm::new("kwin_wayland")), "kwin_wayland");
    }
}
