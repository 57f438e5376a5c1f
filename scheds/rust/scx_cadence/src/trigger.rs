// SPDX-License-Identifier: GPL-2.0

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::boost::BoostWindows;
use crate::boost::InputLane;
use crate::boost::Window;
use crate::boost::CMD_FRAME;
use crate::boost::CMD_INPUT;
use crate::boost::CMD_NAPI;
use crate::classify::RoleHint;

pub const HINT_QUEUE_LEN: usize = 1024;

pub trait TriggerOps {
    fn trigger_input_lane(&self, windows: &BoostWindows, lane: InputLane, now: u64);
    fn trigger_input_with_napi_lane(&self, windows: &BoostWindows, lane: InputLane, now: u64);
    fn trigger_frame(&self, windows: &BoostWindows, now: u64);
    fn trigger_io_preference(&self, windows: &BoostWindows, now: u64);
}

/// Applies triggers to the windows immediately.
#[derive(Default)]
pub struct WindowTrigger;

impl TriggerOps for WindowTrigger {
    #[inline(always)]
    fn trigger_input_lane(&self, windows: &BoostWindows, lane: InputLane, now: u64) {
        windows.trigger_lane(lane, now);
    }

    #[inline(always)]
    fn trigger_input_with_napi_lane(&self, windows: &BoostWindows, lane: InputLane, now: u64) {
        windows.trigger_lane(lane, now);
        windows.trigger(Window::IoPreference, now);
    }

    #[inline(always)]
    fn trigger_frame(&self, windows: &BoostWindows, now: u64) {
        windows.trigger(Window::Frame, now);
    }

    #[inline(always)]
    fn trigger_io_preference(&self, windows: &BoostWindows, now: u64) {
        windows.trigger(Window::IoPreference, now);
    }
}

/// Bounded lock-free queue of classification hints, drained by the timer.
#[derive(Debug)]
pub struct HintQueue {
    q: ArrayQueue<RoleHint>,
    dropped: AtomicU64,
}

impl Default for HintQueue {
    fn default() -> Self {
        Self::new(HINT_QUEUE_LEN)
    }
}

impl HintQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            q: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a hint. A full queue drops it and counts the drop.
    pub fn post(&self, hint: RoleHint) -> bool {
        match self.q.push(hint) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<RoleHint> {
        self.q.pop()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fire-and-forget trigger surface for event sources on other threads.
///
/// Window triggers are posted as command bits and applied by the next
/// housekeeping tick, so callers don't need the engine's clock.
#[derive(Clone, Debug)]
pub struct TriggerHandle {
    windows: Arc<BoostWindows>,
    hints: Arc<HintQueue>,
}

impl TriggerHandle {
    pub fn new(windows: Arc<BoostWindows>, hints: Arc<HintQueue>) -> Self {
        Self { windows, hints }
    }

    pub fn input(&self) {
        self.windows.post(CMD_INPUT);
    }

    pub fn frame(&self) {
        self.windows.post(CMD_FRAME);
    }

    pub fn io_preference(&self) {
        self.windows.post(CMD_NAPI);
    }

    pub fn hint(&self, hint: RoleHint) -> bool {
        self.hints.post(hint)
    }

    /// Stage a new foreground process; adopted at the next tick.
    pub fn set_foreground(&self, tgid: u32) {
        self.windows.stage_foreground(tgid);
    }
}

#[cfg(test)]
pub struct MockTrigger {
    pub input_count: AtomicU64,
    pub frame_count: AtomicU64,
}

#[cfg(test)]
impl Default for MockTrigger {
    fn default() -> Self {
        Self {
            input_count: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
impl TriggerOps for MockTrigger {
    fn trigger_input_lane(&self, _windows: &BoostWindows, _lane: InputLane, _now: u64) {
        self.input_count.fetch_add(1, Ordering::Relaxed);
    }
    fn trigger_input_with_napi_lane(&self, _windows: &BoostWindows, _lane: InputLane, _now: u64) {
        self.input_count.fetch_add(1, Ordering::Relaxed);
    }
    fn trigger_frame(&self, _windows: &BoostWindows, _now: u64) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
    }
    fn trigger_io_preference(&self, _windows: &BoostWindows, _now: u64) {}
}
