// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Boost windows.
//!
//! A window is a single "until" timestamp; it is active while `now < until`.
//! Triggers only ever push the timestamp forward (`fetch_max`), and the
//! housekeeping timer only clears timestamps that already lie in the past,
//! so an active window is never shortened.
//!
//! Everything here is shared between the engine and external trigger
//! sources running on other threads, hence atomics throughout.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::config::CONTINUOUS_ENTER_RATE;
use crate::config::CONTINUOUS_EXIT_RATE;
use crate::config::CONTINUOUS_IDLE_NS;
use crate::config::NSEC_PER_SEC;
use crate::host::Pid;
use crate::vtime::calc_avg;

pub const CMD_INPUT: u32 = 1 << 0;
pub const CMD_FRAME: u32 = 1 << 1;
pub const CMD_NAPI: u32 = 1 << 2;

/// Triggers needed inside one burst before continuous mode can engage.
const CONTINUOUS_MIN_BURST: u32 = 8;
const TRIGGER_RATE_MAX: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Input,
    Frame,
    /// Prefer CPUs that recently serviced network softirqs.
    IoPreference,
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLane {
    Keyboard = 0,
    Mouse = 1,
    Controller = 2,
    Other = 3,
}

pub const NR_LANES: usize = 4;

impl InputLane {
    pub const ALL: [InputLane; NR_LANES] = [
        InputLane::Keyboard,
        InputLane::Mouse,
        InputLane::Controller,
        InputLane::Other,
    ];
}

/// Window state sampled once per callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowView {
    pub input_active: bool,
    pub frame_active: bool,
    pub io_active: bool,
    pub continuous_input: bool,
}

/// Trigger rate EMA (events per second) with continuous-mode hysteresis.
#[derive(Debug, Default)]
pub struct RateTracker {
    last_ns: AtomicU64,
    rate: AtomicU64,
    burst: AtomicU32,
    continuous: AtomicBool,
}

impl RateTracker {
    pub fn record(&self, now: u64) {
        let last = self.last_ns.swap(now, Ordering::Relaxed);
        if last == 0 || now <= last {
            return;
        }
        let gap = now - last;
        if gap >= CONTINUOUS_IDLE_NS {
            self.burst.store(1, Ordering::Relaxed);
        } else {
            self.burst.fetch_add(1, Ordering::Relaxed);
        }

        let inst = (NSEC_PER_SEC / gap).min(TRIGGER_RATE_MAX);
        let rate = calc_avg(self.rate.load(Ordering::Relaxed), inst);
        self.rate.store(rate, Ordering::Relaxed);

        let continuous = self.continuous.load(Ordering::Relaxed);
        if !continuous
            && rate >= CONTINUOUS_ENTER_RATE
            && self.burst.load(Ordering::Relaxed) >= CONTINUOUS_MIN_BURST
        {
            self.continuous.store(true, Ordering::Relaxed);
        } else if continuous && rate < CONTINUOUS_EXIT_RATE {
            self.continuous.store(false, Ordering::Relaxed);
        }
    }

    /// Fold in the silence since the last trigger once it gets long.
    pub fn decay(&self, now: u64) {
        let last = self.last_ns.load(Ordering::Relaxed);
        if last == 0 || now <= last || now - last < CONTINUOUS_IDLE_NS {
            return;
        }
        let inst = NSEC_PER_SEC / (now - last);
        let rate = calc_avg(self.rate.load(Ordering::Relaxed), inst);
        self.rate.store(rate, Ordering::Relaxed);
        self.burst.store(0, Ordering::Relaxed);
        self.continuous.store(false, Ordering::Relaxed);
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn continuous(&self) -> bool {
        self.continuous.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct BoostWindows {
    input_until: AtomicU64,
    frame_until: AtomicU64,
    io_until: AtomicU64,
    lane_until: [AtomicU64; NR_LANES],
    lane_rate: [RateTracker; NR_LANES],
    input_rate: RateTracker,

    input_ns: u64,
    frame_ns: u64,
    io_ns: u64,
    lane_ns: [u64; NR_LANES],

    cmd_flags: AtomicU32,
    last_trigger_ns: AtomicU64,

    fg_staging: AtomicU32,
    fg_active: AtomicU32,

    pub input_trig: AtomicU64,
    pub frame_trig: AtomicU64,
    pub io_trig: AtomicU64,
}

fn extend(slot: &AtomicU64, until: u64) {
    slot.fetch_max(until, Ordering::Relaxed);
}

fn expire(slot: &AtomicU64, now: u64) {
    let until = slot.load(Ordering::Relaxed);
    if until != 0 && until <= now {
        // Loses to a concurrent extension, which is what we want.
        let _ = slot.compare_exchange(until, 0, Ordering::Relaxed, Ordering::Relaxed);
    }
}

impl BoostWindows {
    pub fn new(cfg: &EngineConfig) -> Self {
        let windows = Self {
            input_ns: cfg.input_window_ns,
            frame_ns: cfg.frame_window_ns,
            io_ns: cfg.napi_window_ns,
            lane_ns: [
                cfg.keyboard_boost_ns,
                cfg.mouse_boost_ns,
                cfg.controller_boost_ns,
                0,
            ],
            ..Default::default()
        };
        windows.fg_staging.store(cfg.foreground_tgid, Ordering::Relaxed);
        windows.fg_active.store(cfg.foreground_tgid, Ordering::Relaxed);
        windows
    }

    fn slot(&self, w: Window) -> (&AtomicU64, u64) {
        match w {
            Window::Input => (&self.input_until, self.input_ns),
            Window::Frame => (&self.frame_until, self.frame_ns),
            Window::IoPreference => (&self.io_until, self.io_ns),
        }
    }

    /// Open or extend window `w` to `now + duration`.
    pub fn trigger(&self, w: Window, now: u64) {
        let (slot, dur) = self.slot(w);
        match w {
            Window::Input => {
                self.input_rate.record(now);
                self.input_trig.fetch_add(1, Ordering::Relaxed);
            }
            Window::Frame => {
                self.frame_trig.fetch_add(1, Ordering::Relaxed);
            }
            Window::IoPreference => {
                self.io_trig.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.last_trigger_ns.store(now, Ordering::Relaxed);
        if dur != 0 {
            extend(slot, now.saturating_add(dur));
        }
    }

    /// Input event from a specific device class. Lanes with a zero duration
    /// only feed the rate tracker.
    pub fn trigger_lane(&self, lane: InputLane, now: u64) {
        let idx = lane as usize;
        self.lane_rate[idx].record(now);
        self.input_trig.fetch_add(1, Ordering::Relaxed);
        self.last_trigger_ns.store(now, Ordering::Relaxed);

        let dur = self.lane_ns[idx];
        if dur == 0 {
            return;
        }
        let until = now.saturating_add(dur);
        extend(&self.lane_until[idx], until);
        extend(&self.input_until, until);
    }

    pub fn until(&self, w: Window) -> u64 {
        self.slot(w).0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_active(&self, w: Window, now: u64) -> bool {
        now < self.until(w)
    }

    pub fn lane_active(&self, lane: InputLane, now: u64) -> bool {
        now < self.lane_until[lane as usize].load(Ordering::Relaxed)
    }

    pub fn continuous_input(&self) -> bool {
        self.input_rate.continuous() || self.lane_rate.iter().any(RateTracker::continuous)
    }

    pub fn input_rate(&self) -> u64 {
        self.lane_rate
            .iter()
            .map(RateTracker::rate)
            .fold(self.input_rate.rate(), u64::max)
    }

    pub fn view(&self, now: u64) -> WindowView {
        WindowView {
            input_active: self.is_active(Window::Input, now),
            frame_active: self.is_active(Window::Frame, now),
            io_active: self.is_active(Window::IoPreference, now),
            continuous_input: self.continuous_input(),
        }
    }

    pub fn last_trigger_ns(&self) -> u64 {
        self.last_trigger_ns.load(Ordering::Relaxed)
    }

    /// Queue a trigger from a context without a clock; applied by `tick()`.
    pub fn post(&self, cmd: u32) {
        self.cmd_flags.fetch_or(cmd, Ordering::Relaxed);
    }

    /// Apply and clear posted commands. Returns the drained bits.
    pub fn drain_commands(&self, now: u64) -> u32 {
        let flags = self.cmd_flags.swap(0, Ordering::Relaxed);
        if flags & CMD_INPUT != 0 {
            self.trigger(Window::Input, now);
        }
        if flags & CMD_FRAME != 0 {
            self.trigger(Window::Frame, now);
        }
        if flags & CMD_NAPI != 0 {
            self.trigger(Window::IoPreference, now);
        }
        flags
    }

    /// Clear windows and continuous flags that have run out.
    pub fn expire(&self, now: u64) {
        expire(&self.input_until, now);
        expire(&self.frame_until, now);
        expire(&self.io_until, now);
        for (until, rate) in self.lane_until.iter().zip(&self.lane_rate) {
            expire(until, now);
            rate.decay(now);
        }
        self.input_rate.decay(now);
    }

    /// Publish a new foreground tgid; adopted at the next `tick()`.
    pub fn stage_foreground(&self, tgid: u32) {
        self.fg_staging.store(tgid, Ordering::Release);
    }

    /// Copy the staged foreground tgid to the active slot. Returns the old
    /// and new values if it changed.
    pub fn adopt_foreground(&self) -> Option<(u32, u32)> {
        let staged = self.fg_staging.load(Ordering::Acquire);
        let active = self.fg_active.load(Ordering::Relaxed);
        if staged == active {
            return None;
        }
        self.fg_active.store(staged, Ordering::Release);
        Some((active, staged))
    }

    #[inline]
    pub fn foreground(&self) -> u32 {
        self.fg_active.load(Ordering::Acquire)
    }

    /// With no foreground designated, every task counts as foreground.
    #[inline]
    pub fn is_foreground(&self, tgid: Pid) -> bool {
        let fg = self.foreground();
        fg == 0 || fg as Pid == tgid
    }
}
