// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task classification.
//!
//! A thread's role comes from one of three strategies, composed in a fixed
//! order by [`ClassifierChain`]:
//!
//! 1. [`NameClassifier`]: prefix match of the thread name against a static
//!    table, evaluated once per generation. Highest confidence.
//! 2. [`HintClassifier`]: a role posted by an external detector through the
//!    hint channel, with the detector's own confidence.
//! 3. [`BehaviorClassifier`]: wake rate and burst length observed by a
//!    per-task [`BehaviorTracker`], committed only after a stable run of
//!    matching samples and revoked only outside a wider band.
//!
//! Roles other than the globally scoped ones only apply to threads of the
//! designated foreground process.

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use crate::config::CLASSIFY_COMMIT_CONFIDENCE;
use crate::config::NSEC_PER_MSEC;
use crate::config::NSEC_PER_SEC;
use crate::config::NSEC_PER_USEC;
use crate::host::Comm;
use crate::vtime::calc_avg;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct RoleFlags: u16 {
        const INPUT = 1 << 0;
        const GPU_SUBMIT = 1 << 1;
        const GAMING_NETWORK = 1 << 2;
        const INTERRUPT = 1 << 3;
        const NETWORK = 1 << 4;
        const COMPOSITOR = 1 << 5;
        const SYSTEM_AUDIO = 1 << 6;
        const GAME_AUDIO = 1 << 7;
        const STORAGE = 1 << 8;
        const BACKGROUND = 1 << 9;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Input,
    GpuSubmit,
    GamingNetwork,
    Interrupt,
    Network,
    Compositor,
    SystemAudio,
    GameAudio,
    Storage,
    Background,
}

pub const NR_ROLES: usize = 10;

/// All roles, highest precedence first.
pub const ROLES: [Role; NR_ROLES] = [
    Role::Input,
    Role::GpuSubmit,
    Role::GamingNetwork,
    Role::Interrupt,
    Role::Network,
    Role::Compositor,
    Role::SystemAudio,
    Role::GameAudio,
    Role::Storage,
    Role::Background,
];

impl Role {
    #[inline]
    pub const fn idx(self) -> usize {
        self as usize
    }

    pub const fn flag(self) -> RoleFlags {
        match self {
            Role::Input => RoleFlags::INPUT,
            Role::GpuSubmit => RoleFlags::GPU_SUBMIT,
            Role::GamingNetwork => RoleFlags::GAMING_NETWORK,
            Role::Interrupt => RoleFlags::INTERRUPT,
            Role::Network => RoleFlags::NETWORK,
            Role::Compositor => RoleFlags::COMPOSITOR,
            Role::SystemAudio => RoleFlags::SYSTEM_AUDIO,
            Role::GameAudio => RoleFlags::GAME_AUDIO,
            Role::Storage => RoleFlags::STORAGE,
            Role::Background => RoleFlags::BACKGROUND,
        }
    }

    /// Deadline boost shift (0-7). Also the ordering weight exported to stats.
    pub const fn priority_shift(self) -> u8 {
        match self {
            Role::Input => 7,
            Role::GpuSubmit => 6,
            Role::GamingNetwork => 5,
            Role::Interrupt => 4,
            Role::Network | Role::Compositor => 3,
            Role::SystemAudio => 2,
            Role::GameAudio | Role::Storage => 1,
            Role::Background => 0,
        }
    }

    /// Roles that are not restricted to the foreground process.
    pub const fn is_global(self) -> bool {
        matches!(
            self,
            Role::Compositor | Role::SystemAudio | Role::Interrupt | Role::Storage
        )
    }

    /// Roles whose deadline boost only applies while an input window is open.
    pub const fn window_gated(self) -> bool {
        matches!(self, Role::Input | Role::GamingNetwork | Role::Network)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::GpuSubmit => "gpu",
            Role::GamingNetwork => "game_net",
            Role::Interrupt => "irq",
            Role::Network => "net",
            Role::Compositor => "comp",
            Role::SystemAudio => "sys_aud",
            Role::GameAudio => "gm_aud",
            Role::Storage => "storage",
            Role::Background => "bg",
        }
    }
}

/// The highest-precedence role present in `flags`.
pub fn primary_role(flags: RoleFlags) -> Option<Role> {
    ROLES.into_iter().find(|r| flags.contains(r.flag()))
}

/// Boost shift derived from the highest-precedence role in `flags`.
pub fn priority_shift(flags: RoleFlags) -> u8 {
    primary_role(flags).map_or(0, Role::priority_shift)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Behavior,
    Hint,
    Name,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub role: Role,
    pub confidence: u8,
    pub source: Source,
}

impl Classification {
    pub fn committed(&self) -> bool {
        self.confidence >= CLASSIFY_COMMIT_CONFIDENCE
    }
}

/// Whether a task is inside the scope that fg-restricted roles apply to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    pub foreground: bool,
    /// pid == tgid == designated foreground tgid.
    pub fg_main: bool,
}

impl Scope {
    pub fn admits(&self, role: Role) -> bool {
        role.is_global() || self.foreground
    }
}

pub struct ClassifyInput<'a> {
    pub comm: &'a Comm,
    pub scope: Scope,
    pub hint: Option<Classification>,
    pub behavior: &'a BehaviorTracker,
}

pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;
    fn classify(&self, input: &ClassifyInput<'_>) -> Option<Classification>;
}

/// Thread name prefixes, highest precedence first.
static NAME_RULES: &[(&[u8], Role)] = &[
    // Input handling and game main loops.
    (b"GameThr", Role::Input),
    (b"SDL", Role::Input),
    (b"inpu", Role::Input),
    (b"even", Role::Input),
    (b"glfw", Role::Input),
    (b"QtIn", Role::Input),
    // Render and GPU command submission.
    (b"dxvk-", Role::GpuSubmit),
    (b"RenderT", Role::GpuSubmit),
    (b"RHI", Role::GpuSubmit),
    (b"vkd3", Role::GpuSubmit),
    (b"[vk", Role::GpuSubmit),
    (b"UnityGfx", Role::GpuSubmit),
    (b"render", Role::GpuSubmit),
    (b"gpu", Role::GpuSubmit),
    (b"radv", Role::GpuSubmit),
    // Game netcode.
    (b"WebSock", Role::GamingNetwork),
    (b"UdpS", Role::GamingNetwork),
    (b"Rtc", Role::GamingNetwork),
    (b"NATS", Role::GamingNetwork),
    (b"OnlineA", Role::GamingNetwork),
    // Interrupt threads.
    (b"irq/", Role::Interrupt),
    (b"ksoftirq", Role::Interrupt),
    // Generic networking.
    (b"HttpMan", Role::Network),
    (b"IoS", Role::Network),
    (b"IoD", Role::Network),
    (b"IOTh", Role::Network),
    (b"net", Role::Network),
    (b"Net", Role::Network),
    (b"recv", Role::Network),
    (b"send", Role::Network),
    (b"sock", Role::Network),
    (b"io_", Role::Network),
    (b"pack", Role::Network),
    // Compositors.
    (b"kwin", Role::Compositor),
    (b"mutt", Role::Compositor),
    (b"west", Role::Compositor),
    (b"sway", Role::Compositor),
    (b"Hypr", Role::Compositor),
    (b"labw", Role::Compositor),
    (b"Xway", Role::Compositor),
    // Audio servers.
    (b"pipe", Role::SystemAudio),
    (b"pw-", Role::SystemAudio),
    (b"alsa", Role::SystemAudio),
    (b"jack", Role::SystemAudio),
    (b"puls", Role::SystemAudio),
    // In-game audio.
    (b"AudioDev", Role::GameAudio),
    (b"AudioEnc", Role::GameAudio),
    (b"FAud", Role::GameAudio),
    (b"Bink Snd", Role::GameAudio),
    (b"audi", Role::GameAudio),
    (b"soun", Role::GameAudio),
    (b"snd_", Role::GameAudio),
    (b"openal", Role::GameAudio),
    (b"fmod", Role::GameAudio),
    (b"wwis", Role::GameAudio),
    // Block IO.
    (b"nvme", Role::Storage),
    (b"jbd2", Role::Storage),
    (b"iou-", Role::Storage),
    (b"scsi_", Role::Storage),
];

#[derive(Default)]
pub struct NameClassifier;

impl NameClassifier {
    /// First matching rule for `comm`, ignoring scope.
    pub fn lookup(comm: &Comm) -> Option<Role> {
        NAME_RULES
            .iter()
            .find(|(prefix, _)| comm.starts_with(prefix))
            .map(|&(_, role)| role)
    }
}

impl Classifier for NameClassifier {
    fn name(&self) -> &'static str {
        "name"
    }

    fn classify(&self, input: &ClassifyInput<'_>) -> Option<Classification> {
        // The foreground process's main thread drives the game loop.
        let role = if input.scope.fg_main {
            Some(Role::Input)
        } else {
            Self::lookup(input.comm)
        }?;

        input.scope.admits(role).then_some(Classification {
            role,
            confidence: 100,
            source: Source::Name,
        })
    }
}

#[derive(Default)]
pub struct HintClassifier;

impl Classifier for HintClassifier {
    fn name(&self) -> &'static str {
        "hint"
    }

    fn classify(&self, input: &ClassifyInput<'_>) -> Option<Classification> {
        input
            .hint
            .filter(|h| input.scope.admits(h.role))
            .map(|h| Classification {
                source: Source::Hint,
                ..h
            })
    }
}

#[derive(Default)]
pub struct BehaviorClassifier;

impl Classifier for BehaviorClassifier {
    fn name(&self) -> &'static str {
        "behavior"
    }

    fn classify(&self, input: &ClassifyInput<'_>) -> Option<Classification> {
        input.behavior.verdict().filter(|c| input.scope.admits(c.role))
    }
}

/// Strategies evaluated in priority order; the first committed verdict wins.
pub struct ClassifierChain {
    strategies: Vec<Box<dyn Classifier>>,
}

impl Default for ClassifierChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(NameClassifier),
            Box::new(HintClassifier),
            Box::new(BehaviorClassifier),
        ])
    }
}

impl ClassifierChain {
    pub fn new(strategies: Vec<Box<dyn Classifier>>) -> Self {
        Self { strategies }
    }

    pub fn classify(&self, input: &ClassifyInput<'_>) -> Option<Classification> {
        self.strategies
            .iter()
            .filter_map(|s| s.classify(input))
            .find(Classification::committed)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

/// Observed execution pattern of one wake cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BehaviorSample {
    /// EMA of the interval between wakeups (ns).
    pub wake_interval_ns: u64,
    /// EMA of runtime per wake cycle (ns).
    pub exec_avg_ns: u64,
}

impl BehaviorSample {
    pub fn wake_hz(&self) -> u64 {
        if self.wake_interval_ns == 0 {
            0
        } else {
            NSEC_PER_SEC / self.wake_interval_ns
        }
    }
}

/// Strict match used to start or extend a stable run.
fn behavior_match(s: &BehaviorSample) -> Option<Role> {
    let hz = s.wake_hz();
    let exec = s.exec_avg_ns;

    if s.wake_interval_ns == 0 {
        None
    } else if hz > 500 && exec < 100 * NSEC_PER_USEC {
        Some(Role::Input)
    } else if hz > 300 && exec < 500 * NSEC_PER_USEC {
        Some(Role::GameAudio)
    } else if (60..=300).contains(&hz) && (500 * NSEC_PER_USEC..=10 * NSEC_PER_MSEC).contains(&exec) {
        Some(Role::GpuSubmit)
    } else if hz < 10 && exec > 5 * NSEC_PER_MSEC {
        Some(Role::Background)
    } else {
        None
    }
}

/// Wider band a committed role must leave before it is revoked.
fn behavior_holds(role: Role, s: &BehaviorSample) -> bool {
    let hz = s.wake_hz();
    let exec = s.exec_avg_ns;

    match role {
        Role::Input => hz > 300 && exec < 250 * NSEC_PER_USEC,
        Role::GameAudio => hz > 200 && exec < NSEC_PER_MSEC,
        Role::GpuSubmit => {
            (40..=400).contains(&hz) && (250 * NSEC_PER_USEC..=16 * NSEC_PER_MSEC).contains(&exec)
        }
        Role::Background => hz < 20 && exec > 5 * NSEC_PER_MSEC / 2,
        _ => false,
    }
}

/// What changed after feeding a sample to a [`BehaviorTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BehaviorChange {
    Committed(Role),
    Revoked(Role),
}

/// Per-task behavioral classification state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BehaviorTracker {
    pub last: BehaviorSample,
    candidate: Option<Role>,
    run: u16,
    committed: Option<Role>,
    miss_run: u16,
    need: u16,
}

impl BehaviorTracker {
    pub fn new(stable_samples: u32) -> Self {
        Self {
            need: stable_samples.clamp(1, u16::MAX as u32) as u16,
            ..Default::default()
        }
    }

    pub fn committed(&self) -> Option<Role> {
        self.committed
    }

    /// Current verdict with a confidence derived from the stable run length.
    pub fn verdict(&self) -> Option<Classification> {
        if let Some(role) = self.committed {
            return Some(Classification {
                role,
                confidence: if self.run >= self.need.saturating_mul(2) { 100 } else { 75 },
                source: Source::Behavior,
            });
        }
        let role = self.candidate?;
        let confidence = if self.run >= self.need {
            75
        } else if self.run.saturating_mul(2) >= self.need {
            50
        } else {
            0
        };
        Some(Classification {
            role,
            confidence,
            source: Source::Behavior,
        })
    }

    pub fn observe(&mut self, sample: BehaviorSample) -> Option<BehaviorChange> {
        self.last = sample;
        let matched = behavior_match(&sample);

        if let Some(role) = self.committed {
            if behavior_holds(role, &sample) {
                self.miss_run = 0;
                if matched == Some(role) {
                    self.run = self.run.saturating_add(1);
                }
                return None;
            }
            self.miss_run = self.miss_run.saturating_add(1);
            if self.miss_run < self.need {
                return None;
            }
            self.committed = None;
            self.candidate = matched;
            self.run = u16::from(matched.is_some());
            self.miss_run = 0;
            return Some(BehaviorChange::Revoked(role));
        }

        match matched {
            Some(role) if self.candidate == Some(role) => {
                self.run = self.run.saturating_add(1);
            }
            _ => {
                self.candidate = matched;
                self.run = u16::from(matched.is_some());
            }
        }

        match self.candidate {
            Some(role) if self.run >= self.need => {
                self.committed = Some(role);
                Some(BehaviorChange::Committed(role))
            }
            _ => None,
        }
    }

    pub fn update(&mut self, interval_ns: u64, exec_ns: u64) -> Option<BehaviorChange> {
        let last = self.last;
        let sample = BehaviorSample {
            wake_interval_ns: if last.wake_interval_ns == 0 {
                interval_ns
            } else {
                calc_avg(last.wake_interval_ns, interval_ns)
            },
            exec_avg_ns: if last.exec_avg_ns == 0 {
                exec_ns
            } else {
                calc_avg(last.exec_avg_ns, exec_ns)
            },
        };
        self.observe(sample)
    }
}

/// A classification hint posted by an external detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleHint {
    pub pid: i32,
    pub role: Role,
    pub confidence: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(comm: &'a Comm, scope: Scope, tracker: &'a BehaviorTracker) -> ClassifyInput<'a> {
        ClassifyInput {
            comm,
            scope,
            hint: None,
            behavior: tracker,
        }
    }

    const FG: Scope = Scope {
        foreground: true,
        fg_main: false,
    };
    const BG: Scope = Scope {
        foreground: false,
        fg_main: false,
    };

    #[test]
    fn precedence_picks_highest_role() {
        let flags = RoleFlags::BACKGROUND | RoleFlags::COMPOSITOR | RoleFlags::GPU_SUBMIT;
        assert_eq!(primary_role(flags), Some(Role::GpuSubmit));
        assert_eq!(priority_shift(flags), 6);
        assert_eq!(priority_shift(RoleFlags::empty()), 0);
        assert_eq!(priority_shift(RoleFlags::INPUT | RoleFlags::NETWORK), 7);

        // Shifts never increase going down the precedence list.
        for pair in ROLES.windows(2) {
            assert!(pair[0].priority_shift() >= pair[1].priority_shift());
        }
    }

    #[test]
    fn name_rules_follow_scope() {
        let chain = ClassifierChain::default();
        let t = BehaviorTracker::new(4);

        let dxvk = Comm::new("dxvk-submit");
        assert_eq!(chain.classify(&input(&dxvk, FG, &t)).map(|c| c.role), Some(Role::GpuSubmit));
        assert_eq!(chain.classify(&input(&dxvk, BG, &t)), None);

        let pw = Comm::new("pipewire");
        let c = chain.classify(&input(&pw, BG, &t)).unwrap();
        assert_eq!(c.role, Role::SystemAudio);
        assert_eq!(c.source, Source::Name);

        let main = Comm::new("game.exe");
        let scope = Scope {
            foreground: true,
            fg_main: true,
        };
        assert_eq!(chain.classify(&input(&main, scope, &t)).map(|c| c.role), Some(Role::Input));
    }

    #[test]
    fn hints_need_commit_confidence() {
        let chain = ClassifierChain::default();
        let t = BehaviorTracker::new(4);
        let comm = Comm::new("worker");
        let mut inp = input(&comm, FG, &t);

        inp.hint = Some(Classification {
            role: Role::GpuSubmit,
            confidence: 50,
            source: Source::Hint,
        });
        assert_eq!(chain.classify(&inp), None);

        inp.hint = Some(Classification {
            role: Role::GpuSubmit,
            confidence: 95,
            source: Source::Behavior,
        });
        let c = chain.classify(&inp).unwrap();
        assert_eq!(c.role, Role::GpuSubmit);
        assert_eq!(c.source, Source::Hint);
    }

    fn render_sample() -> BehaviorSample {
        // 120 Hz, 3ms bursts.
        BehaviorSample {
            wake_interval_ns: NSEC_PER_SEC / 120,
            exec_avg_ns: 3 * NSEC_PER_MSEC,
        }
    }

    #[test]
    fn behavior_needs_a_stable_run() {
        let mut t = BehaviorTracker::new(4);
        for _ in 0..3 {
            assert_eq!(t.observe(render_sample()), None);
        }
        assert_eq!(t.verdict().map(|c| c.committed()), Some(false));
        assert_eq!(t.observe(render_sample()), Some(BehaviorChange::Committed(Role::GpuSubmit)));
        assert_eq!(t.committed(), Some(Role::GpuSubmit));

        // A transient break resets the candidate run before commit.
        let mut t = BehaviorTracker::new(4);
        t.observe(render_sample());
        t.observe(render_sample());
        t.observe(BehaviorSample::default());
        t.observe(render_sample());
        assert_eq!(t.committed(), None);
    }

    #[test]
    fn committed_role_is_idempotent_and_sticky_in_band() {
        let mut t = BehaviorTracker::new(4);
        for _ in 0..4 {
            t.observe(render_sample());
        }
        for _ in 0..50 {
            assert_eq!(t.observe(render_sample()), None);
        }
        assert_eq!(t.verdict().unwrap().confidence, 100);

        // 50 Hz / 12ms is outside the strict band but inside the wide one.
        let drift = BehaviorSample {
            wake_interval_ns: NSEC_PER_SEC / 50,
            exec_avg_ns: 12 * NSEC_PER_MSEC,
        };
        assert_eq!(behavior_match(&drift), None);
        for _ in 0..10 {
            assert_eq!(t.observe(drift), None);
        }
        assert_eq!(t.committed(), Some(Role::GpuSubmit));
    }

    #[test]
    fn role_is_revoked_outside_wide_band() {
        let mut t = BehaviorTracker::new(4);
        for _ in 0..4 {
            t.observe(render_sample());
        }
        let idle = BehaviorSample {
            wake_interval_ns: NSEC_PER_SEC,
            exec_avg_ns: 10 * NSEC_PER_USEC,
        };
        for _ in 0..3 {
            assert_eq!(t.observe(idle), None);
        }
        assert_eq!(t.observe(idle), Some(BehaviorChange::Revoked(Role::GpuSubmit)));
        assert_eq!(t.committed(), None);
    }

    #[test]
    fn behavior_patterns() {
        let audio = BehaviorSample {
            wake_interval_ns: NSEC_PER_SEC / 400,
            exec_avg_ns: 200 * NSEC_PER_USEC,
        };
        assert_eq!(behavior_match(&audio), Some(Role::GameAudio));

        let batch = BehaviorSample {
            wake_interval_ns: NSEC_PER_SEC / 2,
            exec_avg_ns: 40 * NSEC_PER_MSEC,
        };
        assert_eq!(behavior_match(&batch), Some(Role::Background));

        let poll = BehaviorSample {
            wake_interval_ns: NSEC_PER_SEC / 1000,
            exec_avg_ns: 20 * NSEC_PER_USEC,
        };
        assert_eq!(behavior_match(&poll), Some(Role::Input));
    }

    #[test]
    fn update_smooths_samples() {
        let mut t = BehaviorTracker::new(4);
        t.update(8 * NSEC_PER_MSEC, 2 * NSEC_PER_MSEC);
        assert_eq!(t.last.wake_interval_ns, 8 * NSEC_PER_MSEC);
        t.update(16 * NSEC_PER_MSEC, 2 * NSEC_PER_MSEC);
        assert_eq!(t.last.wake_interval_ns, 10 * NSEC_PER_MSEC);
    }
}
