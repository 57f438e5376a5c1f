// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Migration admission control.
//!
//! Each task carries a token bucket scaled by [`MIG_TOKEN_SCALE`]; one
//! migration costs one full token. Under heavy load the limiter steps aside
//! so load balancing can work, with a two-level gate to avoid flapping.

use crate::config::MIG_TOKEN_SCALE;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenBucket {
    tokens: u64,
    last_refill: u64,
}

impl TokenBucket {
    pub fn full(max_tokens: u64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: 0,
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Credit tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: u64, window_ns: u64, max_tokens: u64) {
        if self.last_refill == 0 || self.last_refill > now {
            self.last_refill = now;
        }
        if self.tokens >= max_tokens {
            self.tokens = max_tokens;
            self.last_refill = now;
            return;
        }

        let elapsed = now - self.last_refill;
        if window_ns == 0 || elapsed > window_ns.saturating_mul(2) {
            self.tokens = max_tokens;
            self.last_refill = now;
            return;
        }

        // elapsed <= 2 windows, so the product fits comfortably in u128.
        let add = (elapsed as u128 * max_tokens as u128 / window_ns as u128) as u64;
        if add == 0 {
            return;
        }
        if self.tokens + add >= max_tokens {
            self.tokens = max_tokens;
            self.last_refill = now;
            return;
        }
        // Only advance by the time actually credited; the remainder carries.
        let credited = (add as u128 * window_ns as u128 / max_tokens as u128) as u64;
        self.tokens += add;
        self.last_refill += credited;
    }

    /// Refill, then take one migration's worth of tokens if available.
    pub fn try_consume(&mut self, now: u64, window_ns: u64, max_tokens: u64) -> bool {
        self.refill(now, window_ns, max_tokens);
        if self.tokens < MIG_TOKEN_SCALE {
            return false;
        }
        self.tokens -= MIG_TOKEN_SCALE;
        true
    }
}

/// Utilization gate with distinct enter and exit levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaturationGate {
    enter: u64,
    exit: u64,
    saturated: bool,
}

impl SaturationGate {
    pub fn new(enter: u64, exit: u64) -> Self {
        Self {
            enter,
            exit: exit.min(enter),
            saturated: false,
        }
    }

    /// Feed the smoothed utilization; returns whether the gate changed.
    pub fn update(&mut self, util_avg: u64) -> bool {
        let next = if self.saturated {
            util_avg > self.exit
        } else {
            util_avg >= self.enter
        };
        let changed = next != self.saturated;
        self.saturated = next;
        changed
    }

    pub fn saturated(&self) -> bool {
        self.saturated
    }
}

/// Facts about one migration opportunity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationCtx {
    pub now: u64,
    /// Task may run on a single CPU only.
    pub pinned: bool,
    /// Migration is explicitly disabled for the task right now.
    pub disabled: bool,
    /// Every sibling of the previous CPU's core is busy.
    pub smt_contended: bool,
    pub saturated: bool,
    pub window_ns: u64,
    pub max_tokens: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed without touching the bucket.
    Bypassed,
    Denied,
    /// Denied by the token bucket; counted as a blocked migration.
    Blocked,
}

impl Admission {
    pub fn allowed(self) -> bool {
        matches!(self, Admission::Allowed | Admission::Bypassed)
    }
}

pub fn allow_migration(bucket: &mut TokenBucket, ctx: &MigrationCtx) -> Admission {
    if ctx.pinned || ctx.disabled {
        return Admission::Denied;
    }
    if ctx.smt_contended {
        return Admission::Bypassed;
    }
    if ctx.saturated || ctx.window_ns == 0 || ctx.max_tokens == 0 {
        return Admission::Bypassed;
    }
    if bucket.try_consume(ctx.now, ctx.window_ns, ctx.max_tokens) {
        Admission::Allowed
    } else {
        Admission::Blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NSEC_PER_MSEC;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    const WINDOW: u64 = 50 * NSEC_PER_MSEC;
    const MAX: u64 = 3 * MIG_TOKEN_SCALE;

    fn ctx(now: u64) -> MigrationCtx {
        MigrationCtx {
            now,
            window_ns: WINDOW,
            max_tokens: MAX,
            ..Default::default()
        }
    }

    #[test]
    fn fourth_migration_in_a_burst_is_blocked() {
        let mut b = TokenBucket::full(MAX);
        let start = 1_000 * NSEC_PER_MSEC;
        let verdicts: Vec<_> = (0..4)
            .map(|i| allow_migration(&mut b, &ctx(start + i * 3 * NSEC_PER_MSEC)))
            .collect();
        assert_eq!(
            verdicts,
            [
                Admission::Allowed,
                Admission::Allowed,
                Admission::Allowed,
                Admission::Blocked
            ]
        );
    }

    #[test]
    fn pinned_and_disabled_never_migrate() {
        let mut b = TokenBucket::full(MAX);
        let pinned = MigrationCtx {
            pinned: true,
            smt_contended: true,
            ..ctx(1)
        };
        assert_eq!(allow_migration(&mut b, &pinned), Admission::Denied);
        let disabled = MigrationCtx {
            disabled: true,
            ..ctx(1)
        };
        assert_eq!(allow_migration(&mut b, &disabled), Admission::Denied);
        assert_eq!(b.tokens(), MAX);
    }

    #[test]
    fn contention_and_saturation_bypass_the_bucket() {
        let mut b = TokenBucket::default();
        let smt = MigrationCtx {
            smt_contended: true,
            ..ctx(1)
        };
        assert_eq!(allow_migration(&mut b, &smt), Admission::Bypassed);
        let sat = MigrationCtx {
            saturated: true,
            ..ctx(1)
        };
        assert!(allow_migration(&mut b, &sat).allowed());
        assert_eq!(b.tokens(), 0);
    }

    #[test]
    fn long_gap_saturates_without_overflow() {
        let mut b = TokenBucket::default();
        b.refill(1, WINDOW, MAX);
        b.refill(u64::MAX / 2, WINDOW, MAX);
        assert_eq!(b.tokens(), MAX);
    }

    #[test]
    fn partial_refill_is_proportional() {
        let mut b = TokenBucket::default();
        b.refill(NSEC_PER_MSEC, WINDOW, MAX);
        b.refill(NSEC_PER_MSEC + WINDOW / 2, WINDOW, MAX);
        assert_eq!(b.tokens(), MAX / 2);
    }

    #[test]
    fn tokens_stay_in_bounds_and_quota_rate_never_blocks() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut b = TokenBucket::full(MAX);
        let mut now = NSEC_PER_MSEC;
        for _ in 0..10_000 {
            now += rng.gen_range(0..WINDOW);
            allow_migration(&mut b, &ctx(now));
            assert!(b.tokens() <= MAX);
        }

        // Exactly 3 per 50ms, evenly spaced.
        let mut b = TokenBucket::full(MAX);
        let step = WINDOW / 3;
        for i in 1..200 {
            assert!(allow_migration(&mut b, &ctx(i * step)).allowed());
        }
    }

    #[test]
    fn quota_rate_never_blocks_over_many_windows() {
        let interval = WINDOW / (MAX / MIG_TOKEN_SCALE);
        let mut b = TokenBucket::full(MAX);
        let start = NSEC_PER_MSEC;
        // Thousands of windows: truncated refills would drain the bucket.
        for i in 0..10_000 {
            let verdict = allow_migration(&mut b, &ctx(start + i * interval));
            assert_eq!(verdict, Admission::Allowed, "attempt {}", i);
        }
        assert!(b.tokens() >= MAX - 2 * MIG_TOKEN_SCALE);
    }

    #[test]
    fn refill_keeps_the_uncredited_remainder() {
        let mut b = TokenBucket::default();
        b.refill(NSEC_PER_MSEC, WINDOW, MAX);
        let per_unit = WINDOW / MAX;
        // Two refills of 1.5 units each credit 3 units, not 2.
        let half = per_unit / 2;
        b.refill(NSEC_PER_MSEC + per_unit + half + 1, WINDOW, MAX);
        b.refill(NSEC_PER_MSEC + 3 * per_unit + 3, WINDOW, MAX);
        assert_eq!(b.tokens(), 3);
    }

    #[test]
    fn saturation_gate_has_hysteresis() {
        let mut g = SaturationGate::new(900, 700);
        assert!(!g.update(850));
        assert!(g.update(900));
        assert!(g.saturated());
        assert!(!g.update(800));
        assert!(g.saturated());
        assert!(g.update(700));
        assert!(!g.saturated());
    }
}
