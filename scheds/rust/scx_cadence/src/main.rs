// SPDX-License-Identifier: GPL-2.0
//
// scx_cadence: latency-first scheduling policy engine
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use scx_stats::prelude::*;
use scx_utils::build_id;

use scx_cadence::config::EngineConfig;
use scx_cadence::config::NSEC_PER_MSEC;
use scx_cadence::config::NSEC_PER_USEC;
use scx_cadence::host::Host;
use scx_cadence::sim::Scenario;
use scx_cadence::sim::Simulator;
use scx_cadence::stats;
use scx_cadence::stats::Metrics;
use scx_cadence::SCHEDULER_NAME;

/// Wall-clock pacing step while replaying a scenario.
const STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, clap::Parser)]
#[command(
    name = "scx_cadence",
    version,
    disable_version_flag = true,
    about = "Latency-first scheduling policy engine, driven by a simulated host."
)]
struct Opts {
    /// Scenario file (JSON). Without one, a built-in gaming desktop
    /// scenario is replayed.
    #[clap(short = 'c', long)]
    scenario: Option<PathBuf>,

    /// Override the scenario's random seed.
    #[clap(long)]
    seed: Option<u64>,

    /// Virtual time per wall-clock second. 0 replays as fast as possible.
    #[clap(long, default_value = "0")]
    speed: f64,

    /// Replay the scenario again after it ends, with the next seed.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    repeat: bool,

    /// Print the run report as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Maximum scheduling slice duration in microseconds.
    #[clap(short = 's', long)]
    slice_us: Option<u64>,

    /// Maximum runtime (since last sleep) that can be charged to a task in microseconds.
    #[clap(short = 'l', long)]
    slice_lag_us: Option<u64>,

    /// Migration limiter window in milliseconds.
    #[clap(long)]
    mig_window_ms: Option<u64>,

    /// Migrations allowed per task per window. 0 disables the limiter.
    #[clap(long)]
    mig_max: Option<u32>,

    /// Avoid placing tasks on a CPU whose SMT sibling is busy.
    #[clap(short = 'S', long, action = clap::ArgAction::SetTrue)]
    avoid_smt: bool,

    /// Enable NUMA optimizations.
    #[clap(short = 'n', long, action = clap::ArgAction::SetTrue)]
    enable_numa: bool,

    /// Disable CPU frequency control.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    disable_cpufreq: bool,

    /// Keep wakees on the waker's CPU when they share an address space.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    mm_affinity: bool,

    /// Disable the per-address-space last CPU hint.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    disable_mm_hint: bool,

    /// Number of address spaces tracked by the last CPU hint.
    #[clap(long)]
    mm_hint_size: Option<u32>,

    /// Input boost window in microseconds.
    #[clap(long)]
    input_window_us: Option<u64>,

    /// Frame boost window in microseconds.
    #[clap(long)]
    frame_window_us: Option<u64>,

    /// Open the IO preference window alongside mouse input.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    prefer_napi_on_input: bool,

    /// Wakeup timer period in microseconds (min 250). 0=use slice_us.
    #[clap(long)]
    wakeup_timer_us: Option<u64>,

    /// Foreground process tgid. 0 treats every task as foreground.
    #[clap(long)]
    foreground: Option<u32>,

    /// Enable stats monitoring with the specified interval.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. The
    /// engine is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,
}

impl Opts {
    /// Layer command line overrides on top of a scenario's configuration.
    fn apply(&self, cfg: &mut EngineConfig) {
        if let Some(v) = self.slice_us {
            cfg.slice_ns = v * NSEC_PER_USEC;
        }
        if let Some(v) = self.slice_lag_us {
            cfg.slice_lag_ns = v * NSEC_PER_USEC;
        }
        if let Some(v) = self.mig_window_ms {
            cfg.mig_window_ns = v * NSEC_PER_MSEC;
        }
        if let Some(v) = self.mig_max {
            cfg.mig_max = v;
        }
        if let Some(v) = self.mm_hint_size {
            cfg.mm_hint_size = v;
        }
        if let Some(v) = self.input_window_us {
            cfg.input_window_ns = v * NSEC_PER_USEC;
        }
        if let Some(v) = self.frame_window_us {
            cfg.frame_window_ns = v * NSEC_PER_USEC;
        }
        if let Some(v) = self.wakeup_timer_us {
            cfg.wakeup_timer_ns = v * NSEC_PER_USEC;
        }
        cfg.avoid_smt |= self.avoid_smt;
        cfg.enable_numa |= self.enable_numa;
        cfg.disable_cpufreq |= self.disable_cpufreq;
        cfg.mm_affinity |= self.mm_affinity;
        cfg.disable_mm_hint |= self.disable_mm_hint;
        cfg.prefer_napi_on_input |= self.prefer_napi_on_input;
        cfg.no_stats = self.stats.is_none() && self.monitor.is_none();
    }

    fn scenario(&self) -> Result<Scenario> {
        let mut scenario = match &self.scenario {
            Some(path) => Scenario::load(path)?,
            None => Scenario::demo(),
        };
        self.apply(&mut scenario.config);
        if let Some(seed) = self.seed {
            scenario.seed = seed;
        }
        if let Some(tgid) = self.foreground {
            scenario.foreground = tgid;
        }
        Ok(scenario)
    }
}

struct Runner<'a> {
    opts: &'a Opts,
    stats_server: StatsServer<(), Metrics>,
}

impl<'a> Runner<'a> {
    fn init(opts: &'a Opts) -> Result<Self> {
        if opts.speed < 0.0 || !opts.speed.is_finite() {
            bail!("--speed must be a finite non-negative number");
        }
        let stats_server = StatsServer::new(stats::server_data()).launch()?;
        Ok(Self { opts, stats_server })
    }

    /// Replay one scenario. Returns whether another pass should follow.
    fn run(&mut self, scenario: Scenario, shutdown: &AtomicBool) -> Result<bool> {
        let (stats_response_tx, stats_request_rx) = self.stats_server.channels();

        info!(
            "{} {}: {} cpus, {} tasks, {}ms",
            SCHEDULER_NAME,
            build_id::full_version(env!("CARGO_PKG_VERSION")),
            scenario.nr_cpus,
            scenario.tasks.len(),
            scenario.duration_ms
        );
        let mut sim = Simulator::new(scenario)?;

        let step_ns = (STEP.as_secs_f64() * self.opts.speed * 1e9) as u64;
        let mut next = Instant::now();
        while !sim.done() && !shutdown.load(Ordering::Relaxed) {
            if step_ns == 0 {
                sim.advance(sim.end())?;
            } else {
                next += STEP;
                let now = sim.engine().host().now();
                sim.advance(now + step_ns)?;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    std::thread::sleep(wait);
                }
            }

            while stats_request_rx.try_recv().is_ok() {
                stats_response_tx.send(sim.engine().snapshot())?;
            }
        }

        if shutdown.load(Ordering::Relaxed) {
            info!("interrupted, reporting partial run");
        }
        let report = sim.run()?;
        if self.opts.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report.format(&mut std::io::stdout())?;
        }

        Ok(self.opts.repeat && !shutdown.load(Ordering::Relaxed))
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!(
            "{} {}",
            SCHEDULER_NAME,
            build_id::full_version(env!("CARGO_PKG_VERSION"))
        );
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    if lcfg.set_time_offset_to_local().is_err() {
        eprintln!("failed to set local time offset, logging in UTC");
    }
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let stats_thread = if let Some(intv) = opts.monitor.or(opts.stats) {
        let shutdown_copy = shutdown.clone();
        Some(std::thread::spawn(move || {
            let stats_interval = Duration::from_secs_f64(intv);
            if let Err(e) = stats::monitor(stats_interval, shutdown_copy) {
                warn!("stats monitor thread finished because of an error {}", e)
            }
        }))
    } else {
        None
    };

    // Monitor-only mode: just run the stats thread
    if opts.monitor.is_some() {
        if let Some(jh) = stats_thread {
            let _ = jh.join();
        }
        return Ok(());
    }

    let mut scenario = opts.scenario()?;
    let mut runner = Runner::init(&opts)?;
    while runner.run(scenario.clone(), &shutdown)? {
        scenario.seed = scenario.seed.wrapping_add(1);
    }

    // The monitor only exits on shutdown; a finished replay ends it too.
    shutdown.store(true, Ordering::Relaxed);
    if let Some(jh) = stats_thread {
        info!("Waiting for stats thread to finish...");
        let _ = jh.join();
    }

    Ok(())
}
