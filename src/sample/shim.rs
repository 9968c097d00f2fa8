//! Environment-driven arming of a process-global sampler.
//!
//! Worker processes are usually profiled by preloading a thin shared library
//! that calls [`arm_from_env`] at load time. Configuration comes entirely
//! from environment variables so the workload itself stays untouched:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `ENABLE_SAMPLING=1` | arm sampling |
//! | `SAMPLING_FREQUENCY=<Hz>` | sample rate, default 1000 |
//! | `OUTPUT_DIRECTORY=<path>` | where flushes land |
//! | `OUTPUT_FILENAME=<stem>` | output file stem |
//! | `COMPRESS=1` | gzip sample output |
//! | `CALLSTACK=0` | capture only the interrupted address |
//! | `TIMER_METHOD=cycle\|posix\|auto` | timing source |
//! | `FLUSH_INTERVAL=<s>` | periodic flush, 0 = on demand |
//! | `SYMBOL_DEBUG=1` | verbose symbol-resolution logging |
//!
//! The process rank for output naming is taken from the launcher environment
//! (`PMI_RANK`, `OMPI_COMM_WORLD_RANK` or `SLURM_PROCID`).

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use log::{error, info, warn};

use super::sampler::{Sampler, SamplerConfig, SamplerState, TimerMethod};

static GLOBAL: OnceLock<Sampler> = OnceLock::new();

impl SamplerConfig {
    /// Builds a configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(freq) = env_parse::<u64>("SAMPLING_FREQUENCY") {
            if freq > 0 {
                config.frequency_hz = freq;
            }
        }
        if let Ok(dir) = env::var("OUTPUT_DIRECTORY") {
            if !dir.is_empty() {
                config.output_directory = dir.into();
            }
        }
        if let Ok(stem) = env::var("OUTPUT_FILENAME") {
            if !stem.is_empty() {
                config.output_stem = stem;
            }
        }
        config.compress_output = env_flag("COMPRESS");
        if env::var("CALLSTACK").ok().as_deref() == Some("0") {
            config.unwind_stacks = false;
        }
        config.timer = match env::var("TIMER_METHOD").ok().as_deref() {
            Some("cycle") => TimerMethod::Cycle,
            Some("posix") => TimerMethod::Posix,
            Some("auto") | None => TimerMethod::Auto,
            Some(other) => {
                warn!("unknown TIMER_METHOD {other:?}, using auto");
                TimerMethod::Auto
            }
        };
        if let Some(secs) = env_parse::<u64>("FLUSH_INTERVAL") {
            config.flush_interval = Duration::from_secs(secs);
        }
        config.rank = rank_from_env();
        config
    }
}

/// Arms the process-global sampler when `ENABLE_SAMPLING=1` is set.
///
/// Returns the armed sampler, or `None` when sampling is disabled or could
/// not be started. Failures are logged, never fatal to the host process.
pub fn arm_from_env() -> Option<&'static Sampler> {
    if !env_flag("ENABLE_SAMPLING") {
        return None;
    }

    let config = SamplerConfig::from_env();
    let interval = config.flush_interval;
    let sampler = GLOBAL.get_or_init(Sampler::new);

    if sampler.state() != SamplerState::Uninitialized {
        return Some(sampler);
    }
    if let Err(err) = sampler.initialize(config) {
        error!("failed to initialize sampler: {err}");
        return None;
    }
    if let Err(err) = sampler.start() {
        error!("failed to start sampler: {err}");
        sampler.cleanup();
        return None;
    }
    info!("sampling armed at rank {}", sampler.config().rank);

    if !interval.is_zero() {
        std::thread::spawn(move || {
            let sampler = GLOBAL.get().expect("armed sampler");
            loop {
                std::thread::sleep(interval);
                match sampler.state() {
                    SamplerState::Running => {
                        if let Err(err) = sampler.flush() {
                            warn!("periodic flush failed: {err}");
                        }
                    }
                    _ => break,
                }
            }
        });
    }

    Some(sampler)
}

/// The sampler armed by [`arm_from_env`], if any.
pub fn armed_sampler() -> Option<&'static Sampler> {
    GLOBAL.get()
}

/// Stops the armed sampler, flushing once before release.
pub fn disarm() {
    if let Some(sampler) = GLOBAL.get() {
        let _ = sampler.stop();
        match sampler.flush() {
            Ok(report) => info!(
                "final flush: {} distinct stacks in {}",
                report.distinct_stacks,
                report.sample_path.display()
            ),
            Err(err) => warn!("final flush failed: {err}"),
        }
        sampler.cleanup();
    }
}

fn rank_from_env() -> u32 {
    for var in ["PMI_RANK", "OMPI_COMM_WORLD_RANK", "SLURM_PROCID"] {
        if let Some(rank) = env_parse::<u32>(var) {
            return rank;
        }
    }
    0
}

fn env_flag(name: &str) -> bool {
    env::var(name).ok().as_deref() == Some("1")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}
