use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};

use crate::codec;
use crate::error::{CodecError, SamplerError};
use crate::ffi::perf;

use super::intern::InternMap;
use super::libmap::LibraryMap;
use super::source::{install_overflow_handler, EventSource};
use super::stack::{CallStack, MAX_STACK_DEPTH};
use super::unwind;

/// Hardware event driving overflow sampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    CpuCycles,
    Instructions,
    CacheMisses,
    BranchMisses,
    L1dAccess,
    L1dMiss,
    L2Access,
    L2Miss,
    BusCycles,
    MemAccess,
    /// Raw event code passed through to the PMU.
    Custom(u64),
}

impl EventKind {
    pub(super) fn as_perf(self) -> (u32, u64) {
        use perf::*;
        match self {
            Self::CpuCycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
            Self::Instructions => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
            Self::CacheMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
            Self::BranchMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
            Self::BusCycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
            Self::L1dAccess => (
                PERF_TYPE_HW_CACHE,
                hw_cache_config(
                    PERF_COUNT_HW_CACHE_L1D,
                    PERF_COUNT_HW_CACHE_OP_READ,
                    PERF_COUNT_HW_CACHE_RESULT_ACCESS,
                ),
            ),
            Self::L1dMiss => (
                PERF_TYPE_HW_CACHE,
                hw_cache_config(
                    PERF_COUNT_HW_CACHE_L1D,
                    PERF_COUNT_HW_CACHE_OP_READ,
                    PERF_COUNT_HW_CACHE_RESULT_MISS,
                ),
            ),
            Self::L2Access => (
                PERF_TYPE_HW_CACHE,
                hw_cache_config(
                    PERF_COUNT_HW_CACHE_LL,
                    PERF_COUNT_HW_CACHE_OP_READ,
                    PERF_COUNT_HW_CACHE_RESULT_ACCESS,
                ),
            ),
            Self::L2Miss => (
                PERF_TYPE_HW_CACHE,
                hw_cache_config(
                    PERF_COUNT_HW_CACHE_LL,
                    PERF_COUNT_HW_CACHE_OP_READ,
                    PERF_COUNT_HW_CACHE_RESULT_MISS,
                ),
            ),
            Self::MemAccess => (
                PERF_TYPE_HW_CACHE,
                hw_cache_config(
                    PERF_COUNT_HW_CACHE_NODE,
                    PERF_COUNT_HW_CACHE_OP_READ,
                    PERF_COUNT_HW_CACHE_RESULT_ACCESS,
                ),
            ),
            Self::Custom(code) => (PERF_TYPE_RAW, code),
        }
    }
}

/// Timing source selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMethod {
    /// PMU overflow through `perf_event_open`.
    Cycle,
    /// POSIX profiling interval timer.
    Posix,
    /// Try the PMU first, fall back to the timer.
    Auto,
}

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    /// Samples per second when no explicit overflow threshold is set.
    pub frequency_hz: u64,
    pub event: EventKind,
    /// Event count per overflow; 0 derives the period from `frequency_hz`.
    pub overflow_threshold: u64,
    pub max_stack_depth: usize,
    /// When false only the interrupted instruction pointer is captured.
    pub unwind_stacks: bool,
    pub compress_output: bool,
    /// Zero means flush only on demand.
    pub flush_interval: Duration,
    pub output_directory: PathBuf,
    /// Base name for output files; the rank and suffix are appended.
    pub output_stem: String,
    pub timer: TimerMethod,
    /// Distinct call stacks the intern map can hold.
    pub map_capacity: usize,
    /// Process rank used in output file names.
    pub rank: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1000,
            event: EventKind::CpuCycles,
            overflow_threshold: 0,
            max_stack_depth: MAX_STACK_DEPTH,
            unwind_stacks: true,
            compress_output: false,
            flush_interval: Duration::ZERO,
            output_directory: PathBuf::from("/tmp"),
            output_stem: String::from("parprof"),
            timer: TimerMethod::Auto,
            map_capacity: 65536,
            rank: 0,
        }
    }
}

/// Sampler lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SamplerState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
}

impl SamplerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initialized,
            2 => Self::Running,
            3 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }
}

/// Paths written by a successful [`Sampler::flush`].
#[derive(Clone, Debug)]
pub struct FlushReport {
    pub sample_path: PathBuf,
    pub libmap_path: PathBuf,
    pub distinct_stacks: usize,
}

// At most one sampler per process receives overflow signals.
static ACTIVE: AtomicPtr<Sampler> = AtomicPtr::new(ptr::null_mut());

extern "C" fn overflow_handler(_sig: i32, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let sampler = ACTIVE.load(Ordering::Acquire);
    if !sampler.is_null() {
        unsafe { (*sampler).on_overflow(ctx) };
    }
}

/// In-process overflow sampler.
///
/// Lifecycle: `Uninitialized → initialize → Initialized → start → Running ↔
/// stop → Stopped`, with [`cleanup`][Self::cleanup] returning to
/// `Uninitialized` from any state. Calls outside this machine fail with
/// [`SamplerError::BadState`] and never corrupt in-progress samples.
///
/// [`on_overflow`][Self::on_overflow] runs in asynchronous-signal context:
/// it captures at most `max_stack_depth` frames into a stack-allocated
/// [`CallStack`] and bumps its counter in the intern map. It never allocates
/// and never fails visibly; a full map or a truncated capture only advances
/// the drop counters.
///
/// The sampler registered for signal delivery must stay pinned until
/// [`cleanup`][Self::cleanup]; [`arm_from_env`][super::arm_from_env] keeps a
/// process-global instance for exactly that reason.
pub struct Sampler {
    state: AtomicU8,
    config: Mutex<SamplerConfig>,
    samples: AtomicPtr<InternMap<CallStack>>,
    source: Mutex<Option<EventSource>>,
    hot_depth: AtomicUsize,
    hot_unwind: AtomicBool,
    overflows: AtomicU64,
    sampled: AtomicU64,
    dropped: AtomicU64,
    truncated: AtomicU64,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SamplerState::Uninitialized as u8),
            config: Mutex::new(SamplerConfig::default()),
            samples: AtomicPtr::new(ptr::null_mut()),
            source: Mutex::new(None),
            hot_depth: AtomicUsize::new(MAX_STACK_DEPTH),
            hot_unwind: AtomicBool::new(true),
            overflows: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SamplerState {
        SamplerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn initialize(&self, config: SamplerConfig) -> Result<(), SamplerError> {
        self.expect_state(SamplerState::Uninitialized)?;
        validate(&config)?;

        let map = Box::new(InternMap::new(config.map_capacity));
        let source = EventSource::open(&config)?;
        install_overflow_handler(overflow_handler)?;

        let this = self as *const Sampler as *mut Sampler;
        if ACTIVE
            .compare_exchange(ptr::null_mut(), this, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(SamplerError::Internal(
                "another sampler is already active in this process".into(),
            ));
        }

        self.hot_depth
            .store(config.max_stack_depth, Ordering::Relaxed);
        self.hot_unwind.store(config.unwind_stacks, Ordering::Relaxed);
        self.samples.store(Box::into_raw(map), Ordering::Release);
        *self.source.lock().unwrap_or_else(|e| e.into_inner()) = Some(source);
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
        self.state
            .store(SamplerState::Initialized as u8, Ordering::Release);
        Ok(())
    }

    pub fn start(&self) -> Result<(), SamplerError> {
        let state = self.state();
        if state != SamplerState::Initialized && state != SamplerState::Stopped {
            return Err(SamplerError::BadState(state));
        }
        let guard = self.source.lock().unwrap_or_else(|e| e.into_inner());
        let source = guard
            .as_ref()
            .ok_or_else(|| SamplerError::Internal("event source missing".into()))?;
        source.enable()?;
        self.state
            .store(SamplerState::Running as u8, Ordering::Release);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), SamplerError> {
        let state = self.state();
        if state != SamplerState::Running {
            return Err(SamplerError::BadState(state));
        }
        // Flip the state first so in-flight handlers bail out early.
        self.state
            .store(SamplerState::Stopped as u8, Ordering::Release);
        let guard = self.source.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(source) = guard.as_ref() {
            source.disable()?;
        }
        Ok(())
    }

    /// Releases all resources. Idempotent from any state.
    pub fn cleanup(&self) {
        if self.state() == SamplerState::Running {
            let _ = self.stop();
        }
        let this = self as *const Sampler as *mut Sampler;
        let _ = ACTIVE.compare_exchange(this, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed);

        *self.source.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let map = self.samples.swap(ptr::null_mut(), Ordering::AcqRel);
        if !map.is_null() {
            drop(unsafe { Box::from_raw(map) });
        }
        self.state
            .store(SamplerState::Uninitialized as u8, Ordering::Release);
    }

    /// Overflow hot path; safe to call from a signal handler.
    pub fn on_overflow(&self, ctx: *mut libc::c_void) {
        if self.state.load(Ordering::Relaxed) != SamplerState::Running as u8 {
            return;
        }
        self.overflows.fetch_add(1, Ordering::Relaxed);

        let map = self.samples.load(Ordering::Acquire);
        if map.is_null() {
            return;
        }
        let map = unsafe { &*map };

        let mut stack = CallStack::new();
        let truncated = unwind::capture_from_context(
            &mut stack,
            ctx,
            self.hot_depth.load(Ordering::Relaxed),
            self.hot_unwind.load(Ordering::Relaxed),
        );
        if truncated {
            self.truncated.fetch_add(1, Ordering::Relaxed);
        }

        if map.increment(&stack, 1) {
            self.sampled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Persists the intern map and a fresh library-map snapshot.
    ///
    /// Sampling continues across flushes; counters are not reset.
    pub fn flush(&self) -> Result<FlushReport, SamplerError> {
        let state = self.state();
        if state == SamplerState::Uninitialized {
            return Err(SamplerError::BadState(state));
        }
        let config = self
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let map = self.samples.load(Ordering::Acquire);
        if map.is_null() {
            return Err(SamplerError::BadState(state));
        }
        let map = unsafe { &*map };

        std::fs::create_dir_all(&config.output_directory).map_err(CodecError::FileOpen)?;

        let sample_path = rank_path(
            &config.output_directory,
            &config.output_stem,
            config.rank,
            if config.compress_output {
                "pflw.gz"
            } else {
                "pflw"
            },
        );
        codec::write_samples(
            &sample_path,
            map,
            config.max_stack_depth as u32,
            config.compress_output,
        )?;

        let mut libmap = LibraryMap::new();
        if !libmap.parse_current_process() {
            warn!("could not parse /proc/self/maps; writing empty library map");
        }
        let libmap_path = rank_path(
            &config.output_directory,
            &config.output_stem,
            config.rank,
            "libmap",
        );
        codec::write_libmap(&libmap_path, &libmap, config.rank)?;

        info!(
            "flushed {} distinct stacks to {}",
            map.size(),
            sample_path.display()
        );
        Ok(FlushReport {
            sample_path,
            libmap_path,
            distinct_stacks: map.size(),
        })
    }

    /// The live intern map, when initialized.
    pub fn samples(&self) -> Option<&InternMap<CallStack>> {
        let map = self.samples.load(Ordering::Acquire);
        if map.is_null() {
            None
        } else {
            Some(unsafe { &*map })
        }
    }

    pub fn config(&self) -> SamplerConfig {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn sample_count(&self) -> u64 {
        self.sampled.load(Ordering::Relaxed)
    }

    /// Stacks dropped because the intern map was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Captures cut short by the depth limit.
    pub fn truncated_count(&self) -> u64 {
        self.truncated.load(Ordering::Relaxed)
    }

    fn expect_state(&self, expected: SamplerState) -> Result<(), SamplerError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(SamplerError::BadState(state))
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn validate(config: &SamplerConfig) -> Result<(), SamplerError> {
    if config.frequency_hz == 0 && config.overflow_threshold == 0 {
        return Err(SamplerError::ConfigInvalid(
            "frequency and overflow threshold are both zero".into(),
        ));
    }
    if config.max_stack_depth == 0 || config.max_stack_depth > MAX_STACK_DEPTH {
        return Err(SamplerError::ConfigInvalid(format!(
            "max_stack_depth must be in 1..={MAX_STACK_DEPTH}"
        )));
    }
    if config.map_capacity == 0 {
        return Err(SamplerError::ConfigInvalid("map_capacity is zero".into()));
    }
    if config.output_stem.is_empty() {
        return Err(SamplerError::ConfigInvalid("output_stem is empty".into()));
    }
    Ok(())
}

fn rank_path(dir: &Path, stem: &str, rank: u32, suffix: &str) -> PathBuf {
    dir.join(format!("{stem}_rank_{rank}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SamplerConfig {
        SamplerConfig {
            timer: TimerMethod::Posix,
            output_directory: std::env::temp_dir(),
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn lifecycle_rejects_out_of_order_calls() {
        let sampler = Sampler::new();
        assert!(matches!(
            sampler.start(),
            Err(SamplerError::BadState(SamplerState::Uninitialized))
        ));
        assert!(matches!(
            sampler.stop(),
            Err(SamplerError::BadState(SamplerState::Uninitialized))
        ));
        assert!(matches!(
            sampler.flush(),
            Err(SamplerError::BadState(SamplerState::Uninitialized))
        ));
        // Cleanup from any state is a no-op, not an error.
        sampler.cleanup();
        sampler.cleanup();
        assert_eq!(sampler.state(), SamplerState::Uninitialized);
    }

    #[test]
    fn initialize_validates_config() {
        let sampler = Sampler::new();
        let mut config = test_config();
        config.frequency_hz = 0;
        assert!(matches!(
            sampler.initialize(config),
            Err(SamplerError::ConfigInvalid(_))
        ));

        let mut config = test_config();
        config.max_stack_depth = MAX_STACK_DEPTH + 1;
        assert!(matches!(
            sampler.initialize(config),
            Err(SamplerError::ConfigInvalid(_))
        ));
        assert_eq!(sampler.state(), SamplerState::Uninitialized);
    }

    #[test]
    fn overflow_without_running_state_is_ignored() {
        let sampler = Sampler::new();
        sampler.on_overflow(std::ptr::null_mut());
        assert_eq!(sampler.overflow_count(), 0);
        assert_eq!(sampler.sample_count(), 0);
    }
}
