use std::fs::File;
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use log::warn;

use crate::error::SamplerError;
use crate::ffi::{self, perf};

use super::sampler::{SamplerConfig, TimerMethod};

// Both sources deliver overflow through the same signal so one handler
// serves either.
pub(super) const OVERFLOW_SIGNAL: i32 = libc::SIGPROF;

/// The overflow generator behind a running sampler.
pub(super) enum EventSource {
    /// A `perf_event_open` counter signalling `SIGPROF` on overflow through
    /// `O_ASYNC` + `F_SETSIG` on the event fd.
    Perf(File),
    /// A POSIX profiling interval timer (`setitimer`, `ITIMER_PROF`).
    Timer { interval: Duration },
}

impl EventSource {
    pub fn open(cfg: &SamplerConfig) -> Result<Self, SamplerError> {
        match cfg.timer {
            TimerMethod::Cycle => Self::open_perf(cfg),
            TimerMethod::Posix => Ok(Self::timer(cfg)),
            TimerMethod::Auto => Self::open_perf(cfg).or_else(|err| {
                warn!("perf event unavailable ({err}), falling back to posix timer");
                Ok(Self::timer(cfg))
            }),
        }
    }

    fn timer(cfg: &SamplerConfig) -> Self {
        let micros = 1_000_000 / cfg.frequency_hz.max(1);
        Self::Timer {
            interval: Duration::from_micros(micros.max(1)),
        }
    }

    fn open_perf(cfg: &SamplerConfig) -> Result<Self, SamplerError> {
        let mut attr = perf::PerfEventAttr::default();
        let (type_, config) = cfg.event.as_perf();
        attr.type_ = type_;
        attr.config = config;
        attr.flags = perf::FLAG_DISABLED | perf::FLAG_EXCLUDE_KERNEL | perf::FLAG_EXCLUDE_HV;
        if cfg.overflow_threshold > 0 {
            attr.sample_period_or_freq = cfg.overflow_threshold;
        } else {
            attr.flags |= perf::FLAG_FREQ;
            attr.sample_period_or_freq = cfg.frequency_hz;
        }
        attr.wakeup_events_or_watermark = 1;

        let file = ffi::perf_event_open(&attr, 0, -1, -1, 0).map_err(classify_perf_error)?;

        let flags = ffi::fcntl_arg(&file, libc::F_GETFL, 0).map_err(internal)?;
        ffi::fcntl_arg(&file, libc::F_SETFL, flags | libc::O_ASYNC).map_err(internal)?;
        ffi::fcntl_arg(&file, perf::F_SETSIG, OVERFLOW_SIGNAL).map_err(internal)?;
        ffi::fcntl_arg(&file, libc::F_SETOWN, unsafe { libc::getpid() }).map_err(internal)?;

        Ok(Self::Perf(file))
    }

    pub fn enable(&self) -> Result<(), SamplerError> {
        match self {
            Self::Perf(file) => {
                ffi::ioctl_arg(file, perf::PERF_EVENT_IOC_RESET, 0).map_err(internal)?;
                ffi::ioctl_arg(file, perf::PERF_EVENT_IOC_ENABLE, 0).map_err(internal)?;
                Ok(())
            }
            Self::Timer { interval } => set_profiling_timer(Some(*interval)),
        }
    }

    pub fn disable(&self) -> Result<(), SamplerError> {
        match self {
            Self::Perf(file) => {
                ffi::ioctl_arg(file, perf::PERF_EVENT_IOC_DISABLE, 0).map_err(internal)?;
                Ok(())
            }
            Self::Timer { .. } => set_profiling_timer(None),
        }
    }
}

fn set_profiling_timer(interval: Option<Duration>) -> Result<(), SamplerError> {
    let tv = match interval {
        Some(d) => libc::timeval {
            tv_sec: d.as_secs() as _,
            tv_usec: d.subsec_micros() as _,
        },
        None => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    };
    let spec = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &spec, ptr::null_mut()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(internal(io::Error::last_os_error()))
    }
}

pub(super) fn install_overflow_handler(
    handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void),
) -> Result<(), SamplerError> {
    let mut act: libc::sigaction = unsafe { mem::zeroed() };
    act.sa_sigaction = handler as usize;
    act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    let rc = unsafe { libc::sigaction(OVERFLOW_SIGNAL, &act, ptr::null_mut()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(internal(io::Error::last_os_error()))
    }
}

fn classify_perf_error(err: io::Error) -> SamplerError {
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => SamplerError::Permission,
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::EOPNOTSUPP)
        | Some(libc::EINVAL) => SamplerError::NotSupported,
        _ => internal(err),
    }
}

fn internal(err: io::Error) -> SamplerError {
    SamplerError::Internal(err.to_string())
}
