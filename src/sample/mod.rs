//! Runtime sampling: signal-safe stack capture and interning, the sampler
//! lifecycle, and the environment shim that arms it at library startup.

pub use intern::InternMap;
pub use libmap::{LibraryMap, LibraryRegion};
pub use sampler::{
    EventKind, FlushReport, Sampler, SamplerConfig, SamplerState, TimerMethod,
};
pub use shim::{arm_from_env, armed_sampler, disarm};
pub use stack::{CallStack, StableHash, MAX_STACK_DEPTH};

mod intern;
mod libmap;
mod sampler;
mod source;
mod shim;
mod stack;
mod unwind;

/// A captured stack tagged with its capture time and the library-map
/// snapshot that was current when it was taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawSample {
    pub stack: CallStack,
    /// Nanoseconds since an unspecified monotonic epoch.
    pub timestamp_ns: u64,
    pub map_id: u32,
}
