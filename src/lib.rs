//! # hwsched - GPU command dispatch scheduler
//!
//! Accepts GPU work from many client threads, orders it per execution context,
//! hands it to the hardware in priority order, tracks it until the hardware
//! reports completion and recovers from hardware faults.
//!
//! ## Features
//!
//! - **Per-context ordered queues** with bounded backpressure and wrap-aware timestamps
//! - **Lock-free posting** of contexts into per-priority pending lists
//! - **Single serialized worker** that dispatches, retires and recovers
//! - **Markers, sync objects, timelines and bind operations** carried through the same pipeline
//! - **Fault recovery**: diagnosis, snapshot, invalidation policy, reset and in-order replay
//! - **Simulated hardware** for tests, benchmarks and the CLI (`sim` feature)
//!
//! ## Quick Start
//!
//! ```rust
//! use hwsched::prelude::*;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gpu = SimHardware::auto_retiring();
//!     let scheduler = Scheduler::new(SchedulerConfig::quick(), gpu.interfaces())?;
//!
//!     let ctx = scheduler.create_context(ContextParams::default())?;
//!     let ts = scheduler.queue_commands(
//!         ctx,
//!         vec![DrawRequest::Command(CommandRequest::with_ib_count(2))],
//!         None,
//!     )?;
//!     scheduler.wait_timestamp(ctx, ts, Duration::from_secs(1))?;
//!     println!("retired timestamp {}", ts);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod config;
pub mod context;
mod dispatcher;
pub mod error;
pub mod fault;
pub mod hw;
mod inflight;
pub mod object;
pub mod pending;
pub mod power;
#[cfg(feature = "sim")]
pub mod sim;
#[cfg(feature = "stress")]
pub mod stress;
mod sync;

// Re-export main API for easy access
pub use api::{Scheduler, SchedulerStats};
pub use config::SchedulerConfig;
pub use context::{ContextFlags, ContextParams, ContextStats, DrawContext};
pub use error::{HwError, SchedError, SchedResult};
pub use fault::{FaultCause, FaultRecord, FaultReport, FaultState};
pub use hw::{FenceHandle, Interfaces, TimestampKind};
pub use object::{
    timestamp_cmp, timestamp_retired, CommandFlags, CommandRequest, ContextId, DrawRequest, Fence,
    IbDesc, Lane, ProfileSample, ProfilingBuffer, SyncPoint, Timeline,
};
#[cfg(feature = "sim")]
pub use sim::SimHardware;
pub use sync::WaitOutcome;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library
///
/// # Example
///
/// ```no_run
/// hwsched::init();
/// ```
pub fn init() {
    log::debug!("hwsched v{}", VERSION);
}

/// Get library version
///
/// # Example
///
/// ```no_run
/// println!("Using hwsched v{}", hwsched::version());
/// ```
pub fn version() -> &'static str {
    VERSION
}


/// Prelude module for convenient imports
///
/// # Example
///
/// ```no_run
/// use hwsched::prelude::*;
///
/// let config = SchedulerConfig::default();
/// ```
pub mod prelude {
    pub use crate::api::{Scheduler, SchedulerStats};
    pub use crate::config::SchedulerConfig;
    pub use crate::context::{ContextFlags, ContextParams};
    pub use crate::error::{SchedError, SchedResult};
    pub use crate::fault::{FaultCause, FaultReport};
    pub use crate::hw::Interfaces;
    pub use crate::object::{CommandFlags, CommandRequest, ContextId, DrawRequest, Fence, SyncPoint, Timeline};
    #[cfg(feature = "sim")]
    pub use crate::sim::SimHardware;
    pub use crate::{init, version};
}
