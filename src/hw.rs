//! Interfaces to the hardware and firmware services the scheduler drives
//!
//! The scheduler never touches registers or firmware messages itself. Everything
//! it needs from the device goes through the narrow traits below, bundled into
//! [`Interfaces`]. The `sim` module provides an in-process implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::HwError;
use crate::fault::FaultCause;
use crate::object::{ContextId, DrawObject};

/// Which per-context timestamp to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimestampKind {
    /// Last timestamp the hardware started executing
    Consumed,
    /// Last timestamp the hardware finished
    Retired,
}

/// Opaque handle for a hardware-backed fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FenceHandle(pub u64);

/// Firmware submission queue
#[cfg_attr(test, mockall::automock)]
pub trait HardwareQueue: Send + Sync {
    /// Hand one object to the firmware
    fn submit(&self, context_id: ContextId, object: &DrawObject) -> Result<(), HwError>;
    /// Reset the hardware after a fault, discarding everything queued on it
    fn reset(&self) -> Result<(), HwError>;
}

/// Per-context timestamp memory shared with the hardware
#[cfg_attr(test, mockall::automock)]
pub trait TimestampStore: Send + Sync {
    /// Read a hardware-reported timestamp
    fn read(&self, context_id: ContextId, kind: TimestampKind) -> u32;
    /// Write both timestamps without hardware involvement
    fn force_write(&self, context_id: ContextId, timestamp: u32);
}

/// Fault snapshot capture
#[cfg_attr(test, mockall::automock)]
pub trait Diagnostics: Send + Sync {
    /// Capture device state for a fault, optionally scoped to a context
    fn snapshot(&self, context: Option<ContextId>, cause: FaultCause);
}

/// Active power vote
#[cfg_attr(test, mockall::automock)]
pub trait PowerControl: Send + Sync {
    /// Keep the GPU powered
    fn acquire_vote(&self) -> Result<(), HwError>;
    /// Allow the GPU to power down
    fn release_vote(&self);
}

/// Timestamp event notification
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Wake anything waiting on the context's timestamps
    fn signal_group(&self, context_id: ContextId);
}

/// Hardware fence allocation for sync objects
#[cfg_attr(test, mockall::automock)]
pub trait HardwareFence: Send + Sync {
    /// Back a sync object with a hardware fence; best-effort, never blocks
    fn register(&self, context_id: ContextId, sync: &DrawObject) -> Option<FenceHandle>;
    /// Return a fence once its sync object retires
    fn release(&self, handle: FenceHandle);
}

/// Hardware fences unavailable; every sync is resolved in software
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardwareFence;

impl HardwareFence for NoHardwareFence {
    fn register(&self, _context_id: ContextId, _sync: &DrawObject) -> Option<FenceHandle> {
        None
    }

    fn release(&self, _handle: FenceHandle) {}
}

/// Event sink that drops notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvents;

impl EventSink for NullEvents {
    fn signal_group(&self, _context_id: ContextId) {}
}

/// Diagnostics that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn snapshot(&self, context: Option<ContextId>, cause: FaultCause) {
        log::error!("snapshot: cause={:?} context={:?}", cause, context);
    }
}

/// The set of external services the scheduler uses
#[derive(Clone)]
pub struct Interfaces {
    /// Firmware queue
    pub hardware_queue: Arc<dyn HardwareQueue>,
    /// Timestamp memory
    pub timestamps: Arc<dyn TimestampStore>,
    /// Snapshot capture
    pub diagnostics: Arc<dyn Diagnostics>,
    /// Power vote
    pub power: Arc<dyn PowerControl>,
    /// Timestamp events
    pub events: Arc<dyn EventSink>,
    /// Hardware fences
    pub hardware_fence: Arc<dyn HardwareFence>,
}

impl Interfaces {
    /// Build from one backend implementing every interface
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: HardwareQueue
            + TimestampStore
            + Diagnostics
            + PowerControl
            + EventSink
            + HardwareFence
            + 'static,
    {
        Self {
            hardware_queue: backend.clone(),
            timestamps: backend.clone(),
            diagnostics: backend.clone(),
            power: backend.clone(),
            events: backend.clone(),
            hardware_fence: backend,
        }
    }

    /// Build from the mandatory services with no-op events, log-only diagnostics and no hardware fences
    pub fn minimal(
        hardware_queue: Arc<dyn HardwareQueue>,
        timestamps: Arc<dyn TimestampStore>,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        Self {
            hardware_queue,
            timestamps,
            diagnostics: Arc::new(LogDiagnostics),
            power,
            events: Arc::new(NullEvents),
            hardware_fence: Arc::new(NoHardwareFence),
        }
    }

    pub(crate) fn retired(&self, context_id: ContextId) -> u32 {
        self.timestamps.read(context_id, TimestampKind::Retired)
    }

    pub(crate) fn consumed(&self, context_id: ContextId) -> u32 {
        self.timestamps.read(context_id, TimestampKind::Consumed)
    }
}
