//! Scheduler configuration

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::fault::FaultCause;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ring size per context; one slot is reserved for put-back
    pub context_queue_size: usize,
    /// Maximum objects accepted in one submission
    pub max_objects_per_submit: usize,
    /// Maximum IBs in one command
    pub max_ibs_per_command: usize,
    /// Commands with more IBs than this block dispatch until they retire
    pub single_slot_ib_limit: usize,
    /// Number of priority buckets (0 = highest)
    pub num_priorities: usize,
    /// Objects submitted per context before it is requeued for fairness
    pub context_burst: usize,
    /// Backpressure wait in `enqueue`
    pub enqueue_timeout_ms: u64,
    /// Unresolved sync objects are reported after this long
    pub sync_timeout_ms: u64,
    /// Inflight work with no consumed progress for this long is a hang
    pub hang_timeout_ms: u64,
    /// Faults tolerated within `fault_throttle_period_ms`; 0 disables throttling
    pub fault_throttle_burst: u32,
    /// Fault throttle window
    pub fault_throttle_period_ms: u64,
    /// Fault causes that always invalidate the owning context
    pub always_fatal: FaultCause,
    /// Stop retirement scans at the first unretired entry
    pub strict_fifo_retire: bool,
    /// Worker wake-up interval for requeued work and timeout checks
    pub worker_poll_ms: u64,
    /// Reset and replay after faults; when off the device stays halted
    pub recovery_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            context_queue_size: 128,
            max_objects_per_submit: 2048,
            max_ibs_per_command: 2000,
            single_slot_ib_limit: 256,
            num_priorities: 16,
            context_burst: 5,
            enqueue_timeout_ms: 2000,
            sync_timeout_ms: 5000,
            hang_timeout_ms: 2000,
            fault_throttle_burst: 3,
            fault_throttle_period_ms: 3000,
            always_fatal: FaultCause::FW_FATAL,
            strict_fifo_retire: false,
            worker_poll_ms: 10,
            recovery_enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Small queues and short timeouts, for tests and demos
    pub fn quick() -> Self {
        Self {
            context_queue_size: 8,
            max_objects_per_submit: 16,
            max_ibs_per_command: 64,
            single_slot_ib_limit: 16,
            num_priorities: 4,
            context_burst: 4,
            enqueue_timeout_ms: 200,
            sync_timeout_ms: 500,
            hang_timeout_ms: 500,
            worker_poll_ms: 2,
            ..Self::default()
        }
    }

    /// Throttling off, strict FIFO retirement, long timeouts
    pub fn debug() -> Self {
        Self {
            enqueue_timeout_ms: 60_000,
            sync_timeout_ms: 60_000,
            hang_timeout_ms: 60_000,
            fault_throttle_burst: 0,
            strict_fifo_retire: true,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SchedResult<Self> {
        let file = File::open(path)?;
        let config: SchedulerConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> SchedResult<()> {
        if self.context_queue_size < 2 {
            return Err(SchedError::Config(
                "context_queue_size must be at least 2".to_string(),
            ));
        }
        if self.num_priorities == 0 {
            return Err(SchedError::Config("num_priorities must be non-zero".to_string()));
        }
        if self.max_objects_per_submit == 0 || self.max_ibs_per_command == 0 {
            return Err(SchedError::Config("submission limits must be non-zero".to_string()));
        }
        if self.context_burst == 0 {
            return Err(SchedError::Config("context_burst must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Slots a producer may fill; the last one is kept for put-back
    pub fn usable_slots(&self) -> usize {
        self.context_queue_size - 1
    }

    pub(crate) fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub(crate) fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub(crate) fn hang_timeout(&self) -> Duration {
        Duration::from_millis(self.hang_timeout_ms)
    }

    pub(crate) fn throttle_period(&self) -> Duration {
        Duration::from_millis(self.fault_throttle_period_ms)
    }

    pub(crate) fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_presets_validate() {
        SchedulerConfig::default().validate().unwrap();
        SchedulerConfig::quick().validate().unwrap();
        SchedulerConfig::debug().validate().unwrap();
    }

    #[test]
    fn test_rejects_tiny_ring() {
        let config = SchedulerConfig {
            context_queue_size: 1,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(SchedError::Config(_))));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "context_queue_size": 32, "strict_fifo_retire": true }}"#).unwrap();

        let config = SchedulerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.context_queue_size, 32);
        assert!(config.strict_fifo_retire);
        assert_eq!(config.num_priorities, SchedulerConfig::default().num_priorities);
    }

    #[test]
    fn test_json_round_trip_keeps_fatal_mask() {
        let config = SchedulerConfig {
            always_fatal: FaultCause::FW_FATAL | FaultCause::PAGE_FAULT,
            ..SchedulerConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
