//! Concurrent synthetic load
//!
//! Drives many producer threads against one [`Scheduler`] using rayon. Used by
//! the CLI `run` command and the benchmarks.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::api::Scheduler;
use crate::error::SchedError;
use crate::object::{CommandRequest, ContextId, DrawRequest};

/// Synthetic load description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSpec {
    /// Submissions per context
    pub submissions: usize,
    /// Commands per submission
    pub batch: usize,
    /// IBs per command
    pub ibs: usize,
    /// Append a marker to every n-th submission; 0 disables
    pub marker_every: usize,
}

impl Default for LoadSpec {
    fn default() -> Self {
        Self {
            submissions: 64,
            batch: 2,
            ibs: 4,
            marker_every: 8,
        }
    }
}

/// What one producer achieved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerReport {
    /// Context driven
    pub context: ContextId,
    /// Accepted submissions
    pub accepted: usize,
    /// Backpressure timeouts
    pub timed_out: usize,
    /// Submissions refused because the context was invalidated or released
    pub rejected: usize,
    /// Last timestamp assigned
    pub last_timestamp: u32,
}

fn submission(spec: &LoadSpec, index: usize) -> Vec<DrawRequest> {
    let mut requests: Vec<DrawRequest> = (0..spec.batch)
        .map(|_| DrawRequest::Command(CommandRequest::with_ib_count(spec.ibs)))
        .collect();
    if spec.marker_every > 0 && (index + 1) % spec.marker_every == 0 {
        requests.push(DrawRequest::Marker);
    }
    requests
}

/// Run one producer per context in parallel, calling `progress` after every submission
pub fn run_producers<F>(
    scheduler: &Scheduler,
    contexts: &[ContextId],
    spec: LoadSpec,
    progress: F,
) -> Vec<ProducerReport>
where
    F: Fn() + Sync,
{
    contexts
        .par_iter()
        .map(|&context| {
            let mut report = ProducerReport {
                context,
                ..ProducerReport::default()
            };
            for i in 0..spec.submissions {
                match scheduler.queue_commands(context, submission(&spec, i), None) {
                    Ok(ts) => {
                        report.accepted += 1;
                        report.last_timestamp = ts;
                    }
                    Err(SchedError::TimedOut) => report.timed_out += 1,
                    Err(err) => {
                        log::debug!("ctx {}: producer stopped: {}", context, err);
                        report.rejected += spec.submissions - i;
                        progress();
                        break;
                    }
                }
                progress();
            }
            report
        })
        .collect()
}
