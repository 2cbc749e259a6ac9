pub mod selftest;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::{AnalysisInput, JobId};

/// Uniform execution contract every analysis capability implements. The
/// engine never looks past this boundary: parameters in, opaque result out.
///
/// Entry points must poll the context's cancellation token at safe points;
/// the engine never interrupts preemptively.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn execute(&self, input: &AnalysisInput, ctx: &ExecutionContext) -> Result<Value>;
}

/// Where a capability's progress reports land. Implemented by the scheduler;
/// kept as a trait so capabilities stay leaf modules.
pub trait ProgressSink: Send + Sync {
    /// Returns false when the report was rejected (duplicate or decreasing
    /// percent, or the job is no longer running).
    fn report(&self, percent: u8, message: &str) -> bool;
}

/// Per-invocation handle given to a capability entry point.
pub struct ExecutionContext {
    job_id: JobId,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(job_id: JobId, progress: Arc<dyn ProgressSink>, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            progress,
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn report_progress(&self, percent: u8, message: &str) -> bool {
        self.progress.report(percent, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
