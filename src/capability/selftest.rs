use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Capability, ExecutionContext};
use crate::types::AnalysisInput;

/// Built-in smoke-test capability: walks a fixed number of progress steps
/// and echoes its input back as the result. Lets operators exercise the
/// whole submit/stream/cache path without any analysis module installed.
pub struct SelftestAnalysis {
    steps: u8,
    step_delay: Duration,
}

impl SelftestAnalysis {
    pub fn new(steps: u8, step_delay: Duration) -> Self {
        Self {
            steps: steps.clamp(1, 100),
            step_delay,
        }
    }
}

impl Default for SelftestAnalysis {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200))
    }
}

#[async_trait]
impl Capability for SelftestAnalysis {
    async fn execute(&self, input: &AnalysisInput, ctx: &ExecutionContext) -> Result<Value> {
        for step in 1..=self.steps {
            if ctx.is_cancelled() {
                bail!("selftest interrupted at step {step}");
            }
            let percent = (u16::from(step) * 100 / u16::from(self.steps)) as u8;
            ctx.report_progress(percent, &format!("step {step}/{}", self.steps));
            tokio::time::sleep(self.step_delay).await;
        }

        Ok(json!({
            "echo": input.parameters,
            "dataset": input.dataset.uri,
            "steps": self.steps,
        }))
    }
}
