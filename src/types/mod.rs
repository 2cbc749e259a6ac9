pub mod descriptor;
pub mod frame;
pub mod job;

pub use descriptor::{CapabilityDescriptor, CapabilitySummary, ServiceHandle};
pub use frame::{ClientFrame, Frame};
pub use job::{AnalysisInput, DatasetRef, JobError, JobOutcome, JobSnapshot, JobState};

use uuid::Uuid;

pub type JobId = Uuid;
pub type ChannelId = Uuid;
pub type ExecutionId = Uuid;
