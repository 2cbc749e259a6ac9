use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{JobError, JobState};
use super::JobId;

/// Server-to-client wire frames. Identical shape for every capability;
/// payloads stay opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: JobId,
        sequence: u64,
        percent: u8,
        message: String,
    },
    /// Slice of a logical payload too large for a single frame. All chunks
    /// of one logical event share its sequence number; the receiver
    /// reassembles before treating the payload as complete.
    #[serde(rename_all = "camelCase")]
    Chunk {
        job_id: JobId,
        sequence: u64,
        chunk_index: u32,
        total_chunks: u32,
        payload: String,
    },
    /// Always the last frame for a job. When the result was chunked, the
    /// inline result is null and the chunks carry the payload.
    #[serde(rename_all = "camelCase")]
    Terminal {
        job_id: JobId,
        sequence: u64,
        outcome: JobState,
        result: Option<Value>,
        error: Option<JobError>,
    },
    /// Replay from the requested sequence is impossible because the buffer
    /// was trimmed. The client must re-fetch status and restart tracking.
    #[serde(rename_all = "camelCase")]
    ResyncRequired {
        job_id: JobId,
        earliest_sequence: u64,
    },
}

impl Frame {
    pub fn sequence(&self) -> u64 {
        match self {
            Frame::Progress { sequence, .. }
            | Frame::Chunk { sequence, .. }
            | Frame::Terminal { sequence, .. } => *sequence,
            Frame::ResyncRequired { .. } => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Terminal { .. })
    }
}

/// Client-to-server wire frames. `subscribe` must be the first frame on a
/// freshly opened channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        job_id: JobId,
        last_delivered_sequence: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Ack { sequence: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_frames_tag_with_camel_case_type() {
        let frame = Frame::Progress {
            job_id: Uuid::nil(),
            sequence: 3,
            percent: 40,
            message: "fitting".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["jobId"], Uuid::nil().to_string());
        assert_eq!(json["sequence"], 3);

        let resync = Frame::ResyncRequired {
            job_id: Uuid::nil(),
            earliest_sequence: 12,
        };
        let json = serde_json::to_value(&resync).unwrap();
        assert_eq!(json["type"], "resyncRequired");
        assert_eq!(json["earliestSequence"], 12);
    }

    #[test]
    fn test_subscribe_frame_parses_without_sequence() {
        let parsed: ClientFrame =
            serde_json::from_str(&format!(r#"{{"type":"subscribe","jobId":"{}"}}"#, Uuid::nil()))
                .unwrap();
        assert_eq!(
            parsed,
            ClientFrame::Subscribe {
                job_id: Uuid::nil(),
                last_delivered_sequence: None,
            }
        );
    }
}
