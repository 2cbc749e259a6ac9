use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_stream::stream;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::{EventPayload, EventStream, JobEvent, ReadOutcome};
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::types::{ChannelId, Frame, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Connected,
    Streaming,
    Disconnected,
    Closed,
}

/// Book-keeping for one subscriber channel. `last_delivered_sequence` is the
/// highest sequence the client has acknowledged, used for diagnostics and
/// idle accounting; resume-on-reconnect is driven by the sequence the client
/// presents in its subscribe frame.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub channel_id: ChannelId,
    pub job_id: JobId,
    pub last_delivered_sequence: u64,
    pub state: SubscriptionState,
    pub last_activity: DateTime<Utc>,
}

/// Tracks every open subscriber channel. Each subscription is pumped on its
/// own task, so one slow client never stalls another.
pub struct ChannelManager {
    records: Arc<RwLock<HashMap<ChannelId, SubscriptionRecord>>>,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Opens a subscription over an execution's event stream, resuming after
    /// `last_delivered` when the client presents one.
    pub fn subscribe(
        &self,
        job_id: JobId,
        stream: Arc<EventStream>,
        last_delivered: Option<u64>,
    ) -> Subscription {
        let channel_id = Uuid::new_v4();
        let record = SubscriptionRecord {
            channel_id,
            job_id,
            last_delivered_sequence: last_delivered.unwrap_or(0),
            state: SubscriptionState::Connected,
            last_activity: Utc::now(),
        };
        self.records.write().unwrap().insert(channel_id, record);
        Subscription {
            channel_id,
            job_id,
            stream,
            records: self.records.clone(),
            config: self.config.clone(),
            cursor: last_delivered.unwrap_or(0),
            finished: false,
        }
    }

    /// Records a client acknowledgement.
    pub fn ack(&self, channel_id: ChannelId, sequence: u64) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(&channel_id) {
            record.last_delivered_sequence = record.last_delivered_sequence.max(sequence);
            record.last_activity = Utc::now();
        }
    }

    /// Marks a channel disconnected but resumable within the idle window.
    pub fn disconnect(&self, channel_id: ChannelId) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(&channel_id) {
            record.state = SubscriptionState::Disconnected;
            record.last_activity = Utc::now();
        }
    }

    /// Tears a channel down for good.
    pub fn close(&self, channel_id: ChannelId) {
        self.records.write().unwrap().remove(&channel_id);
    }

    pub fn record(&self, channel_id: ChannelId) -> Option<SubscriptionRecord> {
        self.records.read().unwrap().get(&channel_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Closes subscriptions idle beyond the configured inactivity window.
    pub fn reap_idle(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, record| {
            let idle = (now - record.last_activity)
                .to_std()
                .unwrap_or_default();
            idle <= self.config.idle_timeout
        });
        before - records.len()
    }
}

/// One subscriber's cursor over an execution's event stream. Delivery is
/// strictly in sequence order; the cursor only moves forward.
pub struct Subscription {
    channel_id: ChannelId,
    job_id: JobId,
    stream: Arc<EventStream>,
    records: Arc<RwLock<HashMap<ChannelId, SubscriptionRecord>>>,
    config: ChannelConfig,
    cursor: u64,
    finished: bool,
}

impl Subscription {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Waits for and returns the next batch of wire frames, in sequence
    /// order. `Ok(None)` means the terminal frame has been delivered and the
    /// stream is complete.
    pub async fn next_frames(&mut self) -> Result<Option<Vec<Frame>>, ChannelError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.stream.read_from(self.cursor) {
                ReadOutcome::Gap { earliest } => {
                    self.finished = true;
                    self.remove_record();
                    return Err(ChannelError::ResyncRequired { earliest });
                }
                ReadOutcome::Events(events) => {
                    let mut frames = Vec::new();
                    for event in &events {
                        frames.extend(encode_event(
                            self.job_id,
                            event,
                            self.config.max_frame_bytes,
                        ));
                    }
                    if let Some(last) = events.last() {
                        self.cursor = last.sequence;
                        if matches!(last.payload, EventPayload::Terminal { .. }) {
                            self.finished = true;
                        }
                    }
                    self.mark_streaming();
                    return Ok(Some(frames));
                }
                ReadOutcome::Closed => {
                    self.finished = true;
                    self.remove_record();
                    return Ok(None);
                }
                ReadOutcome::Pending => {
                    // Wake on emission, with a fallback poll so a wakeup
                    // racing the read cannot strand the subscriber.
                    let _ =
                        tokio::time::timeout(self.config.poll_interval, self.stream.notified())
                            .await;
                }
            }
        }
    }

    /// Adapts the subscription into a frame stream. A replay gap ends the
    /// stream with a `resyncRequired` frame.
    pub fn into_stream(mut self) -> impl Stream<Item = Frame> {
        stream! {
            loop {
                match self.next_frames().await {
                    Ok(Some(frames)) => {
                        for frame in frames {
                            yield frame;
                        }
                    }
                    Ok(None) => break,
                    Err(ChannelError::ResyncRequired { earliest }) => {
                        yield Frame::ResyncRequired {
                            job_id: self.job_id,
                            earliest_sequence: earliest,
                        };
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    fn mark_streaming(&self) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(&self.channel_id) {
            record.state = SubscriptionState::Streaming;
            record.last_activity = Utc::now();
        }
    }

    fn remove_record(&self) {
        self.records.write().unwrap().remove(&self.channel_id);
    }
}

/// Renders one logical event as wire frames, stamped with the subscriber's
/// own job id. Oversized terminal results are split into chunk frames that
/// share the terminal's sequence number.
pub(crate) fn encode_event(job_id: JobId, event: &JobEvent, max_frame_bytes: usize) -> Vec<Frame> {
    match &event.payload {
        EventPayload::Progress { percent, message } => vec![Frame::Progress {
            job_id,
            sequence: event.sequence,
            percent: *percent,
            message: message.clone(),
        }],
        EventPayload::Terminal {
            outcome,
            result,
            error,
        } => {
            let serialized = result
                .as_ref()
                .and_then(|r| serde_json::to_vec(r).ok())
                .unwrap_or_default();
            if serialized.len() <= max_frame_bytes {
                return vec![Frame::Terminal {
                    job_id,
                    sequence: event.sequence,
                    outcome: *outcome,
                    result: result.clone(),
                    error: error.clone(),
                }];
            }

            let total_chunks = serialized.len().div_ceil(max_frame_bytes) as u32;
            let mut frames: Vec<Frame> = serialized
                .chunks(max_frame_bytes)
                .enumerate()
                .map(|(index, slice)| Frame::Chunk {
                    job_id,
                    sequence: event.sequence,
                    chunk_index: index as u32,
                    total_chunks,
                    payload: BASE64.encode(slice),
                })
                .collect();
            frames.push(Frame::Terminal {
                job_id,
                sequence: event.sequence,
                outcome: *outcome,
                result: None,
                error: error.clone(),
            });
            frames
        }
    }
}

/// Client-side helper: reassembles the chunk frames of one sequence back
/// into the result payload.
pub fn reassemble_chunks(chunks: &[Frame]) -> Option<Value> {
    let mut indexed: Vec<(u32, &str)> = Vec::new();
    for frame in chunks {
        if let Frame::Chunk {
            chunk_index,
            payload,
            ..
        } = frame
        {
            indexed.push((*chunk_index, payload));
        }
    }
    if indexed.is_empty() {
        return None;
    }
    indexed.sort_by_key(|(index, _)| *index);

    let mut bytes = Vec::new();
    for (_, payload) in indexed {
        bytes.extend(BASE64.decode(payload).ok()?);
    }
    serde_json::from_slice(&bytes).ok()
}
