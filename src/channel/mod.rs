pub mod subscription;

pub use subscription::{ChannelManager, Subscription, SubscriptionRecord, SubscriptionState};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use log::warn;
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::config::ChannelConfig;
use crate::types::{ExecutionId, JobError, JobState};

/// One logical progress event. Sequences start at 1 and strictly increase
/// per execution; attached jobs share the stream.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub sequence: u64,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Progress {
        percent: u8,
        message: String,
    },
    Terminal {
        outcome: JobState,
        result: Option<Value>,
        error: Option<JobError>,
    },
}

/// What a subscriber's cursor sees when it asks for the next batch.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Events newer than the cursor, in sequence order.
    Events(Vec<JobEvent>),
    /// Nothing new yet; the stream is still live.
    Pending,
    /// The terminal event was already delivered to this cursor.
    Closed,
    /// The buffer was trimmed past the cursor; replay is impossible.
    Gap { earliest: u64 },
}

struct StreamBuf {
    next_sequence: u64,
    first_sequence: u64,
    events: VecDeque<JobEvent>,
    terminal: bool,
}

/// Sequenced, bounded event buffer for one execution. Emission assigns
/// sequence numbers; subscribers replay from any cursor still inside the
/// buffer.
pub struct EventStream {
    buf: Mutex<StreamBuf>,
    notify: Notify,
    capacity: usize,
}

impl EventStream {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(StreamBuf {
                next_sequence: 1,
                first_sequence: 1,
                events: VecDeque::new(),
                terminal: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn emit_progress(&self, percent: u8, message: &str) -> Option<u64> {
        self.emit(EventPayload::Progress {
            percent,
            message: message.to_string(),
        })
    }

    /// Emits the final event for this execution. At most one terminal event
    /// is ever recorded; later calls are ignored.
    pub fn emit_terminal(
        &self,
        outcome: JobState,
        result: Option<Value>,
        error: Option<JobError>,
    ) -> Option<u64> {
        self.emit(EventPayload::Terminal {
            outcome,
            result,
            error,
        })
    }

    fn emit(&self, payload: EventPayload) -> Option<u64> {
        let sequence = {
            let mut buf = self.buf.lock().unwrap();
            if buf.terminal {
                warn!("dropping event emitted after terminal frame");
                return None;
            }
            if let EventPayload::Terminal { .. } = payload {
                buf.terminal = true;
            }
            let sequence = buf.next_sequence;
            buf.next_sequence += 1;
            buf.events.push_back(JobEvent { sequence, payload });
            while buf.events.len() > self.capacity {
                buf.events.pop_front();
                buf.first_sequence += 1;
            }
            sequence
        };
        self.notify.notify_waiters();
        Some(sequence)
    }

    pub fn is_terminal(&self) -> bool {
        self.buf.lock().unwrap().terminal
    }

    /// Reads everything past `cursor` (the last delivered sequence).
    pub fn read_from(&self, cursor: u64) -> ReadOutcome {
        let buf = self.buf.lock().unwrap();
        if cursor + 1 < buf.first_sequence {
            return ReadOutcome::Gap {
                earliest: buf.first_sequence,
            };
        }
        let newer: Vec<JobEvent> = buf
            .events
            .iter()
            .filter(|e| e.sequence > cursor)
            .cloned()
            .collect();
        if !newer.is_empty() {
            ReadOutcome::Events(newer)
        } else if buf.terminal {
            ReadOutcome::Closed
        } else {
            ReadOutcome::Pending
        }
    }

    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// Directory of live event streams, keyed by execution. Streams are opened
/// by the scheduler at submission and retired with their job records.
pub struct ProgressHub {
    streams: RwLock<HashMap<ExecutionId, Arc<EventStream>>>,
    config: ChannelConfig,
}

impl ProgressHub {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn open(&self, execution_id: ExecutionId) -> Arc<EventStream> {
        let stream = Arc::new(EventStream::new(self.config.buffer_events));
        self.streams
            .write()
            .unwrap()
            .insert(execution_id, stream.clone());
        stream
    }

    pub fn stream(&self, execution_id: &ExecutionId) -> Option<Arc<EventStream>> {
        self.streams.read().unwrap().get(execution_id).cloned()
    }

    pub fn retire(&self, execution_id: &ExecutionId) {
        self.streams.write().unwrap().remove(execution_id);
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
