use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::engine::AnalysisEngine;
use crate::error::ChannelError;
use crate::types::{ClientFrame, JobId};

pub async fn stream_job(
    ws: WebSocketUpgrade,
    Path(job_id): Path<JobId>,
    State(engine): State<Arc<AnalysisEngine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine, job_id))
}

/// Drives one subscriber channel: subscribe handshake, backlog replay plus
/// live frames on a dedicated pump task, acks on the read side. Each
/// subscriber gets its own bounded buffer and tasks, so a slow client only
/// ever stalls itself.
async fn handle_socket(socket: WebSocket, engine: Arc<AnalysisEngine>, path_job_id: JobId) {
    let config = engine.config().channel.clone();
    let (mut sink, mut source) = socket.split();

    // The first client frame must subscribe to the job named in the path.
    let first = tokio::time::timeout(config.idle_timeout, source.next()).await;
    let subscribe = match first {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<ClientFrame>(&text).ok(),
        _ => None,
    };
    let Some(ClientFrame::Subscribe {
        job_id,
        last_delivered_sequence,
    }) = subscribe
    else {
        let _ = sink
            .send(Message::Text(error_text(
                "bad_subscribe",
                "first frame must subscribe to this job",
            )))
            .await;
        let _ = sink.send(Message::Close(None)).await;
        return;
    };
    if job_id != path_job_id {
        let _ = sink
            .send(Message::Text(error_text(
                "bad_subscribe",
                "subscribe frame names a different job",
            )))
            .await;
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let subscription = match engine.subscribe(job_id, last_delivered_sequence) {
        Ok(subscription) => subscription,
        Err(e) => {
            let _ = sink.send(Message::Text(error_text(e.kind(), &e.to_string()))).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let channel_id = subscription.channel_id();
    debug!("channel {channel_id} subscribed to job {job_id}");

    // Writer task owns the socket sink; its bounded inbox is the
    // backpressure watermark.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Message>(config.outbound_buffer_frames);
    let writer = tokio::spawn(async move {
        while let Some(message) = frame_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Pump task: replays the backlog, then follows live frames.
    let pump_engine = engine.clone();
    let send_timeout = config.send_timeout;
    let pump = tokio::spawn(async move {
        let frames = subscription.into_stream();
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            let delivered =
                tokio::time::timeout(send_timeout, frame_tx.send(Message::Text(text))).await;
            if !matches!(delivered, Ok(Ok(()))) {
                // The buffer stayed over the watermark past the hard
                // timeout: tear down this subscriber only.
                warn!(
                    "channel {channel_id} torn down: {}",
                    ChannelError::BackpressureTimeout
                );
                pump_engine.channels().close(channel_id);
                return;
            }
        }
    });

    // Read side: acks refresh the subscription record until the client
    // disconnects or goes idle.
    loop {
        let next = tokio::time::timeout(config.idle_timeout, source.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(ClientFrame::Ack { sequence }) = serde_json::from_str(&text) {
                    engine.channels().ack(channel_id, sequence);
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) => break,
            Err(_) => {
                // Idle past the inactivity window; pump completion already
                // delivered everything a live client would have seen.
                if pump.is_finished() {
                    break;
                }
            }
        }
    }

    engine.channels().disconnect(channel_id);
    pump.abort();
    writer.abort();
}

fn error_text(kind: &str, message: &str) -> String {
    serde_json::json!({ "error": { "kind": kind, "message": message } }).to_string()
}
