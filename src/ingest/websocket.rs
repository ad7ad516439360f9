//! WebSocket frame source with unbounded reconnect.
//!
//! Connects to the bridge endpoint, decodes every text or binary message and
//! pushes the result into the pipeline channel. A dropped or refused
//! connection is retried forever with capped exponential backoff; only the
//! shutdown signal (or the pipeline going away) ends the loop.

use crate::clock::SharedClock;
use crate::ingest::frame::{decode_frame, decode_frame_bytes, DecodeError, Frame};
use crate::retry::Backoff;
use crate::stats::SharedIngestStats;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

/// Why a connection ended.
enum Disconnect {
    /// Shutdown requested or pipeline closed; do not reconnect
    Stop,
    /// Transport went away; reconnect after backoff
    Lost(String),
}

pub struct WsSource {
    url: String,
    backoff: Backoff,
    stats: SharedIngestStats,
    clock: SharedClock,
}

impl WsSource {
    pub fn new(
        url: impl Into<String>,
        backoff: Backoff,
        stats: SharedIngestStats,
        clock: SharedClock,
    ) -> Self {
        Self {
            url: url.into(),
            backoff: backoff.normalized(),
            stats,
            clock,
        }
    }

    /// Run until `shutdown` flips to `true` or `frames` is closed.
    pub async fn run(self, frames: mpsc::Sender<Frame>, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0_u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            tracing::info!(url = %self.url, "connecting to frame source");
            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            let reason = match connected {
                Ok((socket, _)) => {
                    tracing::info!(url = %self.url, "connected to frame source");
                    failures = 0;
                    match self.pump(socket, &frames, &mut shutdown).await {
                        Disconnect::Stop => break,
                        Disconnect::Lost(reason) => reason,
                    }
                }
                Err(error) => error.to_string(),
            };

            failures = failures.saturating_add(1);
            let delay = self.backoff.delay_for_attempt(failures);
            tracing::warn!(
                url = %self.url,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "frame source disconnected, reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("frame source stopped");
    }

    async fn pump(
        &self,
        mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
        frames: &mpsc::Sender<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        loop {
            let message = tokio::select! {
                message = socket.next() => message,
                _ = shutdown.changed() => {
                    let _ = socket.close(None).await;
                    return Disconnect::Stop;
                }
            };

            let decoded = match message {
                None => return Disconnect::Lost("stream ended".to_string()),
                Some(Err(error)) => return Disconnect::Lost(error.to_string()),
                Some(Ok(WsMessage::Text(text))) => decode_frame(&text, self.clock.now()),
                Some(Ok(WsMessage::Binary(payload))) => {
                    decode_frame_bytes(&payload, self.clock.now())
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    if socket.send(WsMessage::Pong(payload)).await.is_err() {
                        return Disconnect::Lost("failed to answer ping".to_string());
                    }
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) => {
                    return Disconnect::Lost("closed by peer".to_string())
                }
                Some(Ok(_)) => continue,
            };

            match decoded {
                Ok(frame) => {
                    if frames.send(frame).await.is_err() {
                        return Disconnect::Stop;
                    }
                }
                Err(error) => self.reject(error),
            }
        }
    }

    fn reject(&self, error: DecodeError) {
        self.stats.record_processed();
        self.stats.record_failed();
        tracing::warn!(error = %error, "dropping malformed frame");
    }
}
