//! Subscriber for the server's event stream.
//!
//! Parses `data:` frames off the long-lived response body and forwards
//! decoded events to the dispatcher channel. The stream auto-reconnects
//! with backoff; missed events are covered by the periodic refresh.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::client::transport::Transport;
use crate::protocol::EventRecord;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Background worker owning the event-stream connection.
pub struct EventSubscriber {
    transport: Arc<Transport>,
    sender: mpsc::UnboundedSender<EventRecord>,
}

impl EventSubscriber {
    pub fn spawn(
        transport: Arc<Transport>,
        sender: mpsc::UnboundedSender<EventRecord>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { transport, sender }.run())
    }

    async fn run(self) {
        let mut delay = RECONNECT_BASE;
        loop {
            if self.sender.is_closed() {
                return;
            }
            match self.transport.open_events().await {
                Ok(response) => {
                    debug!("event stream connected");
                    delay = RECONNECT_BASE;
                    if self.consume(response).await {
                        return;
                    }
                    warn!("event stream disconnected, reconnecting");
                }
                Err(err) => {
                    debug!(error = %err, "event stream connect failed");
                }
            }
            sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_CAP);
        }
    }

    /// Reads frames until the stream ends. Returns true when the
    /// receiving side went away and the worker should stop.
    async fn consume(&self, response: reqwest::Response) -> bool {
        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { return false };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = buf.find("\n\n") {
                let frame = buf[..end].to_string();
                buf.drain(..end + 2);
                for event in parse_frame(&frame) {
                    if self.sender.send(event).is_err() {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Extracts events from one SSE frame; comment lines are skipped.
pub(crate) fn parse_frame(frame: &str) -> Vec<EventRecord> {
    frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|payload| match serde_json::from_str::<EventRecord>(payload.trim()) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(error = %err, "discarding malformed event payload");
                None
            }
        })
        .collect()
}
