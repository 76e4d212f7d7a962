use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::messages::{build_logs_subscribe_msg, build_unsubscribe_msg, parse_rpc_frame, ParsedFrame};
use crate::chain::SubscriptionEvent;
use crate::config::{RECONNECT_BACKOFF_MS, WS_PING_INTERVAL_SECS};
use crate::error::{AppError, Result};

const SUBSCRIBE_REQUEST_ID: u64 = 1;
const UNSUBSCRIBE_REQUEST_ID: u64 = 2;

/// How a single connection ended.
enum ConnectionEnd {
    /// Cancelled or the consumer went away: stop for good.
    Shutdown,
    /// Server closed the socket: reconnect.
    Closed,
}

/// Owns one `eth_subscribe("logs")` WebSocket session and forwards each frame's
/// logs to the consumer as a batch. Reconnects with backoff until cancelled,
/// announcing every re-established subscription with
/// [`SubscriptionEvent::Reconnected`].
pub struct LogFeed {
    ws_url: String,
    address: Address,
    events: Vec<B256>,
    tx: mpsc::Sender<SubscriptionEvent>,
    cancel: CancellationToken,
    /// Total WS frames received (for flow diagnostics).
    frames_received: Arc<AtomicU64>,
    /// Total logs forwarded to the consumer.
    logs_forwarded: Arc<AtomicU64>,
}

impl LogFeed {
    pub fn new(
        ws_url: String,
        address: Address,
        events: Vec<B256>,
        tx: mpsc::Sender<SubscriptionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ws_url,
            address,
            events,
            tx,
            cancel,
            frames_received: Arc::new(AtomicU64::new(0)),
            logs_forwarded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run(self) {
        let mut backoff_idx = 0usize;
        let mut resumed = false;

        loop {
            info!("Log feed connecting to {}", self.ws_url);
            let end = self.connect_once(resumed).await;
            resumed = true;
            match end {
                Ok(ConnectionEnd::Shutdown) => {
                    info!(
                        frames = self.frames_received.load(Ordering::Relaxed),
                        logs = self.logs_forwarded.load(Ordering::Relaxed),
                        "Log feed stopped"
                    );
                    return;
                }
                Ok(ConnectionEnd::Closed) => {
                    info!("Log feed connection closed by server");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("Log feed connection error: {e}");
                }
            }

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .copied()
                .unwrap_or(RECONNECT_BACKOFF_MS[RECONNECT_BACKOFF_MS.len() - 1]);
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len() - 1);

            warn!("Log feed reconnecting in {delay_ms}ms");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
    }

    async fn connect_once(&self, resumed: bool) -> Result<ConnectionEnd> {
        let (ws_stream, _) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(ConnectionEnd::Shutdown),
            conn = connect_async(&self.ws_url) => conn?,
        };
        let (mut write, mut read) = ws_stream.split();

        let sub_msg = build_logs_subscribe_msg(SUBSCRIBE_REQUEST_ID, self.address, &self.events);
        write.send(Message::Text(sub_msg.into())).await?;

        let mut subscription_id: Option<String> = None;
        let mut ping_interval = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping_interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Some(id) = &subscription_id {
                        let unsub = build_unsubscribe_msg(UNSUBSCRIBE_REQUEST_ID, id);
                        let _ = write.send(Message::Text(unsub.into())).await;
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionEnd::Shutdown);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let was_subscribed = subscription_id.is_some();
                            let batch = self.handle_frame(&text, &mut subscription_id)?;
                            if resumed
                                && !was_subscribed
                                && subscription_id.is_some()
                                && !self.forward(SubscriptionEvent::Reconnected).await
                            {
                                return Ok(ConnectionEnd::Shutdown);
                            }
                            if !batch.is_empty() && !self.forward(SubscriptionEvent::Logs(batch)).await {
                                return Ok(ConnectionEnd::Shutdown);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(ConnectionEnd::Closed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("Log feed ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }
            }
        }
    }

    /// Extract the logs carried by one frame. Errors from the node end the
    /// connection so it is re-established with a fresh subscription.
    fn handle_frame(&self, text: &str, subscription_id: &mut Option<String>) -> Result<Vec<Log>> {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let mut batch = Vec::new();
        for frame in parse_rpc_frame(text) {
            match frame {
                ParsedFrame::Subscribed { subscription } => {
                    info!(subscription = %subscription, events = self.events.len(), "Log feed subscribed");
                    *subscription_id = Some(subscription);
                }
                ParsedFrame::Log { subscription, log } => {
                    if subscription_id.as_deref() == Some(subscription.as_str()) {
                        batch.push(*log);
                    } else {
                        debug!(subscription = %subscription, "Log for unknown subscription ignored");
                    }
                }
                ParsedFrame::Removed { log, .. } => {
                    warn!(
                        block = ?log.block_number,
                        tx = ?log.transaction_hash,
                        "Log retracted by reorg; cached data for it is kept"
                    );
                }
                ParsedFrame::Error(e) => {
                    return Err(AppError::SubscriptionClosed(format!(
                        "node returned error {}: {}",
                        e.code, e.message
                    )));
                }
            }
        }
        Ok(batch)
    }

    /// Hand an event to the consumer, waiting for buffer space. Returns false if
    /// the consumer is gone or the feed was cancelled meanwhile.
    async fn forward(&self, event: SubscriptionEvent) -> bool {
        let len = match &event {
            SubscriptionEvent::Logs(batch) => batch.len() as u64,
            SubscriptionEvent::Reconnected => 0,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => {
                if sent.is_ok() {
                    self.logs_forwarded.fetch_add(len, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }
}
