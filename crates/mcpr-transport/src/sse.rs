//! SSE transport.
//!
//! A long-lived GET carries server-to-client JSON-RPC inside `data:` frames;
//! client-to-server messages go out through a paired HTTP POST endpoint
//! (announced by the server in an `endpoint` event, falling back to the SSE
//! URL itself). A dropped stream reconnects with exponential backoff up to a
//! bounded number of attempts, then the transport fails fatally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mcpr_protocol::JsonRpcMessage;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::http::build_client;
use crate::TransportChannels;

/// Reconnect tuning for the SSE stream.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Consecutive failed connects tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// JSON-RPC over a server-sent-events stream plus an HTTP POST back-channel.
pub struct SseTransport {
    url: String,
    shutdown: CancellationToken,
    failed: watch::Receiver<Option<String>>,
}

impl SseTransport {
    /// Connect to `url` and start the stream and post loops.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Http`] if the HTTP client cannot be built.
    pub fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        config: SseConfig,
    ) -> TransportResult<(Self, TransportChannels)> {
        let client = build_client(headers, Duration::from_secs(30))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let post_url = Arc::new(RwLock::new(url.to_string()));

        tokio::spawn(stream_loop(
            client.clone(),
            url.to_string(),
            config,
            inbound_tx,
            Arc::clone(&post_url),
            shutdown.clone(),
            failed_tx,
        ));
        tokio::spawn(post_back_loop(client, outbound_rx, post_url, shutdown.clone()));

        let transport = Self {
            url: url.to_string(),
            shutdown,
            failed: failed_rx,
        };
        let channels = TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        Ok((transport, channels))
    }

    /// SSE endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The fatal error message, once reconnects are exhausted.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failed.borrow().clone()
    }

    /// Stop both loops.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.url)
            .field("failed", &self.failure())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_lines)]
async fn stream_loop(
    client: reqwest::Client,
    url: String,
    config: SseConfig,
    inbound: mpsc::UnboundedSender<JsonRpcMessage>,
    post_url: Arc<RwLock<String>>,
    shutdown: CancellationToken,
    failed: watch::Sender<Option<String>>,
) {
    let mut attempts: u32 = 0;
    let mut backoff = config.initial_backoff;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let connect = client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await;

        match connect {
            Ok(response) if response.status().is_success() => {
                debug!(url, "sse stream connected");
                attempts = 0;
                backoff = config.initial_backoff;

                let mut parser = sse_parse::Parser::new();
                let mut stream = response.bytes_stream();
                loop {
                    let chunk = tokio::select! {
                        () = shutdown.cancelled() => return,
                        chunk = stream.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                                handle_event(&event, &inbound, &post_url, &url).await;
                            }
                        }
                        Some(Err(error)) => {
                            warn!(%error, "sse stream error, reconnecting");
                            break;
                        }
                        None => {
                            debug!("sse stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "sse connect rejected");
            }
            Err(error) => {
                warn!(%error, "sse connect failed");
            }
        }

        attempts += 1;
        if attempts > config.max_reconnect_attempts {
            let message = TransportError::ReconnectExhausted {
                attempts: attempts - 1,
            }
            .to_string();
            warn!(url, %message, "sse transport failed");
            let _ = failed.send(Some(message));
            // Dropping `inbound` here closes the stream for the correlator.
            return;
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

async fn handle_event(
    event: &sse_parse::Event,
    inbound: &mpsc::UnboundedSender<JsonRpcMessage>,
    post_url: &Arc<RwLock<String>>,
    base_url: &str,
) {
    match event.name.as_deref() {
        // Legacy MCP SSE servers announce where POSTs should go.
        Some("endpoint") => {
            let resolved = join_endpoint(base_url, event.data.trim());
            debug!(endpoint = %resolved, "sse endpoint announced");
            *post_url.write().await = resolved;
        }
        None | Some("message") => match JsonRpcMessage::from_str(event.data.trim()) {
            Ok(message) => {
                let _ = inbound.send(message);
            }
            Err(error) => {
                warn!(%error, "dropping malformed sse frame");
            }
        },
        Some(other) => trace!(event = other, "ignoring sse event"),
    }
}

async fn post_back_loop(
    client: reqwest::Client,
    mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    post_url: Arc<RwLock<String>>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => return,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };
        let url = post_url.read().await.clone();
        if let Err(error) = client.post(&url).json(&message).send().await {
            debug!(%error, "sse post-back failed");
        }
    }
}

/// Resolve a server-announced endpoint against the SSE base URL.
fn join_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    // Keep scheme://authority from the base, replace the path.
    let origin_end = base
        .find("://")
        .map(|i| i + 3)
        .and_then(|start| base[start..].find('/').map(|i| start + i))
        .unwrap_or(base.len());
    format!("{}{}", &base[..origin_end], endpoint)
}

/// Incremental parser for the SSE wire format.
pub mod sse_parse {
    /// One dispatched SSE event.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Event {
        /// `event:` field, if present.
        pub name: Option<String>,
        /// Concatenated `data:` lines.
        pub data: String,
    }

    /// Line-buffering SSE parser. Feed chunks, collect dispatched events.
    #[derive(Debug, Default)]
    pub struct Parser {
        buffer: String,
        event_name: Option<String>,
        data_lines: Vec<String>,
    }

    impl Parser {
        /// A fresh parser.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Feed a chunk; returns every event completed by it.
        pub fn feed(&mut self, chunk: &str) -> Vec<Event> {
            self.buffer.push_str(chunk);
            let mut events = Vec::new();

            while let Some(newline) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=newline).collect();
                let line = line.trim_end_matches(['\n', '\r']);

                if line.is_empty() {
                    if !self.data_lines.is_empty() {
                        events.push(Event {
                            name: self.event_name.take(),
                            data: self.data_lines.join("\n"),
                        });
                        self.data_lines.clear();
                    } else {
                        self.event_name = None;
                    }
                } else if let Some(rest) = line.strip_prefix("data:") {
                    self.data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                } else if let Some(rest) = line.strip_prefix("event:") {
                    self.event_name = Some(rest.trim().to_string());
                } else if line.starts_with(':') {
                    // Comment / keep-alive.
                } else {
                    // id:, retry:, and unknown fields are ignored.
                }
            }

            events
        }
    }

}
