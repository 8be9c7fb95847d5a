//! HTTP request/response transport.
//!
//! Strictly request/response: each outbound JSON-RPC request becomes one
//! POST and its body parses into the matching response. No streaming. A
//! wire failure is surfaced to the correlator as a synthesized `-32000`
//! error response so the pending request resolves immediately instead of
//! waiting out its timeout.

use std::collections::HashMap;
use std::time::Duration;

use mcpr_protocol::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::TransportChannels;

/// Default per-call timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC over plain HTTP POST.
pub struct HttpTransport {
    url: String,
    shutdown: CancellationToken,
}

impl HttpTransport {
    /// Create a transport POSTing to `url` with the given extra headers.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Http`] if the HTTP client cannot be built
    /// (e.g. a header value is not valid).
    pub fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        request_timeout: Option<Duration>,
    ) -> TransportResult<(Self, TransportChannels)> {
        let client = build_client(headers, request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(post_loop(
            client,
            url.to_string(),
            outbound_rx,
            inbound_tx,
            shutdown.clone(),
        ));

        let transport = Self {
            url: url.to_string(),
            shutdown,
        };
        let channels = TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        Ok((transport, channels))
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop the transport; in-flight POSTs are abandoned.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

pub(crate) fn build_client(
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> TransportResult<reqwest::Client> {
    let mut header_map = HeaderMap::new();
    header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (key, value) in headers {
        // Invalid operator-supplied headers are skipped with a warning
        // rather than failing the whole transport.
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                header_map.insert(name, value);
            }
            _ => warn!(header = %key, "skipping invalid header"),
        }
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .timeout(timeout)
        .build()
        .map_err(TransportError::Http)
}

async fn post_loop(
    client: reqwest::Client,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    inbound: mpsc::UnboundedSender<JsonRpcMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match message {
            JsonRpcMessage::Request(request) => {
                let response = post_request(&client, &url, &request).await;
                if inbound.send(response.into()).is_err() {
                    break;
                }
            }
            JsonRpcMessage::Notification(note) => {
                // Notifications are not part of the HTTP profile; POST and
                // ignore whatever comes back.
                match client.post(&url).json(&note).send().await {
                    Ok(reply) => trace!(status = %reply.status(), "notification posted"),
                    Err(error) => debug!(%error, "notification post failed"),
                }
            }
            JsonRpcMessage::Response(_) => {
                warn!("dropping outbound response: http transport is client-only");
            }
        }
    }
    debug!(url, "http post loop stopped");
}

async fn post_request(
    client: &reqwest::Client,
    url: &str,
    request: &JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.id.clone();
    let result = async {
        let reply = client.post(url).json(request).send().await?;
        let status = reply.status();
        if !status.is_success() {
            return Ok::<_, TransportError>(JsonRpcResponse::error(
                id.clone(),
                JsonRpcError::new(
                    error_codes::TRANSPORT_ERROR,
                    format!("http status {status}"),
                ),
            ));
        }
        let body = reply.text().await?;
        let response: JsonRpcResponse = serde_json::from_str(&body)?;
        Ok(response)
    }
    .await;

    match result {
        Ok(response) => response,
        Err(error) => {
            debug!(%error, method = %request.method, "http round trip failed");
            JsonRpcResponse::error(
                id,
                JsonRpcError::new(error_codes::TRANSPORT_ERROR, error.to_string()),
            )
        }
    }
}
