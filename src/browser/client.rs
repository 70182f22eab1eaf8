//! Connection to Chrome's DevTools websocket endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

use super::error::BrowserError;
use super::page::CdpSession;
use super::protocol::{BrowserVersion, CdpRequest, CdpResponse};
use super::{BrowserHost, BrowserSession};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingCall {
    tx: oneshot::Sender<Result<Value, BrowserError>>,
}

/// Shared command channel over the browser websocket. Cloned into every
/// session so browser-scoped and session-scoped commands interleave on one
/// connection with one id space.
#[derive(Clone)]
pub(crate) struct Channel {
    ws_tx: Arc<tokio::sync::Mutex<WsSink>>,
    request_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, PendingCall>>>,
}

impl Channel {
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, BrowserError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = CdpRequest {
            id,
            method: method.to_string(),
            params,
            session_id: session_id.map(|s| s.to_string()),
        };

        let body = serde_json::to_string(&request)?;
        trace!(target: "talos.browser", "cdp send: {}", body);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingCall { tx });

        {
            let mut ws = self.ws_tx.lock().await;
            ws.send(Message::Text(body.into())).await?;
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrowserError::SessionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(BrowserError::Timeout(format!("{} timed out", method)))
            }
        }
    }
}

/// Handle to a running Chrome instance. One per worker process; each job
/// gets its own isolated browser context through [`BrowserHost::new_session`].
pub struct Browser {
    channel: Channel,
    nav_timeout: Duration,
    op_timeout: Duration,
    _recv_task: tokio::task::JoinHandle<()>,
}

impl Browser {
    /// Connect to Chrome at the given debugging endpoint, e.g.
    /// `http://localhost:9222`.
    pub async fn connect(endpoint: &str) -> Result<Self, BrowserError> {
        let http_endpoint = endpoint.trim_end_matches('/').to_string();
        let version_url = format!("{}/json/version", http_endpoint);
        debug!(target: "talos.browser", "fetching browser version from {}", version_url);

        let version: BrowserVersion = reqwest::get(&version_url)
            .await
            .map_err(|e| BrowserError::ChromeNotAvailable(format!("{}: {}", endpoint, e)))?
            .json()
            .await
            .map_err(|e| BrowserError::ChromeNotAvailable(format!("{}: {}", endpoint, e)))?;

        debug!(
            target: "talos.browser",
            "connected to {} ({})",
            version.browser,
            version.user_agent
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(&version.web_socket_debugger_url)
            .await
            .map_err(|e| BrowserError::ConnectionFailed(format!("websocket: {}", e)))?;

        let (ws_sink, ws_source) = ws_stream.split();
        let pending: Arc<Mutex<HashMap<u64, PendingCall>>> = Arc::new(Mutex::new(HashMap::new()));

        let recv_task = {
            let pending = pending.clone();
            tokio::spawn(async move {
                receive_loop(ws_source, pending).await;
            })
        };

        Ok(Self {
            channel: Channel {
                ws_tx: Arc::new(tokio::sync::Mutex::new(ws_sink)),
                request_id: Arc::new(AtomicU64::new(1)),
                pending,
            },
            nav_timeout: duration_from_env("NAV_TIMEOUT_SECS", 30),
            op_timeout: duration_from_env("PAGE_OP_TIMEOUT_SECS", 10),
            _recv_task: recv_task,
        })
    }
}

#[async_trait]
impl BrowserHost for Browser {
    async fn new_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let created = self
            .channel
            .call("Target.createBrowserContext", Some(json!({})), None)
            .await?;
        let context_id = created["browserContextId"]
            .as_str()
            .ok_or_else(|| BrowserError::InvalidResponse("missing browserContextId".to_string()))?
            .to_string();

        let target = self
            .channel
            .call(
                "Target.createTarget",
                Some(json!({
                    "url": "about:blank",
                    "browserContextId": context_id,
                })),
                None,
            )
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .ok_or_else(|| BrowserError::InvalidResponse("missing targetId".to_string()))?
            .to_string();

        let attached = self
            .channel
            .call(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true,
                })),
                None,
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::InvalidResponse("missing sessionId".to_string()))?
            .to_string();

        let session = CdpSession::new(
            self.channel.clone(),
            context_id,
            target_id,
            session_id,
            self.nav_timeout,
            self.op_timeout,
        );
        session.enable_domains().await?;

        debug!(
            target: "talos.browser",
            context_id = %session.context_id(),
            "created isolated browser context"
        );
        Ok(Box::new(session))
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self._recv_task.abort();
    }
}

async fn receive_loop(mut ws_source: WsSource, pending: Arc<Mutex<HashMap<u64, PendingCall>>>) {
    while let Some(msg) = ws_source.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                trace!(target: "talos.browser", "cdp recv: {}", text);
                match serde_json::from_str::<CdpResponse>(&text) {
                    Ok(resp) => {
                        if let Some(id) = resp.id {
                            let waiting = pending.lock().remove(&id);
                            if let Some(call) = waiting {
                                let result = if let Some(error) = resp.error {
                                    Err(BrowserError::Protocol {
                                        code: error.code,
                                        message: error.message,
                                    })
                                } else {
                                    Ok(resp.result.unwrap_or(Value::Null))
                                };
                                let _ = call.tx.send(result);
                            }
                        } else if let Some(method) = resp.method {
                            // Events are unused; navigation is observed by
                            // polling document.readyState instead.
                            trace!(target: "talos.browser", "cdp event: {}", method);
                        }
                    }
                    Err(e) => {
                        warn!(target: "talos.browser", "unparseable cdp message: {}", e);
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!(target: "talos.browser", "websocket closed");
                break;
            }
            Err(e) => {
                error!(target: "talos.browser", "websocket error: {}", e);
                break;
            }
            _ => {}
        }
    }
}

fn duration_from_env(var: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
