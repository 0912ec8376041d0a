//! # Viewer Transport
//!
//! Accepts viewer connections over WebSocket and plugs them into the
//! [`Hub`]. The hub never sees a socket: each connection is driven by
//! [`serve_viewer`] through the [`ViewerTransport`] trait.
//!
//! ## Endpoints
//!
//! - `GET /` - plain-text pointer to the viewer endpoint
//! - `WS /ws` - viewer connection
//!
//! ## Connection loop
//!
//! ```text
//!            ┌──────────── serve_viewer ─────────────┐
//! hub queue ─┼─► transport.send(frame)               │
//!            │                                       │
//! socket ────┼─► transport.recv() ─► ViewerFrame ────┼─► hub.route_inbound
//!            └───────────────────────────────────────┘
//! ```
//!
//! A malformed inbound message is logged and skipped; the connection stays
//! open. The loop ends when the viewer disconnects, a write fails, or the hub
//! drops the viewer's queue.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::frame::ViewerFrame;
use crate::hub::Hub;

/// Path viewers connect to.
pub const VIEWER_PATH: &str = "/ws";

/// How long shutdown waits for the accept loop to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a viewer may keep draining its queue after the hub closes.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on the closing handshake with a viewer.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A bidirectional message channel to one viewer.
///
/// `recv` must be cancel-safe: [`serve_viewer`] polls it alongside the
/// viewer's outbound queue.
pub trait ViewerTransport: Send {
    /// Sends one serialized frame.
    fn send(&mut self, text: &str) -> impl Future<Output = Result<()>> + Send;

    /// Receives the next text message, or `None` once the viewer is gone.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String>>> + Send;

    /// Closes the connection. Errors are ignored.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// [`ViewerTransport`] over an upgraded axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl ViewerTransport for WsTransport {
    async fn send(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| BridgeError::TransportWrite(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    return Some(
                        String::from_utf8(data.to_vec())
                            .map_err(|e| BridgeError::Parse(e.to_string())),
                    );
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(BridgeError::TransportWrite(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
        let _ = self.socket.close().await;
    }
}

/// Drives one viewer connection until it ends, then unregisters it.
pub async fn serve_viewer<T: ViewerTransport>(hub: Arc<Hub>, mut transport: T) {
    let Some((viewer_id, mut outbound)) = hub.add_viewer() else {
        debug!("Hub closed, refusing viewer");
        transport.close().await;
        return;
    };

    let drain_expired = drain_deadline(&hub);
    tokio::pin!(drain_expired);

    loop {
        tokio::select! {
            _ = &mut drain_expired => {
                warn!("Viewer {} did not drain after close, dropping it", viewer_id);
                break;
            }
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    debug!("Queue for viewer {} closed", viewer_id);
                    break;
                };
                let sent = tokio::select! {
                    result = transport.send(&payload) => result,
                    _ = &mut drain_expired => Err(BridgeError::TransportClosed),
                };
                if let Err(e) = sent {
                    warn!("Failed to write to viewer {}: {}", viewer_id, e);
                    break;
                }
            }
            message = transport.recv() => {
                match message {
                    Some(Ok(text)) => match ViewerFrame::parse(&text) {
                        Ok(frame) => hub.route_inbound(&viewer_id, frame).await,
                        Err(e) => warn!("Ignoring malformed message from viewer {}: {}", viewer_id, e),
                    },
                    Some(Err(BridgeError::Parse(e))) => {
                        warn!("Ignoring undecodable message from viewer {}: {}", viewer_id, e);
                    }
                    Some(Err(e)) => {
                        warn!("Connection error for viewer {}: {}", viewer_id, e);
                        break;
                    }
                    None => {
                        debug!("Viewer {} closed the connection", viewer_id);
                        break;
                    }
                }
            }
        }
    }

    hub.remove_viewer(&viewer_id);
    if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close())
        .await
        .is_err()
    {
        debug!("Closing handshake with viewer {} timed out", viewer_id);
    }
}

/// Completes a fixed delay after the hub closes.
async fn drain_deadline(hub: &Hub) {
    hub.closed().await;
    tokio::time::sleep(CLOSE_DRAIN_TIMEOUT).await;
}

/// The listening viewer endpoint.
pub struct ViewerServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ViewerServer {
    /// Binds `addr` and starts accepting viewers in the background.
    pub async fn bind(addr: &str, hub: Arc<Hub>) -> Result<Self> {
        let listener =
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|source| BridgeError::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
        let local_addr = listener.local_addr().map_err(|source| BridgeError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let app = Router::new()
            .route("/", get(index))
            .route(VIEWER_PATH, get(handle_viewer_ws))
            .with_state(hub);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
            {
                error!("Viewer server error: {:?}", e);
            }
        });

        info!("Viewer endpoint listening on ws://{}{}", local_addr, VIEWER_PATH);

        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!("Viewer server did not stop in time");
        }
        info!("Viewer endpoint closed");
    }
}

async fn index() -> &'static str {
    "webify: connect a terminal viewer to the /ws WebSocket endpoint\n"
}

async fn handle_viewer_ws(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    if hub.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| serve_viewer(hub, WsTransport::new(socket)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ServerFrame;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// In-memory transport fed from a script of inbound messages.
    struct ScriptedTransport {
        inbound: VecDeque<Option<Result<String>>>,
        hold_open: Option<mpsc::Receiver<()>>,
        sent: mpsc::UnboundedSender<String>,
        fail_writes: bool,
        stall_writes: bool,
    }

    impl ViewerTransport for ScriptedTransport {
        async fn send(&mut self, text: &str) -> Result<()> {
            if self.fail_writes {
                return Err(BridgeError::TransportWrite("broken pipe".to_string()));
            }
            if self.stall_writes {
                std::future::pending::<()>().await;
            }
            let _ = self.sent.send(text.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            if let Some(next) = self.inbound.pop_front() {
                return next;
            }
            match self.hold_open.as_mut() {
                Some(rx) => {
                    rx.recv().await;
                    None
                }
                None => None,
            }
        }

        async fn close(&mut self) {}
    }

    fn scripted(
        inbound: Vec<Option<Result<String>>>,
    ) -> (ScriptedTransport, mpsc::UnboundedReceiver<String>, mpsc::Sender<()>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (hold_tx, hold_rx) = mpsc::channel(1);
        let transport = ScriptedTransport {
            inbound: inbound.into(),
            hold_open: Some(hold_rx),
            sent: sent_tx,
            fail_writes: false,
            stall_writes: false,
        };
        (transport, sent_rx, hold_tx)
    }

    async fn wait_for_viewers(hub: &Hub, count: usize) {
        for _ in 0..100 {
            if hub.viewer_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} viewers, have {}", hub.viewer_count());
    }

    #[tokio::test]
    async fn test_malformed_messages_keep_connection_open() {
        let hub = Arc::new(Hub::new());
        let (transport, mut sent, _hold) = scripted(vec![
            Some(Ok("not json".to_string())),
            Some(Err(BridgeError::Parse("invalid utf-8".to_string()))),
            Some(Ok(r#"{"type":"resize","cols":"wide"}"#.to_string())),
        ]);

        let task = tokio::spawn(serve_viewer(Arc::clone(&hub), transport));
        wait_for_viewers(&hub, 1).await;

        hub.broadcast(&ServerFrame::output("still here"));
        assert_eq!(sent.recv().await.unwrap(), r#"{"type":"output","data":""}"#);
        assert_eq!(
            sent.recv().await.unwrap(),
            r#"{"type":"output","data":"still here"}"#
        );
        assert_eq!(hub.viewer_count(), 1);

        hub.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_viewer_close_unregisters() {
        let hub = Arc::new(Hub::new());
        let (mut transport, _sent, _hold) = scripted(vec![None]);
        transport.hold_open = None;

        serve_viewer(Arc::clone(&hub), transport).await;
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_unregisters_viewer() {
        let hub = Arc::new(Hub::new());
        let (mut transport, _sent, _hold) = scripted(vec![]);
        transport.fail_writes = true;

        serve_viewer(Arc::clone(&hub), transport).await;
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_viewer_is_cut_off_after_close() {
        let hub = Arc::new(Hub::new());
        let (mut transport, _sent, _hold) = scripted(vec![]);
        transport.stall_writes = true;

        let task = tokio::spawn(serve_viewer(Arc::clone(&hub), transport));
        wait_for_viewers(&hub, 1).await;
        hub.broadcast(&ServerFrame::output("never read"));

        hub.close().await;
        tokio::time::timeout(CLOSE_DRAIN_TIMEOUT * 3, task)
            .await
            .expect("stalled viewer outlived the hub")
            .unwrap();
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_hub_refuses_viewer() {
        let hub = Arc::new(Hub::new());
        hub.close().await;
        let (transport, mut sent, _hold) = scripted(vec![]);

        serve_viewer(Arc::clone(&hub), transport).await;
        assert!(sent.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_reports_address_and_shuts_down_twice() {
        let hub = Arc::new(Hub::new());
        let server = ViewerServer::bind("127.0.0.1:0", hub).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);

        server.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let hub = Arc::new(Hub::new());
        let first = ViewerServer::bind("127.0.0.1:0", Arc::clone(&hub))
            .await
            .unwrap();
        let addr = first.local_addr().to_string();

        let err = ViewerServer::bind(&addr, hub).await.err().unwrap();
        assert!(matches!(err, BridgeError::Bind { .. }));
        first.shutdown().await;
    }
}
