//! # Broadcast Hub
//!
//! The hub owns the set of connected viewers and is the only writer to them.
//!
//! ```text
//!                      ┌────────────► viewer queue ──► WebSocket A
//! ServerFrame ──► Hub ─┼────────────► viewer queue ──► WebSocket B
//!                      └────────────► viewer queue ──► WebSocket C
//!
//! ViewerFrame ──► Hub ──► HostHandle ──► PTY host
//! ```
//!
//! Each viewer has a bounded queue drained by its own connection task, so a
//! stalled socket only ever blocks itself. A viewer whose queue is full or
//! closed counts as a failed write and is dropped from the set during the
//! same broadcast.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{ServerFrame, ViewerFrame, terminal_size};
use crate::host::HostHandle;

/// Unique identifier for a connected viewer.
pub type ViewerId = String;

/// A frame serialized once and shared by every viewer queue.
pub type Payload = Arc<str>;

/// Default number of frames a viewer may have in flight.
pub const DEFAULT_VIEWER_QUEUE: usize = 1024;

struct ViewerSlot {
    tx: mpsc::Sender<Payload>,
}

/// Registry of viewers plus the route back to the PTY host.
pub struct Hub {
    viewers: DashMap<ViewerId, ViewerSlot>,
    /// Set once the session is running, cleared on teardown.
    host: RwLock<Option<HostHandle>>,
    closed: AtomicBool,
    /// Cancelled once `close` has released the viewers.
    close_signal: CancellationToken,
    queue_capacity: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_VIEWER_QUEUE)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            viewers: DashMap::new(),
            host: RwLock::new(None),
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a new viewer.
    ///
    /// The viewer's queue starts with an empty `output` frame so the client
    /// knows the channel is live. Earlier output is not replayed. Returns
    /// `None` once the hub is closed.
    pub fn add_viewer(&self) -> Option<(ViewerId, mpsc::Receiver<Payload>)> {
        if self.is_closed() {
            return None;
        }

        let viewer_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        match encode(&ServerFrame::output("")) {
            Some(hello) => {
                let _ = tx.try_send(hello);
            }
            None => return None,
        }

        self.viewers.insert(viewer_id.clone(), ViewerSlot { tx });
        info!(
            "Viewer connected: {} (total viewers: {})",
            viewer_id,
            self.viewers.len()
        );

        Some((viewer_id, rx))
    }

    /// Unregisters a viewer. Unknown ids are ignored.
    pub fn remove_viewer(&self, viewer_id: &str) {
        if self.viewers.remove(viewer_id).is_some() {
            info!(
                "Viewer disconnected: {} (total viewers: {})",
                viewer_id,
                self.viewers.len()
            );
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the hub has been closed.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await;
    }

    /// Sends `frame` to every registered viewer.
    ///
    /// The frame is serialized once. Viewers whose queue rejects it are
    /// removed; delivery to the others is unaffected. Returns how many
    /// viewers accepted the frame.
    pub fn broadcast(&self, frame: &ServerFrame) -> usize {
        if self.is_closed() {
            debug!("Dropping frame broadcast after hub closed");
            return 0;
        }

        let Some(payload) = encode(frame) else {
            return 0;
        };

        let mut delivered = 0;
        self.viewers.retain(|viewer_id, slot| {
            match slot.tx.try_send(Arc::clone(&payload)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Viewer {} is not keeping up, disconnecting it", viewer_id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Viewer {} connection already closed", viewer_id);
                    false
                }
            }
        });

        delivered
    }

    /// Connects the hub to a running PTY host.
    pub async fn attach_host(&self, host: HostHandle) {
        let mut guard = self.host.write().await;
        *guard = Some(host);
        debug!("Attached PTY host to hub");
    }

    /// Applies a frame received from `viewer_id` to the session.
    ///
    /// Input is forwarded verbatim. Resize requests with unusable dimensions
    /// are dropped without telling the viewer. Frames arriving before the
    /// host is attached or after the hub is closed are discarded.
    pub async fn route_inbound(&self, viewer_id: &str, frame: ViewerFrame) {
        if self.is_closed() {
            debug!("Discarding frame from viewer {} after close", viewer_id);
            return;
        }

        let guard = self.host.read().await;
        let Some(host) = guard.as_ref() else {
            debug!("No PTY host attached, discarding frame from {}", viewer_id);
            return;
        };

        match frame {
            ViewerFrame::Input { data } => {
                debug!("Forwarding {} bytes of input from {}", data.len(), viewer_id);
                host.send_input(&data);
            }
            ViewerFrame::Resize { cols, rows } => match terminal_size(cols, rows) {
                Some((cols, rows)) => {
                    info!("Resize to {}x{} requested by {}", cols, rows, viewer_id);
                    host.send_resize(cols, rows);
                }
                None => debug!(
                    "Ignoring invalid resize {}x{} from {}",
                    cols, rows, viewer_id
                ),
            },
        }
    }

    /// Closes the hub: detaches the host and drops every viewer queue, which
    /// ends each viewer's connection once its queue drains. Connections still
    /// draining are cut off after a bounded delay, see [`Hub::closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.host.write().await.take();
        let count = self.viewers.len();
        self.viewers.clear();
        self.close_signal.cancel();
        info!("Hub closed, released {} viewers", count);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(frame: &ServerFrame) -> Option<Payload> {
    match frame.to_json() {
        Ok(json) => Some(Payload::from(json)),
        Err(e) => {
            warn!("Failed to serialize frame: {}", e);
            None
        }
    }
}
