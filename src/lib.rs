//! # webify - Terminal Session Bridge
//!
//! webify runs one interactive command (a shell, a REPL, any TUI) inside a
//! pseudo-terminal and lets any number of remote viewers watch and drive it
//! over WebSocket.
//!
//! ## Quick Start
//!
//! ```bash
//! webify --port 8080 -- bash
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use webify::{Bridge, BridgeConfig};
//! use webify::host::HostConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BridgeConfig {
//!     host: HostConfig::locate(None)?,
//!     ..BridgeConfig::default()
//! };
//! let bridge = Bridge::bind(config).await?;
//! println!("viewers connect to ws://{}/ws", bridge.local_addr());
//!
//! let reason = bridge
//!     .run(vec!["bash".to_string()], CancellationToken::new())
//!     .await?;
//! std::process::exit(reason.process_code());
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! child ◄──► PTY host ◄──JSON lines──► host::PtyHostClient
//!                                            │ bytes
//!                                            ▼
//!                                     codec::Utf8Decoder
//!                                            │ text
//!                                            ▼
//!            viewers ◄──WebSocket──► server ◄──► hub::Hub
//! ```
//!
//! - **[host]**: launches the PTY host and speaks its control protocol
//! - **[codec]**: incremental UTF-8 decoding of terminal output
//! - **[hub]**: the viewer set, fan-out and inbound routing
//! - **[session]**: the `Starting → Running → Exiting → Stopped` lifecycle
//! - **[server]**: the WebSocket endpoint viewers connect to
//! - **[pty_host]**: the PTY host binary's implementation

pub mod cli;
pub mod codec;
pub mod error;
pub mod frame;
pub mod host;
pub mod hub;
pub mod pty_host;
pub mod server;
pub mod session;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use error::{BridgeError, Result};
use host::{DEFAULT_HOST_BINARY, HostConfig};
use hub::{DEFAULT_VIEWER_QUEUE, Hub};
use server::ViewerServer;
use session::{DEFAULT_GRACE, Session, SessionContext, SessionState, StopReason};

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the viewer endpoint binds to.
    pub bind: String,
    /// Viewer endpoint port; 0 picks a free one.
    pub port: u16,
    /// How to launch the PTY host.
    pub host: HostConfig,
    /// Delay between the `exit` frame and closing viewers.
    pub grace: Duration,
    /// Frames a viewer may have queued before it is disconnected.
    pub viewer_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            host: HostConfig::new(DEFAULT_HOST_BINARY),
            grace: DEFAULT_GRACE,
            viewer_queue: DEFAULT_VIEWER_QUEUE,
        }
    }
}

/// A listening viewer endpoint waiting for its session.
///
/// Viewers may connect as soon as [`Bridge::bind`] returns; they see output
/// from the moment they connect.
pub struct Bridge {
    config: BridgeConfig,
    hub: Arc<Hub>,
    server: ViewerServer,
}

impl Bridge {
    /// Binds the viewer endpoint.
    pub async fn bind(config: BridgeConfig) -> Result<Self> {
        let hub = Arc::new(Hub::with_queue_capacity(config.viewer_queue));
        let addr = match config.bind.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, config.port).to_string(),
            Err(_) => format!("{}:{}", config.bind, config.port),
        };
        let server = ViewerServer::bind(&addr, Arc::clone(&hub)).await?;
        Ok(Self {
            config,
            hub,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Runs `command` as the bridge's one session.
    ///
    /// Cancelling `shutdown` forces a hard stop. Returns once the session is
    /// `Stopped` and the endpoint is closed.
    pub async fn run(self, command: Vec<String>, shutdown: CancellationToken) -> Result<StopReason> {
        self.run_watching(command, shutdown, |_| {}).await
    }

    /// Like [`Bridge::run`], handing the session's state receiver to
    /// `observe` before the session starts.
    pub async fn run_watching<F>(
        self,
        command: Vec<String>,
        shutdown: CancellationToken,
        observe: F,
    ) -> Result<StopReason>
    where
        F: FnOnce(watch::Receiver<SessionState>),
    {
        let session = Session::new(command);
        observe(session.subscribe());
        session
            .run(SessionContext {
                host: &self.config.host,
                hub: &self.hub,
                server: &self.server,
                grace: self.config.grace,
                shutdown: &shutdown,
            })
            .await
    }
}
