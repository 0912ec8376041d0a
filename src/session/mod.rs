//! # Session Lifecycle
//!
//! One session is one run of the target command. Its state only moves
//! forward:
//!
//! ```text
//! Starting ──spawn ok──► Running ──exit / host EOF──► Exiting ──grace──► Stopped
//!     │                     │                            │
//!     └──spawn error────────┴───────shutdown signal──────┴──────────────► Stopped
//! ```
//!
//! Entering `Exiting` flushes the output decoder, broadcasts the remaining
//! text, then broadcasts the single `exit` frame. Viewers keep their
//! connections for a grace delay so those frames can reach them. A shutdown
//! signal skips all of that and stops immediately.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::Utf8Decoder;
use crate::error::Result;
use crate::frame::{ExitStatus, ServerFrame};
use crate::host::{HostConfig, HostEvent, PtyHostClient};
use crate::hub::Hub;
use crate::server::ViewerServer;

/// Default delay between the `exit` frame and closing viewer connections.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Starting,
    Running,
    Exiting,
    Stopped,
}

/// Why a session reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The child exited (or the host went away) and the drain completed.
    ChildExit(ExitStatus),
    /// A shutdown signal forced a hard stop.
    Shutdown,
}

impl StopReason {
    /// Exit code for the bridge process.
    pub fn process_code(&self) -> i32 {
        match self {
            StopReason::ChildExit(status) => status.process_code(),
            StopReason::Shutdown => 130,
        }
    }
}

/// Everything the lifecycle touches besides the session itself.
pub struct SessionContext<'a> {
    pub host: &'a HostConfig,
    pub hub: &'a Hub,
    pub server: &'a ViewerServer,
    pub grace: Duration,
    pub shutdown: &'a CancellationToken,
}

/// One run of the target command.
pub struct Session {
    command: Vec<String>,
    state: watch::Sender<SessionState>,
    exit: OnceLock<ExitStatus>,
}

impl Session {
    pub fn new(command: Vec<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            command,
            state,
            exit: OnceLock::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The child's exit status, once known.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get().copied()
    }

    fn transition(&self, next: SessionState) {
        let moved = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!("Session state: {:?}", next);
        }
    }

    /// Runs the session to completion.
    ///
    /// Returns an error only when the PTY host cannot be started; the session
    /// is then `Stopped` without an `Exiting` phase.
    pub async fn run(&self, ctx: SessionContext<'_>) -> Result<StopReason> {
        let (client, mut events) = match PtyHostClient::start(ctx.host, &self.command) {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start session: {}", e);
                self.teardown(None, &ctx).await;
                return Err(e);
            }
        };

        self.transition(SessionState::Running);
        ctx.hub.attach_host(client.handle()).await;

        let mut decoder = Utf8Decoder::new();
        let status = loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping session immediately");
                    self.teardown(Some(&client), &ctx).await;
                    return Ok(StopReason::Shutdown);
                }
                event = events.recv() => match event {
                    Some(HostEvent::Output(bytes)) => {
                        let text = decoder.decode(&bytes);
                        if !text.is_empty() {
                            ctx.hub.broadcast(&ServerFrame::output(text));
                        }
                    }
                    Some(HostEvent::Exit(status)) => break status,
                    None => break ExitStatus::default(),
                },
            }
        };

        self.transition(SessionState::Exiting);
        let _ = self.exit.set(status);

        let tail = decoder.finish();
        if !tail.is_empty() {
            ctx.hub.broadcast(&ServerFrame::output(tail));
        }
        let viewers = ctx.hub.broadcast(&ServerFrame::exit(status));
        info!(
            "Command exited (code: {:?}, signal: {:?}), notified {} viewers",
            status.code, status.signal, viewers
        );

        tokio::select! {
            _ = tokio::time::sleep(ctx.grace) => {}
            _ = ctx.shutdown.cancelled() => {
                debug!("Shutdown requested during grace delay");
            }
        }

        self.teardown(Some(&client), &ctx).await;
        Ok(StopReason::ChildExit(status))
    }

    async fn teardown(&self, client: Option<&PtyHostClient>, ctx: &SessionContext<'_>) {
        if let Some(client) = client {
            client.stop();
        }
        ctx.hub.close().await;
        ctx.server.shutdown().await;
        self.transition(SessionState::Stopped);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::hub::Payload;

    fn script_host(script: &str) -> HostConfig {
        HostConfig::new("/bin/sh").with_args(["-c", script, "fake-host"])
    }

    async fn drain(mut rx: mpsc::Receiver<Payload>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            frames.push(payload.to_string());
        }
        frames
    }

    struct Fixture {
        hub: Arc<Hub>,
        server: ViewerServer,
        shutdown: CancellationToken,
    }

    impl Fixture {
        async fn new() -> Self {
            let hub = Arc::new(Hub::new());
            let server = ViewerServer::bind("127.0.0.1:0", Arc::clone(&hub))
                .await
                .unwrap();
            Self {
                hub,
                server,
                shutdown: CancellationToken::new(),
            }
        }

        fn ctx<'a>(&'a self, host: &'a HostConfig) -> SessionContext<'a> {
            SessionContext {
                host,
                hub: &self.hub,
                server: &self.server,
                grace: Duration::from_millis(20),
                shutdown: &self.shutdown,
            }
        }
    }

    #[tokio::test]
    async fn test_split_character_flushed_before_exit() {
        // "é" = C3 A9, sent as two output messages, plus a dangling E2 82.
        let host = script_host(
            r#"echo '{"type":"output","data":"YcM="}'
               echo '{"type":"output","data":"qQ=="}'
               echo '{"type":"output","data":"4oI="}'
               echo '{"type":"exit","code":0,"signal":null}'"#,
        );
        let fixture = Fixture::new().await;
        let (_, rx) = fixture.hub.add_viewer().unwrap();

        let session = Session::new(vec!["true".to_string()]);
        let reason = session.run(fixture.ctx(&host)).await.unwrap();

        assert_eq!(
            reason,
            StopReason::ChildExit(ExitStatus {
                code: Some(0),
                signal: None
            })
        );
        assert_eq!(
            drain(rx).await,
            vec![
                r#"{"type":"output","data":""}"#,
                r#"{"type":"output","data":"a"}"#,
                r#"{"type":"output","data":"é"}"#,
                "{\"type\":\"output\",\"data\":\"\u{FFFD}\"}",
                r#"{"type":"exit","code":0}"#,
            ]
        );
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.exit_status().unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn test_host_eof_yields_single_exit_frame() {
        let host = script_host(r#"echo '{"type":"output","data":"aGkK"}'; exit 3"#);
        let fixture = Fixture::new().await;
        let (_, rx) = fixture.hub.add_viewer().unwrap();

        let session = Session::new(vec!["true".to_string()]);
        let reason = session.run(fixture.ctx(&host)).await.unwrap();

        assert_eq!(reason.process_code(), 3);
        let frames = drain(rx).await;
        let exits: Vec<_> = frames.iter().filter(|f| f.contains("\"exit\"")).collect();
        assert_eq!(exits, vec![r#"{"type":"exit","code":3}"#]);
        assert!(frames.last().unwrap().contains("\"exit\""));
    }

    #[tokio::test]
    async fn test_spawn_failure_goes_straight_to_stopped() {
        let host = HostConfig::new("/no/such/pty-host");
        let fixture = Fixture::new().await;
        let session = Session::new(vec!["true".to_string()]);
        let mut states = session.subscribe();

        let err = session.run(fixture.ctx(&host)).await.unwrap_err();

        assert!(err.is_spawn());
        assert_eq!(*states.borrow_and_update(), SessionState::Stopped);
        assert!(session.exit_status().is_none());
        assert!(fixture.hub.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_is_hard_stop_without_exit_frame() {
        let host = script_host(r#"echo '{"type":"output","data":"aGkK"}'; exec sleep 30"#);
        let fixture = Fixture::new().await;
        let (_, rx) = fixture.hub.add_viewer().unwrap();
        let session = Session::new(vec!["true".to_string()]);

        let shutdown = fixture.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.cancel();
        });

        let reason = session.run(fixture.ctx(&host)).await.unwrap();

        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(reason.process_code(), 130);
        assert_eq!(session.state(), SessionState::Stopped);
        let frames = drain(rx).await;
        assert!(frames.iter().all(|f| !f.contains("\"exit\"")));
    }

    #[test]
    fn test_states_only_move_forward() {
        let session = Session::new(vec![]);
        session.transition(SessionState::Exiting);
        session.transition(SessionState::Running);
        assert_eq!(session.state(), SessionState::Exiting);
        session.transition(SessionState::Stopped);
        session.transition(SessionState::Starting);
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
