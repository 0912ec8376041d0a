//! # PTY Host Protocol Client
//!
//! The bridge never touches a pseudo-terminal itself. It launches a PTY host
//! subprocess (`webify-pty-host -- <command>...`) and speaks newline-delimited
//! JSON with it over the host's standard streams.
//!
//! ## Tasks
//!
//! ```text
//!               ┌──────────────┐ stdin  ┌────────────┐
//! HostHandle ──►│ writer task  │───────►│            │
//!               └──────────────┘        │            │
//!               ┌──────────────┐ stdout │  PTY host  │
//! HostEvent ◄───│ read loop    │◄───────│ subprocess │
//!               └──────────────┘        │            │
//!               ┌──────────────┐ stderr │            │
//!   tracing ◄───│ stderr relay │◄───────│            │
//!               └──────────────┘        └────────────┘
//!               ┌──────────────┐              ▲
//!               │ waiter task  │──── kill ────┘
//!               └──────────────┘
//! ```
//!
//! The read loop emits exactly one [`HostEvent::Exit`], either when the host
//! reports the child's exit or when its stdout ends, and then stops.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{BridgeError, Result};
use crate::frame::{ExitStatus, HostCommand, HostMessage};

/// File name of the bundled PTY host binary.
pub const DEFAULT_HOST_BINARY: &str = "webify-pty-host";

/// Token separating host options from the target command.
const COMMAND_SEPARATOR: &str = "--";

/// Capacity of the host event channel. A full channel stops the read loop,
/// which in turn stops draining the host's stdout.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the command queue towards the host's stdin. Commands that do
/// not fit are dropped.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for the host's own exit status after its stdout ends.
const HOST_EXIT_WAIT: Duration = Duration::from_secs(2);

/// Event produced by the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Raw bytes read from the PTY.
    Output(Vec<u8>),
    /// The child exited or the host went away.
    Exit(ExitStatus),
}

/// How to launch the PTY host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Host executable.
    pub program: PathBuf,
    /// Arguments placed before the command separator.
    pub args: Vec<String>,
}

impl HostConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Resolves the host executable.
    ///
    /// An explicit path wins. Otherwise the bundled host is looked up next to
    /// the running executable, then on `PATH`.
    pub fn locate(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(program) = explicit {
            return Ok(Self::new(program));
        }

        if let Some(sibling) = sibling_host_binary() {
            return Ok(Self::new(sibling));
        }

        which::which(DEFAULT_HOST_BINARY)
            .map(Self::new)
            .map_err(|_| BridgeError::HostNotFound(DEFAULT_HOST_BINARY.to_string()))
    }
}

fn sibling_host_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe
        .parent()?
        .join(DEFAULT_HOST_BINARY)
        .with_extension(std::env::consts::EXE_EXTENSION);
    candidate.is_file().then_some(candidate)
}

/// Cloneable handle used to drive a running PTY host.
///
/// Every method is best-effort and never blocks. Commands are dropped once
/// the host is gone, or while its stdin is backed up and the queue is full.
#[derive(Debug, Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<HostCommand>,
    cancel: CancellationToken,
}

impl HostHandle {
    /// Forwards keystrokes to the PTY. Returns whether they were queued.
    pub fn send_input(&self, text: &str) -> bool {
        self.enqueue(HostCommand::Input {
            data: codec::encode_input(text),
        })
    }

    /// Requests a new PTY size. Callers validate the dimensions.
    pub fn send_resize(&self, cols: u16, rows: u16) -> bool {
        self.enqueue(HostCommand::Resize { cols, rows })
    }

    fn enqueue(&self, command: HostCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("PTY host is not reading its input, dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Requests termination of the host and its child.
    ///
    /// Idempotent, and safe after the host has already exited.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Stopping PTY host");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A running PTY host subprocess.
pub struct PtyHostClient {
    handle: HostHandle,
}

impl PtyHostClient {
    /// Launches the host with `command` after the separator token.
    ///
    /// Returns the client and the receiver for its events. The read loop is
    /// already running when this returns.
    pub fn start(
        config: &HostConfig,
        command: &[String],
    ) -> Result<(Self, mpsc::Receiver<HostEvent>)> {
        let program = config.program.display().to_string();

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .arg(COMMAND_SEPARATOR)
            .args(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BridgeError::Spawn {
                program,
                source: std::io::Error::other("PTY host stdio was not captured"),
            });
        };

        info!(
            "Started PTY host {} (pid: {:?}) for command: {:?}",
            program,
            child.id(),
            command
        );

        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = oneshot::channel();

        tokio::spawn(write_commands(stdin, commands_rx, cancel.clone()));
        tokio::spawn(read_host_output(stdout, events_tx, status_rx));
        tokio::spawn(relay_stderr(stderr));
        tokio::spawn(wait_for_host(child, cancel.clone(), status_tx));

        let client = PtyHostClient {
            handle: HostHandle {
                commands: commands_tx,
                cancel,
            },
        };

        Ok((client, events_rx))
    }

    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    pub fn send_input(&self, text: &str) -> bool {
        self.handle.send_input(text)
    }

    pub fn send_resize(&self, cols: u16, rows: u16) -> bool {
        self.handle.send_resize(cols, rows)
    }

    pub fn stop(&self) {
        self.handle.stop();
    }
}

impl Drop for PtyHostClient {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

async fn write_commands(
    mut stdin: ChildStdin,
    mut commands: mpsc::Receiver<HostCommand>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let mut line = match serde_json::to_vec(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode PTY host command: {}", e);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = write_line(&mut stdin, &line).await {
            debug!("PTY host stdin closed, dropping further commands: {}", e);
            break;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

async fn read_host_output(
    stdout: ChildStdout,
    events: mpsc::Sender<HostEvent>,
    host_status: oneshot::Receiver<std::process::ExitStatus>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read from PTY host: {}", e);
                break;
            }
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_slice::<HostMessage>(trimmed) {
            Ok(HostMessage::Output { data }) => match codec::decode_payload(&data) {
                Ok(bytes) => {
                    if events.send(HostEvent::Output(bytes)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Discarding PTY host output: {}", e),
            },
            Ok(HostMessage::Exit { code, signal }) => {
                info!(
                    "PTY host reported exit (code: {:?}, signal: {:?})",
                    code, signal
                );
                let _ = events
                    .send(HostEvent::Exit(ExitStatus { code, signal }))
                    .await;
                return;
            }
            Err(e) => warn!(
                "Discarding malformed line from PTY host: {} ({})",
                String::from_utf8_lossy(trimmed),
                e
            ),
        }
    }

    warn!("PTY host output ended without an exit message");
    let status = match tokio::time::timeout(HOST_EXIT_WAIT, host_status).await {
        Ok(Ok(status)) => ExitStatus::from(status),
        _ => ExitStatus::default(),
    };
    let _ = events.send(HostEvent::Exit(status)).await;
}

async fn relay_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!("pty-host: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("PTY host stderr unreadable: {}", e);
                break;
            }
        }
    }
}

async fn wait_for_host(
    mut child: Child,
    cancel: CancellationToken,
    status_tx: oneshot::Sender<std::process::ExitStatus>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!("PTY host already gone: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            debug!("PTY host process exited: {}", status);
            let _ = status_tx.send(status);
        }
        Err(e) => warn!("Failed to wait for PTY host: {}", e),
    }
}
