//! # PTY Host
//!
//! The `webify-pty-host` side of the control protocol. It owns the real
//! pseudo-terminal and the child process, and turns them into
//! newline-delimited JSON on its own standard streams:
//!
//! ```text
//! ┌────────────┐  stdin: input/resize  ┌────────────┐  master  ┌─────────┐
//! │   bridge   │──────────────────────►│  PTY host  │◄────────►│  child  │
//! │            │◄──────────────────────│            │          │         │
//! └────────────┘  stdout: output/exit  └────────────┘          └─────────┘
//! ```
//!
//! The host writes exactly one `exit` message, after the PTY has reported end
//! of output and the child has been reaped. A child killed by a signal is
//! reported with `code: null` and the signal number. If the bridge closes stdin, the
//! child is killed.

use std::io::{Read, Write};

use anyhow::{Context, Result, bail};
use clap::Parser;
use portable_pty::{Child, CommandBuilder, PtySize, native_pty_system};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec;
use crate::frame::{HostCommand, HostMessage};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 8192;

/// Command-line arguments for the PTY host.
#[derive(Parser, Debug)]
#[command(
    name = "webify-pty-host",
    author,
    version,
    about = "Run a command inside a pseudo-terminal and speak the webify control protocol on stdio"
)]
pub struct Args {
    /// Initial terminal width
    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u16).range(1..))]
    pub cols: u16,

    /// Initial terminal height
    #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u16).range(1..))]
    pub rows: u16,

    /// Command to run, after `--`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Runs the command to completion inside a PTY.
///
/// Returns once the `exit` message has been written.
pub async fn run_pty_host(args: Args) -> Result<()> {
    let Some((program, program_args)) = args.command.split_first() else {
        bail!("missing command to execute");
    };

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: args.rows,
            cols: args.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open PTY")?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(program_args);
    cmd.env("TERM", "xterm-256color");
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("failed to spawn {program}"))?;
    // Only the child may hold the slave, or the master never sees end of file.
    drop(pair.slave);
    info!("Spawned {:?} (pid: {:?})", args.command, child.process_id());

    let master = pair.master;
    let mut killer = child.clone_killer();

    // PTY output -> stdout writer
    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
    let mut master_reader = master.try_clone_reader().context("failed to clone PTY reader")?;
    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match master_reader.read(&mut buffer) {
                Ok(n) if n > 0 => {
                    if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                // EOF, or EIO once the child side has closed
                Ok(_) | Err(_) => break,
            }
        }
    });

    // PTY input from stdin commands
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    let mut master_writer = master.take_writer().context("failed to take PTY writer")?;
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if master_writer.write_all(&data).is_err() || master_writer.flush().is_err() {
                break;
            }
        }
    });

    let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);
    let (stdin_closed_tx, mut stdin_closed_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<HostCommand>(&line) {
                Ok(HostCommand::Input { data }) => match codec::decode_payload(&data) {
                    Ok(bytes) => {
                        if input_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring input: {}", e),
                },
                Ok(HostCommand::Resize { cols, rows }) => {
                    if cols > 0 && rows > 0 && resize_tx.send((cols, rows)).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Ignoring control line: {}", e),
            }
        }
        let _ = stdin_closed_tx.send(()).await;
    });

    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    loop {
        select! {
            chunk = output_rx.recv() => {
                let Some(chunk) = chunk else { break };
                let message = HostMessage::Output { data: codec::encode_bytes(&chunk) };
                if write_message(&mut stdout, &message).await.is_err() {
                    // Nobody is listening any more.
                    let _ = killer.kill();
                    break;
                }
            }

            Some((cols, rows)) = resize_rx.recv() => {
                let size = PtySize { rows, cols, pixel_width: 0, pixel_height: 0 };
                match master.resize(size) {
                    Ok(()) => debug!("Resized PTY to {}x{}", cols, rows),
                    Err(e) => warn!("Failed to resize PTY: {}", e),
                }
            }

            Some(()) = stdin_closed_rx.recv(), if stdin_open => {
                stdin_open = false;
                info!("Control stream closed, terminating child");
                if let Err(e) = killer.kill() {
                    debug!("Child already gone: {}", e);
                }
            }
        }
    }

    let exit = tokio::task::spawn_blocking(move || wait_for_child(child))
        .await
        .context("child wait task failed")??;
    info!("Child exited: {:?}", exit);

    write_message(&mut stdout, &exit)
        .await
        .context("failed to report exit")?;

    Ok(())
}

/// Reaps the child and describes how it ended.
///
/// portable-pty only keeps a signal's name, so on unix the child is reaped
/// with `waitpid` to keep the signal number.
#[cfg(unix)]
fn wait_for_child(mut child: Box<dyn Child + Send + Sync>) -> Result<HostMessage> {
    use nix::errno::Errno;
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    if let Some(pid) = child.process_id() {
        loop {
            match waitpid(Pid::from_raw(pid as i32), None) {
                Ok(status) => {
                    if let Some(exit) = exit_message(status) {
                        return Ok(exit);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    debug!("waitpid({}) failed, falling back: {}", pid, e);
                    break;
                }
            }
        }
    }

    let status = child.wait().context("failed to wait for child")?;
    Ok(HostMessage::Exit {
        code: Some(status.exit_code() as i32),
        signal: None,
    })
}

#[cfg(not(unix))]
fn wait_for_child(mut child: Box<dyn Child + Send + Sync>) -> Result<HostMessage> {
    let status = child.wait().context("failed to wait for child")?;
    Ok(HostMessage::Exit {
        code: Some(status.exit_code() as i32),
        signal: None,
    })
}

/// Maps a terminal wait status onto an `exit` message, `None` otherwise.
#[cfg(unix)]
fn exit_message(status: nix::sys::wait::WaitStatus) -> Option<HostMessage> {
    use nix::sys::wait::WaitStatus;

    match status {
        WaitStatus::Exited(_, code) => Some(HostMessage::Exit {
            code: Some(code),
            signal: None,
        }),
        WaitStatus::Signaled(_, signal, _) => Some(HostMessage::Exit {
            code: None,
            signal: Some(signal as i32),
        }),
        _ => None,
    }
}

async fn write_message(stdout: &mut tokio::io::Stdout, message: &HostMessage) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
