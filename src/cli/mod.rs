//! # Command Line
//!
//! ```bash
//! # Share a shell on the default port
//! webify bash
//!
//! # Custom port, no browser, explicit separator
//! webify --port 9000 --no-open -- python3 -q
//! ```
//!
//! The command is everything after `--`, or everything from the first token
//! that is not a recognized option. Usage errors exit with code 1, `--help`
//! and `--version` with code 0.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use crate::BridgeConfig;
use crate::host::HostConfig;
use crate::hub::DEFAULT_VIEWER_QUEUE;

/// Command-line arguments for `webify`
#[derive(Parser, Debug)]
#[command(
    name = "webify",
    author,
    version,
    about = "Share an interactive terminal command with browser viewers over WebSocket."
)]
pub struct Args {
    /// Port for the viewer endpoint
    #[arg(
        short,
        long,
        default_value_t = 8080,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    /// Address to bind the viewer endpoint to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Do not open a browser once the endpoint is up
    #[arg(long, default_value_t = false)]
    pub no_open: bool,

    /// PTY host executable
    ///
    /// Defaults to the `webify-pty-host` binary installed next to `webify`,
    /// then to one found on PATH.
    #[arg(long, env = "WEBIFY_PTY_HOST")]
    pub pty_host: Option<PathBuf>,

    /// Milliseconds to keep viewers connected after the command exits
    #[arg(long, default_value_t = 250)]
    pub grace_ms: u64,

    /// Command to run, with its arguments
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

impl Args {
    /// Builds the bridge configuration, locating the PTY host.
    pub fn bridge_config(&self) -> crate::error::Result<BridgeConfig> {
        Ok(BridgeConfig {
            bind: self.bind.clone(),
            port: self.port,
            host: HostConfig::locate(self.pty_host.clone())?,
            grace: Duration::from_millis(self.grace_ms),
            viewer_queue: DEFAULT_VIEWER_QUEUE,
        })
    }

    /// URL a browser should open.
    ///
    /// A wildcard bind address is replaced by loopback, since browsers cannot
    /// connect to it.
    pub fn viewer_url(&self) -> String {
        let host = match self.bind.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            Ok(IpAddr::V6(ip)) if ip.is_unspecified() => format!("[{}]", Ipv6Addr::LOCALHOST),
            Ok(IpAddr::V6(ip)) => format!("[{ip}]"),
            _ => self.bind.clone(),
        };
        format!("http://{}:{}/", host, self.port)
    }
}

/// Result of parsing the command line.
#[derive(Debug)]
pub enum Invocation {
    /// Start the bridge.
    Run(Args),
    /// Print `message` and exit with `code` without starting anything.
    Exit {
        code: i32,
        message: String,
        to_stderr: bool,
    },
}

/// Parses `argv`, mapping clap's outcomes onto webify's exit codes.
pub fn parse<I, T>(argv: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match Args::try_parse_from(argv) {
        Ok(args) => Invocation::Run(args),
        Err(e) => {
            let mut message = e.render().to_string();
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Invocation::Exit {
                    code: 0,
                    message,
                    to_stderr: false,
                },
                _ => {
                    // Value errors render without a usage line.
                    if !message.contains("Usage:") {
                        let usage = Args::command().render_usage();
                        message.push_str(&format!("\n{usage}\n"));
                    }
                    Invocation::Exit {
                        code: 1,
                        message,
                        to_stderr: true,
                    }
                }
            }
        }
    }
}
