use clap::Parser;
use tracing::error;

use webify::pty_host::{Args, run_pty_host};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // stdout carries the control protocol, so logs only ever go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let code = match run_pty_host(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("pty-host: {:#}", e);
            eprintln!("pty-host: {e:#}");
            1
        }
    };

    // The stdin reader may still be blocked on a read that will never finish.
    std::process::exit(code);
}
