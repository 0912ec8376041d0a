use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use webify::Bridge;
use webify::cli::{self, Args, Invocation};

fn main() {
    let args = match cli::parse(std::env::args_os()) {
        Invocation::Run(args) => args,
        Invocation::Exit {
            code,
            message,
            to_stderr,
        } => {
            if to_stderr {
                eprint!("{message}");
            } else {
                print!("{message}");
            }
            std::process::exit(code);
        }
    };

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("webify: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

#[tokio::main]
async fn run(args: Args) -> Result<i32> {
    init_logging()?;
    info!("Starting webify for command: {:?}", args.command);

    let config = args.bridge_config()?;
    let bridge = Bridge::bind(config).await?;

    let url = args.viewer_url();
    eprintln!("webify: sharing {:?}", args.command);
    eprintln!("webify: open {url} (viewers connect to ws://{}/ws)", bridge.local_addr());

    if !args.no_open {
        if let Err(e) = open::that_detached(&url) {
            warn!("Failed to open browser at {}: {}", url, e);
        }
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        signal.cancel();
    })
    .context("failed to install signal handler")?;

    let reason = bridge.run(args.command, shutdown).await?;
    info!("webify finished: {:?}", reason);
    Ok(reason.process_code())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = format!("{home_dir}/.webify");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {log_dir}"))?;

    let log_path = format!("{log_dir}/webify.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {log_path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr.and(log_file))
        .with_ansi(false)
        .init();

    Ok(())
}
