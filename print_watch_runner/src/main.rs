mod image_helper;
mod settings;
mod sink;
mod source;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use print_watch::core_modules::features::OrientedBrief;
use print_watch::session::SessionOutcome;
use print_watch::{ReferenceImage, SessionHost};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::sink::JsonLinesSink;
use crate::source::DirectorySource;

/// Replays a directory of build-plate frames through one print_watch session.
#[derive(Parser, Debug)]
#[command(name = "print_watch_runner", version)]
struct Args {
    /// Directory of frames, replayed in file-name order.
    frames: PathBuf,

    /// Image of the build plate as it should look during a good print.
    #[arg(long)]
    reference: PathBuf,

    /// Frame rate used to timestamp the replayed frames.
    #[arg(long, default_value_t = 1.0)]
    fps: f64,

    /// Optional TOML file; `PRINT_WATCH_*` environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON-lines file the print record is appended to.
    #[arg(long, default_value = "print_records.jsonl")]
    records: PathBuf,

    /// Writes every annotated frame here as PNG.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("print_watch=info,print_watch_runner=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let config = settings::load(args.config.as_deref())?;
    let extractor = OrientedBrief::new(config.max_features);
    let reference = ReferenceImage::load(&args.reference, &extractor)?;
    let source = DirectorySource::open(&args.frames, args.fps)?;
    let sink = JsonLinesSink::open(&args.records)
        .with_context(|| format!("cannot open {}", args.records.display()))?;
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let host = SessionHost::new(Arc::new(sink));
    let mut frames = host
        .start_session(Box::new(source), Arc::new(reference), config)
        .await?;

    let mut written = 0usize;
    let mut stopped = None;
    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                if let Some(dir) = &args.output_dir {
                    let path = dir.join(format!("frame_{written:06}.png"));
                    if let Err(e) = image_helper::save(&path, &frame) {
                        warn!(path = %path.display(), error = %e, "could not save annotated frame");
                    }
                }
                written += 1;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping the session");
                stopped = host.stop_session().await;
                break;
            }
        }
    }

    let outcome = match stopped {
        Some(outcome) => Some(outcome),
        None => host.wait_session().await,
    };
    let status = host.current_status();
    info!(status = %status.status, elapsed = status.elapsed_seconds, frames = written, "replay finished");

    match outcome {
        Some(SessionOutcome::Failed { message, .. }) => println!("print failed after {:.1}s: {message}", status.elapsed_seconds),
        _ => println!("{} ({:.1}s)", status.status, status.elapsed_seconds),
    }
    Ok(())
}
