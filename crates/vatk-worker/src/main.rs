use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;
use vatk_worker::{engine_by_name, serve};

#[derive(Parser, Debug)]
#[command(name = "vatk-worker", version, about = "Vat worker process")]
struct Cli {
    /// Engine to host.
    #[arg(long, default_value = "counter")]
    engine: String,

    /// Serve kernels connecting to this Unix socket instead of stdin/stdout.
    #[arg(long)]
    listen: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    engine_by_name(&cli.engine).ok_or_else(|| anyhow!("unknown engine '{}'", cli.engine))?;

    match cli.listen {
        None => {
            let engine = engine_by_name(&cli.engine).context("engine")?;
            serve(engine, tokio::io::stdin(), tokio::io::stdout()).await
        }
        Some(path) => listen(&cli.engine, path).await,
    }
}

async fn listen(engine: &str, path: PathBuf) -> Result<()> {
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind worker socket {}", path.display()))?;
    tracing::info!(socket = %path.display(), "worker listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("accept")?;
                let engine = engine_by_name(engine).context("engine")?;
                tokio::spawn(async move {
                    let (read, write) = stream.into_split();
                    if let Err(err) = serve(engine, read, write).await {
                        tracing::warn!("connection ended with error: {err:#}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = std::fs::remove_file(&path);
                return Ok(());
            }
        }
    }
}
