use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use coda_helper::app::App;
use coda_helper::rpc;
use coda_helper::writer::MsgWriter;

/// P2P sidecar: speaks newline-delimited JSON RPC on stdin/stdout and fronts
/// the node's libp2p stack. Logs go to stderr.
#[derive(Parser)]
#[command(name = "coda-helper", version, about)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli {} = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let writer = Arc::new(MsgWriter::new(tokio::io::stdout()));
    let app = App::new(writer);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    // A clean return means the parent closed our stdin; exit zero. Channel
    // failures exit non-zero through the error path.
    rpc::run(app, stdin).await.context("RPC channel failure")?;
    Ok(())
}
