use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use webserv_core::{Config, Server};

#[derive(Parser)]
#[command(name = "webserv")]
#[command(about = "Single-threaded HTTP/1.1 server with static files, uploads and CGI")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Default log level; RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        webserv_core::init_logging_json(&cli.log_level);
    } else {
        webserv_core::init_logging(&cli.log_level);
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let server = Server::bind(config).context("starting server")?;
    for addr in server.local_addrs() {
        tracing::info!("serving on http://{}", addr);
    }
    server.serve()?;

    tracing::info!("webserv shut down cleanly");
    Ok(())
}
