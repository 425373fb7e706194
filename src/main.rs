use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::info;

use smtp_forwarder::config::{Config, Delivery, Opt};
use smtp_forwarder::logging::setup_tracing;
use smtp_forwarder::sink::{MessageSink, PrintSink, RelaySink};
use smtp_forwarder::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    let config = match Config::from_opt(opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}\n", e);
            let _ = Opt::clap().write_help(&mut std::io::stderr());
            eprintln!();
            std::process::exit(1);
        }
    };

    setup_tracing(config.verbose, config.log_file.as_deref())?;

    info!("smtp-forwarder v{}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let sink: Arc<dyn MessageSink> = match &config.delivery {
        Delivery::Print => {
            info!("Delivery: printing messages to stdout");
            Arc::new(PrintSink::stdout())
        }
        Delivery::Relay(relay) => {
            info!(
                "Delivery: relaying through {}:{} as {} ({})",
                relay.host, relay.port, relay.credentials.username, relay.security
            );
            let client = relay
                .client(&config.hostname)
                .context("Failed to set up the relay client")?;
            Arc::new(RelaySink::new(client))
        }
    };

    info!("Hostname: {}", config.hostname);
    info!("Max sessions: {}", config.max_sessions);
    if config.max_connections_per_minute > 0 {
        info!(
            "Max connections per minute per IP: {}",
            config.max_connections_per_minute
        );
    }

    let server = Arc::new(Server::new(Arc::new(config), sink)?);
    let listener = server.bind().await?;

    info!("Waiting for connections, press Ctrl+C to stop");
    tokio::select! {
        result = server.run(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
