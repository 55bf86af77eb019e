use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use line_relay::{
    cli::{BrokerArgs, Cli, Command},
    client,
    engine::RelayEngine,
    net::Listeners,
    server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => run_broker(args).await?,
        Command::Client(args) => client::run(args).await?,
        Command::Server(args) => server::run(args).await?,
    }

    Ok(())
}

async fn run_broker(args: BrokerArgs) -> Result<()> {
    let config = args.relay_config()?;
    let clients = args.client_count(config.topology);
    let engine = RelayEngine::new(config)?;

    let listeners = Listeners::bind(args.server_listen, args.client_listen).await?;
    let server = listeners.accept_server(args.server_replies).await?;
    let clients = listeners.accept_clients(clients).await?;

    let report = engine
        .run_until(clients, server, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    for session in &report.sessions {
        info!(
            session = session.index,
            forwarded = session.forwarded,
            acknowledged = session.acknowledged,
            fault = session.fault.as_deref().unwrap_or("none"),
            "session finished"
        );
    }
    if report.faulted().next().is_some() {
        warn!("relay finished with faulted sessions");
    }
    Ok(())
}
