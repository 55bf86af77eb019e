use std::time::Duration;

use anyhow::{Context, Result};
use line_relay::{
    config::{DeliveryMode, RelayConfig, Topology},
    connection::Endpoint,
    engine::RelayEngine,
    message::Message,
    net::Listeners,
};
use tokio::{net::TcpStream, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn relays_over_loopback_tcp() -> Result<()> {
    let listeners = Listeners::bind("127.0.0.1:0".parse()?, "127.0.0.1:0".parse()?).await?;

    let server_conn = TcpStream::connect(listeners.server_addr()?).await?;
    let client_conn = TcpStream::connect(listeners.client_addr()?).await?;
    let server_side = listeners.accept_server(true).await?;
    let clients = listeners.accept_clients(1).await?;

    let engine = RelayEngine::new(RelayConfig {
        topology: Topology::OneWay,
        mode: DeliveryMode::Async,
        ..RelayConfig::default()
    })?;
    let relay = tokio::spawn(engine.run(clients, server_side));

    let mut server = Endpoint::from_stream(server_conn);
    let mut client = Endpoint::from_stream(client_conn);

    client
        .writer
        .write_message(&Message::from("request 0"))
        .await?;

    let request = timeout(WAIT, server.reader.read_message()).await??;
    assert_eq!(request.as_str(), "request 0");
    server
        .writer
        .write_message(&Message::new(format!("server response 0 to {request}")))
        .await?;

    let mut lines = Vec::new();
    for _ in 0..2 {
        lines.push(timeout(WAIT, client.reader.read_message()).await??.into_string());
    }
    lines.sort();
    assert_eq!(
        lines,
        [
            "request 0 has reached the server successfully",
            "server response 0 to request 0",
        ]
    );

    client.writer.shutdown().await?;
    let report = timeout(WAIT, relay)
        .await
        .context("relay did not finish")???;
    let session = report.session(0).context("session 0")?;
    assert_eq!((session.forwarded, session.acknowledged), (1, 1));
    assert!(session.fault.is_none());
    Ok(())
}
