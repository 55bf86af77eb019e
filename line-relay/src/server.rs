use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::info;

use crate::{
    cli::ServerArgs,
    client::write_stdout,
    connection::{DEFAULT_READ_TIMEOUT, Endpoint},
    error::RelayError,
    message::Message,
};

/// Consumes relayed requests until the broker hangs up.
pub async fn run(args: ServerArgs) -> Result<()> {
    let stream = TcpStream::connect(args.broker)
        .await
        .with_context(|| format!("failed to connect to {}", args.broker))?;
    info!("connected to {}", args.broker);

    let Endpoint { reader, mut writer } = Endpoint::from_stream(stream);
    // The broker may stay quiet for a long time between clients.
    let mut reader = reader.with_read_timeout(DEFAULT_READ_TIMEOUT * 10);

    let mut answered = 0u64;
    loop {
        let request = match reader.read_message().await {
            Ok(request) => request,
            Err(RelayError::ConnectionClosed) => break,
            Err(err) => return Err(err).context("waiting for a request"),
        };
        write_stdout(&format!(">> processing {request}")).await?;

        if args.reply {
            if args.interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
            }
            let response = Message::new(format!("server response {answered} to {request}"));
            writer
                .write_message(&response)
                .await
                .context("failed to send response")?;
            answered += 1;
        }
    }

    info!(answered, "broker closed the connection");
    Ok(())
}
