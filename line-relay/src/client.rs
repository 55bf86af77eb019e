use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::DeliveryMode,
    connection::{Endpoint, MessageReader, MessageWriter},
    error::RelayError,
    message::Message,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let Endpoint { reader, mut writer } = establish_connection(&args).await?;

    match args.mode {
        DeliveryMode::Sync => {
            let mut reader = reader;
            for n in 0..args.count {
                send_request(&mut writer, &args.name, n).await?;
                match reader.read_message().await {
                    Ok(reply) => write_stdout(&format!("-> {reply}")).await?,
                    Err(RelayError::ConnectionClosed) => {
                        write_stdout("*** broker closed the connection").await?;
                        return Ok(());
                    }
                    Err(err) => return Err(err).context("waiting for a reply"),
                }
                pause(args.interval_ms).await;
            }
            shutdown_connection(&mut writer).await;
            print_replies(reader).await
        }
        DeliveryMode::Async => {
            let printer = tokio::spawn(print_replies(reader));
            for n in 0..args.count {
                send_request(&mut writer, &args.name, n).await?;
                pause(args.interval_ms).await;
            }
            shutdown_connection(&mut writer).await;
            printer.await.context("reply printer panicked")?
        }
    }
}

async fn establish_connection(args: &ClientArgs) -> Result<Endpoint> {
    let stream = TcpStream::connect(args.broker)
        .await
        .with_context(|| format!("failed to connect to {}", args.broker))?;

    info!("connected to {}", args.broker);
    Ok(Endpoint::from_stream(stream))
}

async fn send_request(writer: &mut MessageWriter, name: &str, n: u32) -> Result<()> {
    let request = Message::new(format!("client {name} request {n}"));
    writer
        .write_message(&request)
        .await
        .context("failed to send request")?;
    write_stdout(&format!(">> {request}")).await?;
    Ok(())
}

/// Prints everything the broker sends until it closes the connection.
async fn print_replies(mut reader: MessageReader) -> Result<()> {
    loop {
        match reader.read_message().await {
            Ok(reply) => write_stdout(&format!("-> {reply}")).await?,
            Err(RelayError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err).context("waiting for a reply"),
        }
    }
}

async fn pause(interval_ms: u64) {
    if interval_ms > 0 {
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

async fn shutdown_connection(writer: &mut MessageWriter) {
    if let Err(error) = writer.shutdown().await {
        warn!(%error, "failed to shutdown client writer cleanly");
    }
}

pub(crate) async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
