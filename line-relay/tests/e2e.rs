use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("line-relay");

    let (mut broker, mut broker_stdout) = spawn_broker(&binary).await?;
    let server_addr = read_bound_addr(&mut broker_stdout, "server").await?;
    let client_addr = read_bound_addr(&mut broker_stdout, "client").await?;

    // Drain additional broker logs in the background so the pipe never fills.
    let broker_log_task = tokio::spawn(async move {
        drain_stdout(broker_stdout).await;
    });

    let mut server = spawn_peer(&binary, &["server", "--broker", &server_addr])?;
    let mut client = spawn_peer(
        &binary,
        &[
            "client",
            "--broker",
            &client_addr,
            "--name",
            "alice",
            "--count",
            "2",
        ],
    )?;

    for n in 0..2 {
        let sent = read_line_expect(&mut client.stdout, "waiting for request echo").await?;
        assert_eq!(sent, format!(">> client alice request {n}"));
        let ack = read_line_expect(&mut client.stdout, "waiting for acknowledgment").await?;
        assert_eq!(
            ack,
            format!("-> client alice request {n} has reached the server successfully")
        );

        let processed = read_line_expect(&mut server.stdout, "waiting for server").await?;
        assert_eq!(processed, format!(">> processing client alice request {n}"));
    }

    // The client closes after its last request; the broker finishes once its
    // only session has closed, which in turn lets the server exit.
    ensure_success(&mut client.child, "client").await?;
    ensure_success(&mut broker, "broker").await?;
    ensure_success(&mut server.child, "server").await?;
    let _ = broker_log_task.await;

    Ok(())
}

struct PeerProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

async fn spawn_broker(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.args([
        "broker",
        "--topology",
        "one-way",
        "--mode",
        "sync",
        "--server-listen",
        "127.0.0.1:0",
        "--client-listen",
        "127.0.0.1:0",
    ])
    .env("RUST_LOG", "info")
    .env("NO_COLOR", "1")
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn broker")?;
    let stdout = child
        .stdout
        .take()
        .context("broker stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

fn spawn_peer(binary: &Path, args: &[&str]) -> Result<PeerProcess> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .env("RUST_LOG", "off")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", args[0]))?;
    let stdout = child
        .stdout
        .take()
        .context("peer stdout missing after spawn")?;

    Ok(PeerProcess {
        child,
        stdout: BufReader::new(stdout),
    })
}

/// Reads broker log lines until the one announcing the `kind` listener and
/// returns the address it ends with.
async fn read_bound_addr(reader: &mut BufReader<ChildStdout>, kind: &str) -> Result<String> {
    let banner = format!("{kind} listener bound on");
    loop {
        let line = read_line_expect(reader, "waiting for listener banner").await?;
        if !line.contains(&banner) {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected broker banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("broker banner missing socket: {line}"));
        }
        return Ok(addr.to_string());
    }
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes_io = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes_io? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while let Ok(bytes) = reader.read_line(&mut buffer).await {
        if bytes == 0 {
            break;
        }
        buffer.clear();
    }
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
