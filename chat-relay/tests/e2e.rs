use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn terminal_clients_chat_through_relay() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat_relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    alice.expect_line("*** online: alice").await?;

    let mut bob = spawn_client(&binary, "bob", &addr).await?;
    bob.expect_line("*** online: alice, bob").await?;
    alice
        .expect_line("Server : bob has entered the chat !")
        .await?;
    alice.expect_line("*** online: alice, bob").await?;

    // Group lines are echoed locally and relayed to the other side only.
    alice.send_line("Hello from Alice").await?;
    alice.expect_line("<alice> Hello from Alice").await?;
    bob.expect_line("<alice> Hello from Alice").await?;

    // A DM shows once on each side: the relay echo is folded into the local copy.
    bob.send_line("/dm alice psst: over here").await?;
    bob.expect_line("[dm -> alice] psst: over here").await?;
    alice.expect_line("[dm bob] psst: over here").await?;

    bob.send_line("/dm ghost anyone?").await?;
    bob.expect_line("[dm -> ghost] anyone?").await?;
    bob.expect_line("Server : User ghost not found.").await?;

    alice.send_line("/quit").await?;
    alice.expect_line("*** leaving chat").await?;
    bob.expect_line("Server : alice has left the chat!").await?;
    bob.expect_line("*** online: bob").await?;

    bob.send_line("/quit").await?;
    bob.expect_line("*** leaving chat").await?;

    alice.finish("alice client").await?;
    bob.finish("bob client").await?;

    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn finish(self, name: &str) -> Result<()> {
        let ClientProcess {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        ensure_success(&mut child, name).await
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = read_line_expect(&mut self.stdout, expected).await?;
        if line != expected {
            return Err(anyhow!("expected '{expected}', got '{line}'"));
        }
        Ok(())
    }
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("relay did not announce its address")?;
    let addr = line
        .trim()
        .strip_prefix("relay listening on ")
        .with_context(|| format!("unexpected relay banner: {line}"))?;
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, username: &str, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("connect")
        .arg("--username")
        .arg(username)
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };
    process
        .expect_line(&format!("*** connected as {username}"))
        .await?;

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("waiting for '{description}': stream closed")),
        Err(err) => Err(err.context(format!("waiting for '{description}'"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
