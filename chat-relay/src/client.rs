use std::collections::VecDeque;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ConnectArgs,
    protocol::{DM_MARKER, Incoming, read_line_resumable, write_line},
};

pub async fn run(args: ConnectArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_line(&mut writer, &args.username)
        .await
        .context("failed to send username")?;
    write_stdout(&format!("*** connected as {}", args.username)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut view = ChatView::new(args.username);

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut view).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ConnectArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    view: &mut ChatView,
) -> Result<()> {
    // Partial lines survive whichever branch loses the race.
    let mut relay_pending = Vec::new();
    let mut stdin_pending = Vec::new();
    loop {
        select! {
            relay_line = read_line_resumable(reader, &mut relay_pending) => {
                if !handle_relay_line(relay_line, view).await? {
                    break;
                }
            }
            input = read_line_resumable(stdin, &mut stdin_pending) => {
                if !handle_stdin_input(input, writer, view).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relay_line(
    line: io::Result<Option<String>>,
    view: &mut ChatView,
) -> Result<bool> {
    match line? {
        Some(line) => {
            if let Some(rendered) = view.render(&line) {
                write_stdout(&rendered).await?;
            }
            Ok(true)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    input: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
    view: &mut ChatView,
) -> Result<bool> {
    let Some(input) = input? else {
        return Ok(false);
    };

    match view.compose(input.trim()) {
        Composed::Nothing => Ok(true),
        Composed::Quit => {
            write_stdout("*** leaving chat").await?;
            Ok(false)
        }
        Composed::Usage(usage) => {
            write_stdout(usage).await?;
            Ok(true)
        }
        Composed::Send { wire, local } => {
            write_line(writer, &wire).await?;
            write_stdout(&local).await?;
            Ok(true)
        }
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// What one line of user input turns into.
#[derive(Debug, PartialEq, Eq)]
pub enum Composed {
    Nothing,
    Quit,
    Usage(&'static str),
    /// `wire` goes to the relay, `local` is the immediate local echo.
    Send { wire: String, local: String },
}

/// Terminal-side state: who we are and which DMs we are still expecting back.
#[derive(Debug)]
pub struct ChatView {
    username: String,
    pending_echoes: VecDeque<(String, String)>,
}

impl ChatView {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            pending_echoes: VecDeque::new(),
        }
    }

    pub fn compose(&mut self, input: &str) -> Composed {
        if input.is_empty() {
            return Composed::Nothing;
        }
        if input.eq_ignore_ascii_case("/quit") {
            return Composed::Quit;
        }
        if input == "/dm" || input.starts_with("/dm ") {
            let rest = input["/dm".len()..].trim();
            let Some((peer, body)) = rest.split_once(char::is_whitespace) else {
                return Composed::Usage("*** usage: /dm <user> <message>");
            };
            let body = body.trim();
            if body.is_empty() {
                return Composed::Usage("*** usage: /dm <user> <message>");
            }
            self.pending_echoes
                .push_back((peer.to_string(), body.to_string()));
            return Composed::Send {
                wire: format!("{DM_MARKER}{peer}:{body}"),
                local: format!("[dm -> {peer}] {body}"),
            };
        }

        Composed::Send {
            wire: format!("{}: {input}", self.username),
            local: format!("<{}> {input}", self.username),
        }
    }

    /// Formats a line from the relay, or `None` when it is the echo of a DM we already showed.
    pub fn render(&mut self, line: &str) -> Option<String> {
        match Incoming::parse(line)? {
            Incoming::Roster(names) if names.is_empty() => Some("*** online: nobody".to_string()),
            Incoming::Roster(names) => Some(format!("*** online: {}", names.join(", "))),
            Incoming::Direct { peer, body } => {
                if self.take_echo(&peer, &body) {
                    return None;
                }
                Some(format!("[dm {peer}] {body}"))
            }
            Incoming::Notice(text) => Some(text),
            Incoming::Chat {
                sender: Some(sender),
                body,
            } => Some(format!("<{sender}> {body}")),
            Incoming::Chat { sender: None, body } => Some(format!("<unknown> {body}")),
        }
    }

    fn take_echo(&mut self, peer: &str, body: &str) -> bool {
        let position = self
            .pending_echoes
            .iter()
            .position(|(sent_to, sent)| sent_to == peer && sent == body);
        match position {
            Some(index) => {
                self.pending_echoes.remove(index);
                true
            }
            None => false,
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
