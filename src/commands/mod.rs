//! Консольный интерфейс: строка stdin -> команда -> вызов менеджера.

pub mod call_api;
pub mod util_api;

use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{CodeEncoding, SessionConfig};
use crate::error::SessionError;
use crate::peer::engine::PeerEngine;
use crate::peer::{PeerSessionManager, SessionEvent};
use crate::signaling::SignalingCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `start` или `start text` (без камеры и микрофона)
    Start { data_only: bool },
    Call,
    Answer(String),
    Accept(String),
    Send(String),
    Mute,
    Video,
    Status,
    Fingerprint,
    HangUp,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`, type `help`")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
}

impl Command {
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let arg = |what: &'static str| {
            if rest.is_empty() {
                Err(CommandError::MissingArgument(what))
            } else {
                Ok(rest.to_owned())
            }
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start {
                data_only: rest.eq_ignore_ascii_case("text"),
            },
            "call" => Command::Call,
            "answer" | "join" => Command::Answer(arg("answer")?),
            "accept" => Command::Accept(arg("accept")?),
            "send" => Command::Send(arg("send")?),
            "mute" => Command::Mute,
            "video" => Command::Video,
            "status" => Command::Status,
            "fingerprint" | "fp" => Command::Fingerprint,
            "hangup" | "bye" => Command::HangUp,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_owned())),
        };
        Ok(Some(command))
    }
}

pub const HELP: &str = "\
commands:
  start [text]     prepare local media (text: no camera/microphone)
  call             create an offer code to send to the other side
  answer <code>    paste an offer, prints an answer code to send back
  accept <code>    paste the answer you received
  send <text>      chat message over the data channel
  mute | video     toggle microphone / camera
  status           connection and ICE indicators
  fingerprint      short hash of the last code, compare it by voice
  hangup           end the call
  quit";

/// Что делать циклу после команды
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Silent,
    Quit,
}

/// Состояние консоли поверх менеджера
pub struct Console {
    pub(crate) manager: Arc<PeerSessionManager>,
    pub(crate) encoding: CodeEncoding,
    /// Последний код, который мы выдали или приняли
    pub(crate) last_code: Option<SignalingCode>,
}

impl Console {
    pub fn new(manager: Arc<PeerSessionManager>) -> Self {
        let encoding = manager.config().encoding;
        Self {
            manager,
            encoding,
            last_code: None,
        }
    }

    pub async fn execute(&mut self, command: Command) -> Result<Reply, SessionError> {
        debug!("executing {command:?}");
        match command {
            Command::Start { data_only } => self.start(data_only),
            Command::Call => self.call().await,
            Command::Answer(code) => self.answer(&code).await,
            Command::Accept(code) => self.accept(&code).await,
            Command::Send(text) => self.send(&text).await,
            Command::Mute => self.mute(),
            Command::Video => self.video(),
            Command::Status => Ok(self.status()),
            Command::Fingerprint => Ok(self.fingerprint()),
            Command::HangUp => self.hangup().await,
            Command::Help => Ok(Reply::Text(HELP.to_owned())),
            Command::Quit => {
                self.manager.hang_up().await;
                Ok(Reply::Quit)
            }
        }
    }
}

/// Цикл консоли: команды со stdin, события сессии в stdout
pub async fn serve(engine: Arc<dyn PeerEngine>, config: SessionConfig) -> std::io::Result<()> {
    let (manager, events) = PeerSessionManager::new(engine, config);
    let mut console = Console::new(Arc::new(manager));
    let printer = tokio::spawn(print_events(events));

    println!("lancall ready, type `help` for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match console.execute(command).await {
            Ok(Reply::Text(text)) => println!("{text}"),
            Ok(Reply::Silent) => {}
            Ok(Reply::Quit) => break,
            Err(e) => println!("error: {e}"),
        }
    }

    console.manager.hang_up().await;
    printer.abort();
    info!("console closed");
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = util_api::describe_event(&event) {
            println!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(Command::parse("  "), Ok(None));
        assert_eq!(Command::parse("call"), Ok(Some(Command::Call)));
        assert_eq!(
            Command::parse("START text"),
            Ok(Some(Command::Start { data_only: true }))
        );
        assert_eq!(
            Command::parse("start"),
            Ok(Some(Command::Start { data_only: false }))
        );
        assert_eq!(
            Command::parse("send  hello there "),
            Ok(Some(Command::Send("hello there".into())))
        );
        assert_eq!(
            Command::parse("answer H4sIAAAA"),
            Ok(Some(Command::Answer("H4sIAAAA".into())))
        );
    }

    #[test]
    fn rejects_unknown_or_incomplete_commands() {
        assert_eq!(
            Command::parse("dial"),
            Err(CommandError::Unknown("dial".into()))
        );
        assert_eq!(
            Command::parse("accept"),
            Err(CommandError::MissingArgument("accept"))
        );
        assert_eq!(
            Command::parse("send   "),
            Err(CommandError::MissingArgument("send"))
        );
    }
}
