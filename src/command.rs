//! The command stream driving the dispatcher.
//!
//! Commands arrive as a typed event stream over an mpsc channel; the core
//! never sees raw keystrokes. The interactive source reads lines from stdin
//! on its own thread, parses them, and wakes the dispatcher's poll loop
//! through a [`mio::Waker`].
//!
//! Command syntax:
//! - `#+<port>`  connect to the given endpoint port (becomes the selection)
//! - `#-<port>`  remove the connection to that port
//! - `#s<port>`  select the connection to that port
//! - `#q`        quit
//! - `#d`        display the connection lists
//! - `#z`        toggle the worker receive delay
//! - `#t<count>` run a burst of synthetic test messages
//! - `#p<flags>` select displayed message categories (`0 a s r c o`)
//! - `#u<type>`  package transport: 0 = UPS, 1 = REINDEER
//! - `#@<addr>`  send the package for the given address (zipcode)
//!
//! Anything else is sent verbatim to the selected endpoint.

use crate::package::TransportMode;
use crate::sink::{Category, LogSink, PrintFilter};
use mio::Waker;
use std::fmt;
use std::io::{self, BufRead};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

/// A single event from the command source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    SendMessage(String),
    AddEndpoint(u16),
    RemoveEndpoint(u16),
    SelectEndpoint(u16),
    ToggleDelay,
    RunTest(u32),
    SetPrintFilter(PrintFilter),
    ShowConnections,
    SetTransportMode(TransportMode),
    SpecialPackage(i32),
}

/// Why a line could not be turned into a command.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Blank input, nothing to do.
    Empty,
    UnknownCommand(char),
    InvalidNumber(String),
    InvalidFilter(char),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::UnknownCommand(c) => write!(f, "unknown command: '{c}'"),
            ParseError::InvalidNumber(s) => write!(f, "invalid number in command: '{s}'"),
            ParseError::InvalidFilter(c) => {
                write!(f, "invalid print flag: '{c}'. must be {{ 0, a, s, r, c, o }}")
            }
        }
    }
}

/// Parse one input line into a [`Command`].
///
/// The line is cut at the first control character, mirroring how terminal
/// line endings were stripped historically.
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let end = line.find(|c: char| c < ' ').unwrap_or(line.len());
    let line = &line[..end];

    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let Some(rest) = line.strip_prefix('#') else {
        return Ok(Command::SendMessage(line.to_string()));
    };

    let mut chars = rest.chars();
    let op = chars.next().ok_or(ParseError::UnknownCommand('#'))?;
    let arg = chars.as_str();

    match op {
        'q' => Ok(Command::Quit),
        '+' => Ok(Command::AddEndpoint(parse_number(arg)?)),
        '-' => Ok(Command::RemoveEndpoint(parse_number(arg)?)),
        's' => Ok(Command::SelectEndpoint(parse_number(arg)?)),
        'z' => Ok(Command::ToggleDelay),
        't' => Ok(Command::RunTest(parse_number(arg)?)),
        'd' => Ok(Command::ShowConnections),
        'p' => PrintFilter::parse(arg)
            .map(Command::SetPrintFilter)
            .map_err(ParseError::InvalidFilter),
        'u' => {
            let value: i32 = parse_number(arg)?;
            Ok(Command::SetTransportMode(if value != 0 {
                TransportMode::Reindeer
            } else {
                TransportMode::Ups
            }))
        }
        '@' => Ok(Command::SpecialPackage(parse_number(arg)?)),
        other => Err(ParseError::UnknownCommand(other)),
    }
}

fn parse_number<T: std::str::FromStr>(arg: &str) -> Result<T, ParseError> {
    arg.trim()
        .parse()
        .map_err(|_| ParseError::InvalidNumber(arg.trim().to_string()))
}

/// Spawn the interactive stdin command source.
///
/// Each parsed command is pushed on `commands` and the dispatcher is woken.
/// Parse failures surface as warnings through the sink. When stdin reaches
/// end of file a final `Quit` is delivered so the endpoint shuts down
/// cleanly instead of spinning with a dead source.
pub fn spawn_stdin_source(
    commands: Sender<Command>,
    waker: Arc<Waker>,
    sink: Arc<dyn LogSink>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("command-source".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        sink.emit(Category::Error, &format!("reading command input: {e}"));
                        break;
                    }
                };

                match parse_line(&line) {
                    Ok(command) => {
                        let quit = command == Command::Quit;
                        if commands.send(command).is_err() {
                            return; // dispatcher is gone
                        }
                        let _ = waker.wake();
                        if quit {
                            return;
                        }
                    }
                    Err(ParseError::Empty) => {}
                    Err(e) => sink.emit(Category::Warning, &e.to_string()),
                }
            }

            let _ = commands.send(Command::Quit);
            let _ = waker.wake();
        })
}
