use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// One line of command output.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event<'a> {
    Listening {
        addr: SocketAddr,
    },
    Connected {
        peer: &'a str,
        id: String,
    },
    Disconnected {
        peer: &'a str,
        id: String,
    },
    Message {
        type_tag: &'a str,
        peer: &'a str,
        document: Option<&'a Value>,
        timestamp: String,
    },
    Response {
        type_tag: &'a str,
        document: Option<&'a Value>,
        elapsed_ms: u128,
    },
    Sent {
        type_tag: &'a str,
        addr: &'a str,
    },
}

pub fn print_event(event: &Event<'_>, format: OutputFormat) {
    let line = match format {
        OutputFormat::Json => {
            serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Pretty => pretty(event),
    };
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn pretty(event: &Event<'_>) -> String {
    match event {
        Event::Listening { addr } => format!("listening on {addr}"),
        Event::Connected { peer, id } => format!("+ {peer} ({id})"),
        Event::Disconnected { peer, id } => format!("- {peer} ({id})"),
        Event::Message {
            type_tag,
            peer,
            document,
            ..
        } => format!("{type_tag} from {peer}: {}", document_preview(*document)),
        Event::Response {
            type_tag,
            document,
            elapsed_ms,
        } => format!("{type_tag} in {elapsed_ms}ms: {}", document_preview(*document)),
        Event::Sent { type_tag, addr } => format!("sent {type_tag} to {addr}"),
    }
}

fn document_preview(document: Option<&Value>) -> String {
    match document {
        Some(document) => document.to_string(),
        None => "<empty>".to_string(),
    }
}

pub fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
