use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server that echoes JSON queries and prints JSON messages.
    Serve(ServeArgs),
    /// Connect, send one JSON message or query, and exit.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (port 0 picks a free port).
    pub addr: String,
    /// Require clients to present this value in their `token` property.
    #[arg(long, env = "WIRELINK_TOKEN")]
    pub token: Option<String>,
    /// Server name used in logs.
    #[arg(long, default_value = "wirelink-serve")]
    pub name: String,
    /// Close pending connections whose handshake is rejected.
    #[arg(long)]
    pub close_rejected: bool,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server address to connect to.
    pub addr: String,
    /// JSON document to send.
    #[arg(long)]
    pub json: String,
    /// Send as a query and print the response.
    #[arg(long)]
    pub query: bool,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", requires = "query")]
    pub timeout: String,
    /// Client name presented in the handshake.
    #[arg(long, default_value = "wirelink-send")]
    pub name: String,
    /// Token presented in the handshake's `token` property.
    #[arg(long, env = "WIRELINK_TOKEN")]
    pub token: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
