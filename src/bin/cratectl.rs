use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crated::rpc::{Payload, Request, Response};

/// cratectl — client for the crated container daemon.
#[derive(Parser, Debug)]
#[command(name = "cratectl", version, about)]
struct Cli {
    /// Daemon socket path.
    #[arg(long, default_value = "/run/crated.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List containers.
    List,
    /// Create a container.
    Create { name: String },
    /// Destroy a container and its subtree.
    Destroy { name: String },
    /// Start a container.
    Start { name: String },
    /// Stop a container, SIGKILLing its tasks.
    Stop {
        name: String,
        /// Milliseconds to wait for the tasks to die.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Freeze a running container.
    Pause { name: String },
    /// Thaw a paused container.
    Resume { name: String },
    /// Read a property.
    Get { name: String, key: String },
    /// Write a property.
    Set { name: String, key: String, value: String },
    /// Read a data field, optionally indexed (e.g. a stream offset).
    Data {
        name: String,
        key: String,
        index: Option<String>,
    },
    /// List container properties and data fields.
    Plist,
    /// List volume properties.
    Vlist,
    /// Block until a container stops.
    Wait {
        name: String,
        /// Milliseconds to wait.
        #[arg(long, default_value_t = 60_000)]
        timeout: u64,
    },
    /// Print the daemon version.
    Version,
}

fn to_request(command: Command) -> Request {
    match command {
        Command::List => Request::ListContainers,
        Command::Create { name } => Request::Create { name },
        Command::Destroy { name } => Request::Destroy { name },
        Command::Start { name } => Request::Start { name },
        Command::Stop { name, timeout } => Request::Stop {
            name,
            timeout_ms: timeout,
        },
        Command::Pause { name } => Request::Pause { name },
        Command::Resume { name } => Request::Resume { name },
        Command::Get { name, key } => Request::GetProperty { name, key },
        Command::Set { name, key, value } => Request::SetProperty { name, key, value },
        Command::Data { name, key, index } => Request::GetData { name, key, index },
        Command::Plist => Request::ListProperties,
        Command::Vlist => Request::ListVolumeProperties,
        Command::Wait { name, timeout } => Request::Wait {
            name,
            timeout_ms: timeout,
        },
        Command::Version => Request::GetVersion,
    }
}

fn roundtrip(socket: &PathBuf, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .with_context(|| format!("cannot connect to {}", socket.display()))?;
    let mut writer = stream.try_clone()?;
    let mut body = serde_json::to_string(request)?;
    body.push('\n');
    writer.write_all(body.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).context("daemon closed the connection")?;
    Ok(serde_json::from_str(&line).context("cannot parse daemon response")?)
}

fn print_payload(payload: Payload) {
    match payload {
        Payload::None => {}
        Payload::Value(value) => println!("{value}"),
        Payload::Names(names) => {
            for name in names {
                println!("{name}");
            }
        }
        Payload::Fields(fields) => {
            let width = fields.iter().map(|f| f.name.len()).max().unwrap_or(0);
            for field in fields {
                let marker = if field.read_only { "(ro) " } else { "" };
                println!("  {:<width$}  {marker}{}", field.name, field.desc);
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let request = to_request(cli.command);
    let response = roundtrip(&cli.socket, &request)?;
    if !response.is_success() {
        bail!(
            "{}: {}",
            response.error,
            if response.description.is_empty() {
                "request failed".to_string()
            } else {
                response.description
            }
        );
    }
    print_payload(response.payload);
    Ok(())
}
