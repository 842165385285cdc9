// Copyright (C) 2026 The hplink authors
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// hplink: HP 48/49 serial file transfer and object inspection
mod bits;
mod crc;
mod packet;
mod protocol;
mod receiver;
mod scanner;
mod sender;
mod serial;
mod server;
mod session;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serialport::Parity;

use serial::{PortConfig, RealSerialPort, SerialPort};
use server::ServerLink;
use session::{CancelFlag, SessionOptions, TransferEvent, expected_packets};

#[derive(Parser)]
#[command(name = "hplink")]
#[command(about = "File transfer and object inspection for HP 48/49 calculators", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1). Required for every
    /// command except `info`.
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "9600", global = true)]
    baud: u32,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none", global = true)]
    parity: String,

    /// Per-read timeout in milliseconds. Defaults to 3000 for plain sends
    /// and 500 for server commands.
    #[arg(long, value_name = "MS", global = true)]
    timeout: Option<u64>,

    /// Retries tolerated per packet before giving up
    #[arg(long, default_value = "9", global = true)]
    retry: u32,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect a local object file: ROM revision, checksum and size
    Info {
        /// File to inspect
        file: PathBuf,
        /// Name the object will be stored under; the reported size
        /// includes its length. Defaults to the file stem.
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Send a file to a calculator waiting in receive mode
    Send {
        /// File to send
        file: PathBuf,
    },
    /// Store a file as a variable via the calculator's server
    Put {
        /// File to store
        file: PathBuf,
        /// Variable name; defaults to the file stem
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Fetch a variable from the calculator's server
    Get {
        /// Variable name
        name: String,
        /// Output file; defaults to the variable name
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the server's current directory
    Ls,
    /// Show the calculator's free memory
    Mem,
    /// Show the server's version banner
    Version,
    /// Evaluate an expression on the calculator
    Eval {
        /// Expression to evaluate
        expr: String,
    },
    /// Change the server's current directory
    Cd {
        /// Directory name
        dir: String,
    },
    /// Return the server to the HOME directory
    Home,
    /// Move the server one directory up
    Updir,
    /// Terminate server mode on the calculator
    Quit,
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!(
            "Invalid parity: {}. Must be 'none', 'odd', or 'even'",
            parity
        )),
    }
}

fn open_port(cli: &Cli) -> Result<RealSerialPort, String> {
    let name = cli
        .port
        .as_deref()
        .ok_or("a serial port is required; pass --port")?;
    let parity = parse_parity(&cli.parity)?;
    let config = PortConfig {
        baud_rate: cli.baud,
        parity,
        ..PortConfig::default()
    };
    RealSerialPort::open(name, config)
        .map_err(|e| format!("Failed to open serial port {}: {}", name, e))
}

/// Long-timeout options for a calculator driven by hand on the other end.
fn session_options(cli: &Cli) -> SessionOptions {
    let mut opts = SessionOptions::default();
    if let Some(ms) = cli.timeout {
        opts.timeout = Duration::from_millis(ms);
    }
    opts.retry_limit = cli.retry;
    opts
}

/// Short-timeout options for an already-connected server.
fn server_options(cli: &Cli) -> SessionOptions {
    let mut opts = SessionOptions::server();
    if let Some(ms) = cli.timeout {
        opts.timeout = Duration::from_millis(ms);
    }
    opts.retry_limit = cli.retry;
    opts
}

/// Progress printer shared by all transfer commands.
fn print_event(event: TransferEvent) {
    match event {
        TransferEvent::Progress { total, success, errors } => {
            print!("\rPacket {} sent, {} ok, {} errors", total, success, errors);
            let _ = io::stdout().flush();
        }
        TransferEvent::Done { total, success } => {
            println!("\rTransfer complete: {} of {} packets", success, total);
        }
        TransferEvent::Failed { reason } => {
            println!("\rTransfer failed: {}", reason);
        }
        TransferEvent::Cancelled => {
            println!("\rTransfer cancelled");
        }
    }
}

/// Variable name implied by a file path: the stem, as the calculator
/// would store it.
fn variable_name(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

fn info(file: &Path, name: Option<&str>) -> Result<(), String> {
    let mut f = File::open(file).map_err(|e| format!("{}: {}", file.display(), e))?;
    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| variable_name(file));

    match scanner::scan(&mut f, &name) {
        Ok(record) => {
            println!("{}: HP binary object", file.display());
            println!("  ROM revision: {}", record.rom_revision);
            println!("  Checksum:     #{:04X}h", record.checksum);
            println!("  Size:         {} bytes", record.byte_length);
            Ok(())
        }
        Err(scanner::ScanError::InvalidHeader) => {
            let mut f = File::open(file).map_err(|e| format!("{}: {}", file.display(), e))?;
            let mut leading = [0u8; 5];
            let n = f.read(&mut leading).map_err(|e| e.to_string())?;
            if scanner::is_ascii_object(&leading[..n]) {
                println!("{}: HP ASCII object (no checksum)", file.display());
            } else {
                println!("{}: not an HP object", file.display());
            }
            Ok(())
        }
        Err(e) => Err(format!("{}: {}", file.display(), e)),
    }
}

fn send(cli: &Cli, file: &Path) -> Result<(), String> {
    let mut port = open_port(cli)?;
    let size = std::fs::metadata(file)
        .map_err(|e| format!("{}: {}", file.display(), e))?
        .len();
    let mut source = File::open(file).map_err(|e| format!("{}: {}", file.display(), e))?;

    println!("Sending {} ({} bytes)", file.display(), size);
    let mut events = print_event;
    let fsm = sender::SendFsm::new(
        &mut port,
        &mut source,
        expected_packets(size),
        session_options(cli),
        &mut events,
        CancelFlag::new(),
    );
    sender::run_send(fsm).map_err(|e| e.to_string())
}

fn with_server<F>(cli: &Cli, f: F) -> Result<(), String>
where
    F: FnOnce(&mut ServerLink) -> Result<(), String>,
{
    let mut port = open_port(cli)?;
    let serial: &mut dyn SerialPort = &mut port;
    let mut link = ServerLink::new(serial, server_options(cli));
    f(&mut link)
}

fn put(cli: &Cli, file: &Path, name: Option<&str>) -> Result<(), String> {
    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| variable_name(file));
    let size = std::fs::metadata(file)
        .map_err(|e| format!("{}: {}", file.display(), e))?
        .len();
    let mut source = File::open(file).map_err(|e| format!("{}: {}", file.display(), e))?;

    with_server(cli, |link| {
        println!("Storing {} as '{}' ({} bytes)", file.display(), name, size);
        let mut events = print_event;
        link.put(&name, &mut source, size, &mut events, CancelFlag::new())
            .map_err(|e| e.to_string())
    })
}

fn get(cli: &Cli, name: &str, output: Option<&Path>) -> Result<(), String> {
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(name));

    with_server(cli, |link| {
        // the listing size lets the block padding be trimmed afterwards
        let true_size = link
            .listing()
            .map_err(|e| e.to_string())?
            .into_iter()
            .find(|v| v.name == name)
            .map(|v| v.size.ceil() as usize);

        let mut buffer = Vec::new();
        let mut events = print_event;
        link.get(name, &mut buffer, &mut events, CancelFlag::new())
            .map_err(|e| e.to_string())?;

        if let Some(size) = true_size {
            buffer.truncate(size);
        }
        std::fs::write(&path, &buffer).map_err(|e| format!("{}: {}", path.display(), e))?;
        println!("Wrote {} ({} bytes)", path.display(), buffer.len());
        Ok(())
    })
}

fn ls(cli: &Cli) -> Result<(), String> {
    with_server(cli, |link| {
        let (memory, vars) = link.refresh().map_err(|e| e.to_string())?;
        for var in &vars {
            println!(
                "{:<16} {:>10.1}  prolog #{:04X}h  crc #{:04X}h",
                var.name, var.size, var.prolog, var.crc
            );
        }
        println!("{} variables, {} bytes free", vars.len(), memory);
        Ok(())
    })
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match &cli.command {
        Commands::Info { file, name } => info(file, name.as_deref()),
        Commands::Send { file } => send(&cli, file),
        Commands::Put { file, name } => put(&cli, file, name.as_deref()),
        Commands::Get { name, output } => get(&cli, name, output.as_deref()),
        Commands::Ls => ls(&cli),
        Commands::Mem => with_server(&cli, |link| {
            let memory = link.memory().map_err(|e| e.to_string())?;
            println!("{} bytes free", memory);
            Ok(())
        }),
        Commands::Version => with_server(&cli, |link| {
            let banner = link.version().map_err(|e| e.to_string())?;
            println!("{}", banner);
            Ok(())
        }),
        Commands::Eval { expr } => with_server(&cli, |link| {
            link.eval(expr).map_err(|e| e.to_string())
        }),
        Commands::Cd { dir } => with_server(&cli, |link| {
            link.chdir(dir).map_err(|e| e.to_string())
        }),
        Commands::Home => with_server(&cli, |link| link.home().map_err(|e| e.to_string())),
        Commands::Updir => with_server(&cli, |link| link.updir().map_err(|e| e.to_string())),
        Commands::Quit => with_server(&cli, |link| link.quit().map_err(|e| e.to_string())),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
