//! evio-echo: a line-echo server on the evio reactor.
//!
//! Every full line a client sends comes back prefixed with `ECHO: `.
//! Partial lines are buffered per connection until the newline arrives.
//! Configuration comes from CLI arguments and an optional TOML file;
//! CLI values take precedence.

use clap::Parser;
use evio::{Io, ListenArgs, Protocol, Reactor, StartArgs, UserData};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "evio-echo")]
#[command(version = "0.1.0")]
#[command(about = "A line-echo server on the evio reactor", long_about = None)]
struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind URL (e.g. tcp://127.0.0.1:3000 or unix:///tmp/echo.sock)
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// User threads per worker (negative values are core fractions)
    #[arg(short = 't', long)]
    threads: Option<i16>,

    /// Worker processes (0 = single process)
    #[arg(short = 'w', long)]
    workers: Option<i16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    threads: i16,
    #[serde(default)]
    workers: i16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            threads: 0,
            workers: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "tcp://0.0.0.0:3000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The echo protocol: buffer until newline, reply with a prefix.
struct EchoLine;

impl EchoLine {
    fn line_buffer(io: &Io) -> Option<Arc<Mutex<Vec<u8>>>> {
        io.udata()
            .and_then(|udata| udata.downcast::<Mutex<Vec<u8>>>().ok())
    }
}

impl Protocol for EchoLine {
    fn on_data(&self, io: &Io) {
        let Some(buffer) = Self::line_buffer(io) else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            let n = io.read(&mut chunk);
            if n == 0 {
                break;
            }
            let mut pending = buffer.lock().unwrap();
            pending.extend_from_slice(&chunk[..n]);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let mut reply = Vec::with_capacity(line.len() + 6);
                reply.extend_from_slice(b"ECHO: ");
                reply.extend_from_slice(&line);
                io.write2(reply.into());
            }
        }
    }

    fn on_close(&self, _udata: UserData) {
        debug!("client disconnected");
    }

    fn timeout(&self) -> u32 {
        30
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    let toml_config: TomlConfig = match &cli.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => TomlConfig::default(),
    };

    let listen_url = cli.listen.unwrap_or(toml_config.server.listen);
    let threads = cli.threads.unwrap_or(toml_config.server.threads);
    let workers = cli.workers.unwrap_or(toml_config.server.workers);
    let log_level = if cli.log_level != "info" {
        cli.log_level
    } else {
        toml_config.logging.level
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let reactor = Reactor::new();
    let protocol: Arc<dyn Protocol> = Arc::new(EchoLine);
    let bound = reactor.listen(ListenArgs::new(listen_url, move |fd, r| {
        let buffer: UserData = Some(Arc::new(Mutex::new(Vec::<u8>::new())));
        if let Err(err) = r.attach_fd(fd, protocol.clone(), buffer, None) {
            debug!(fd, error = %err, "couldn't attach client");
        }
    }))?;

    info!(addr = %bound, threads, workers, "echo server ready");
    reactor.start(StartArgs { threads, workers });
    Ok(())
}
