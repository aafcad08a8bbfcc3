//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap (`relay` and `peer` subcommands)
//! - TOML configuration file with peer defaults
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{DEFAULT_RELAY_PORT, DEFAULT_SIGNAL_URL};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_FILE: &str = "roomdrop.toml";

/// Roomdrop - share files directly with devices in the same room.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for persistent data (device identity, logs).
    /// Defaults to ~/.roomdrop/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling relay.
    Relay {
        /// Address to bind on.
        #[clap(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on.
        #[clap(long, env = "PORT", default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
    },
    /// Join a room and exchange files with the devices in it.
    Peer(PeerArgs),
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct PeerArgs {
    /// Shared room phrase; everyone using the same phrase meets in one room.
    #[clap(long)]
    pub room: String,

    /// WebSocket URL of the relay.
    #[clap(long)]
    pub signal_url: Option<String>,

    /// Display name for this device (not persisted).
    #[clap(long)]
    pub name: Option<String>,

    /// Where received files are written.
    #[clap(long)]
    pub out: Option<PathBuf>,

    /// File to send to every peer in the room. Repeatable.
    #[clap(long = "send")]
    pub send: Vec<PathBuf>,

    /// Only send to this device id.
    #[clap(long)]
    pub to: Option<String>,
}

/// Peer defaults read from `roomdrop.toml`.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub signal_url: Option<String>,
    pub name: Option<String>,
    pub out: Option<PathBuf>,
}

impl PeerArgs {
    pub fn signal_url(&self) -> &str {
        self.signal_url.as_deref().unwrap_or(DEFAULT_SIGNAL_URL)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.out.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Fill unset values from `file` (CLI takes precedence).
    fn merge(mut self, file: FileConfig) -> Self {
        if self.signal_url.is_none() {
            self.signal_url = file.signal_url;
        }
        if self.name.is_none() {
            self.name = file.name;
        }
        if self.out.is_none() {
            self.out = file.out;
        }
        self
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(resolve_path);

        if let Command::Peer(peer) = &mut cli_args.command {
            if let Some(file) = FileConfig::from_file(Path::new(CONFIG_FILE)) {
                *peer = std::mem::take(peer).merge(file);
            }
            peer.out = peer.out.take().map(resolve_path);
            peer.send = std::mem::take(&mut peer.send)
                .into_iter()
                .map(resolve_path)
                .collect();
        }

        cli_args
    }
}

impl FileConfig {
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Option<Self> {
        match toml::from_str::<FileConfig>(content) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(event = "config_parse_failure", error = %e, "Ignoring invalid {CONFIG_FILE}");
                None
            }
        }
    }
}

/// Resolve a potentially relative path to an absolute one.
fn resolve_path(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}
