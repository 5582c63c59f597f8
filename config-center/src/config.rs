use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use raft_store::membership::raft_addr;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a config center node.
    Serve(ServeArgs),
}

/// Flags override values read from `--config`.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// YAML settings file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub node_id: Option<u64>,

    /// HTTP address to serve the API on.
    #[arg(long)]
    pub listen: Option<String>,

    /// Raft transport address. Defaults to the HTTP port plus 1000.
    #[arg(long)]
    pub raft_addr: Option<String>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Start a new single-member cluster.
    #[arg(long)]
    pub bootstrap: bool,

    /// HTTP address of a running member to join through.
    #[arg(long)]
    pub join: Option<String>,

    /// Cluster secret the internal token is derived from.
    #[arg(long)]
    pub secret: Option<String>,

    /// Users allowed to administer every app. Repeatable.
    #[arg(long = "admin")]
    pub admins: Vec<String>,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node_id: u64,
    pub listen: String,
    pub raft_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub bootstrap: bool,
    pub join: Option<String>,
    pub secret: String,
    pub admins: Vec<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen: "127.0.0.1:8080".to_string(),
            raft_addr: None,
            data_dir: None,
            bootstrap: false,
            join: None,
            secret: "config-center".to_string(),
            admins: vec!["admin".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse settings in {}", path.display()))
    }

    /// Settings from the optional file, overridden by the given flags.
    pub fn load(args: &ServeArgs) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(node_id) = args.node_id {
            settings.node_id = node_id;
        }
        if let Some(listen) = &args.listen {
            settings.listen = listen.clone();
        }
        if args.raft_addr.is_some() {
            settings.raft_addr = args.raft_addr.clone();
        }
        if args.data_dir.is_some() {
            settings.data_dir = args.data_dir.clone();
        }
        settings.bootstrap |= args.bootstrap;
        if args.join.is_some() {
            settings.join = args.join.clone();
        }
        if let Some(secret) = &args.secret {
            settings.secret = secret.clone();
        }
        if !args.admins.is_empty() {
            settings.admins = args.admins.clone();
        }
        if let Some(level) = &args.log_level {
            settings.log_level = level.clone();
        }
        Ok(settings)
    }

    pub fn raft_addr(&self) -> Result<String> {
        match &self.raft_addr {
            Some(addr) => Ok(addr.clone()),
            None => raft_addr(&self.listen).context("cannot derive the raft address"),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("data/node-{}", self.node_id)))
    }
}
