use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use ikev2kit_common::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(name = "ikev2-setup")]
#[command(about = "Set up IKEv2 on a Libreswan VPN server and manage its clients")]
#[command(version)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
pub struct Cli {
    /// Run IKEv2 setup in auto mode using default options (for initial setup only)
    #[arg(long, group = "mode")]
    pub auto: bool,

    /// Add a new client using default options
    #[arg(long, value_name = "CLIENT", group = "mode")]
    pub addclient: Option<String>,

    /// Export configuration for an existing client
    #[arg(long, value_name = "CLIENT", group = "mode")]
    pub exportclient: Option<String>,

    /// List the names of existing clients
    #[arg(long, group = "mode")]
    pub listclients: bool,

    /// Revoke an existing client's certificate
    #[arg(long, value_name = "CLIENT", group = "mode")]
    pub revokeclient: Option<String>,

    /// Remove IKEv2 and delete all certificates and keys from the IPsec database
    #[arg(long, group = "mode")]
    pub removeikev2: bool,

    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// What this invocation should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Full setup without prompts
    Auto,
    AddClient(String),
    ExportClient(String),
    ListClients,
    RevokeClient(String),
    Remove,
    /// Guided setup, or the management menu when IKEv2 is already set up
    Interactive,
}

impl Mode {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.auto {
            Mode::Auto
        } else if let Some(name) = &cli.addclient {
            Mode::AddClient(name.clone())
        } else if let Some(name) = &cli.exportclient {
            Mode::ExportClient(name.clone())
        } else if cli.listclients {
            Mode::ListClients
        } else if let Some(name) = &cli.revokeclient {
            Mode::RevokeClient(name.clone())
        } else if cli.removeikev2 {
            Mode::Remove
        } else {
            Mode::Interactive
        }
    }

    /// Modes that only make sense once IKEv2 has been set up
    pub fn needs_existing_setup(&self) -> bool {
        matches!(
            self,
            Mode::AddClient(_) | Mode::ExportClient(_) | Mode::ListClients | Mode::RevokeClient(_)
        )
    }
}
