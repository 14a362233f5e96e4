//! swan-upgrade: build and install a newer Libreswan from source
//!
//! Existing `ipsec.conf` and IKEv2 settings are carried over, with
//! directives the new version no longer accepts rewritten in place.

mod pipeline;
mod source;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use ikev2kit_common::config::DEFAULT_CONFIG_PATH;
use ikev2kit_common::net::HttpFetcher;
use ikev2kit_common::os::{self, OsInfo};
use ikev2kit_common::prompt::StdinPrompt;
use ikev2kit_common::{logging, Config, Error, SystemRunner};

use pipeline::Upgrader;

#[derive(Parser, Debug)]
#[command(name = "swan-upgrade")]
#[command(about = "Upgrade Libreswan by compiling it from source")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    logging::init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<Error>() {
                Some(Error::Aborted) => eprintln!("{}", Error::Aborted),
                _ => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config file: {}", cli.config.display()))?;

    os::check_not_openvz()?;
    let os = OsInfo::detect()?;
    log::debug!("Detected {} {}", os.family, os.version_id);

    let runner = SystemRunner;
    let fetch = HttpFetcher::new(&config.network).context("Failed to create HTTP client")?;
    let mut prompt = StdinPrompt;
    let mut stdout = io::stdout();
    Upgrader {
        config,
        runner: &runner,
        fetch: &fetch,
        prompt: &mut prompt,
        out: &mut stdout,
    }
    .run(os)
}
