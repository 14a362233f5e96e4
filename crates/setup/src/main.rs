//! ikev2-setup: set up IKEv2 on a Libreswan VPN server
//!
//! Creates the VPN CA, server and client certificates in the IPsec NSS
//! database, writes the `ikev2-cp` connection and exports client bundles.

mod cli;
mod workflow;

#[cfg(test)]
mod fake;

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use ikev2kit_common::net::HttpFetcher;
use ikev2kit_common::prompt::StdinPrompt;
use ikev2kit_common::{logging, Config, Error, SystemRunner};

use cli::{Cli, Mode};
use workflow::{Setup, SetupContext};

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
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mode = Mode::from_cli(&cli);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config file: {}", cli.config.display()))?;
    config.setup.apply_env();

    let runner = SystemRunner;
    let fetch = HttpFetcher::new(&config.network).context("Failed to create HTTP client")?;
    let ctx = SetupContext::probe(config, &runner)?;

    let mut prompt = StdinPrompt;
    let mut stdout = io::stdout();
    let mut setup = Setup {
        ctx,
        runner: &runner,
        fetch: &fetch,
        prompt: &mut prompt,
        out: &mut stdout,
        jitter: true,
    };
    setup.run(mode)
}

fn report(e: &anyhow::Error) {
    match e.downcast_ref::<Error>() {
        Some(Error::Aborted) => eprintln!("{}", Error::Aborted),
        _ => eprintln!("Error: {:#}", e),
    }
}
