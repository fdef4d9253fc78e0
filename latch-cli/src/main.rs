// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod cli;
mod commands;
mod config;
mod output;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, MnemonicCommands};
use crate::config::Config;
use crate::output::Output;

fn init_logging(cfg: &Config) {
    let use_json = std::env::var("LATCH_LOG_JSON").is_ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "latch={0},latch_core={0},latch_broker={0}",
            cfg.log_level
        ))
    });

    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let out = Output::new();
    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            out.error(&format!("{e:#}"));
            std::process::exit(1);
        }
    };
    init_logging(&cfg);

    if let Err(e) = run(&out, &cfg, cli) {
        out.error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

#[tracing::instrument(skip_all)]
fn run(out: &Output, cfg: &Config, cli: Cli) -> anyhow::Result<()> {
    let path = match cli.path {
        Some(p) => p,
        None => cfg.vault_path()?,
    };
    debug!(path = %path.display(), "starting command");

    use commands::vault;
    match cli.command {
        Commands::Init => vault::cmd_init(out, cfg, &path),
        Commands::Generate { family, name } => {
            vault::cmd_generate(out, cfg, &path, family.into(), &name)
        }
        Commands::Import { family, name } => {
            vault::cmd_import(out, cfg, &path, family.into(), &name)
        }
        Commands::WatchOnly {
            family,
            public_key,
            name,
            hardware,
        } => vault::cmd_watch_only(out, cfg, &path, family.into(), &public_key, &name, hardware),
        Commands::Derive {
            mnemonic,
            family,
            index,
            name,
        } => vault::cmd_derive(out, cfg, &path, &mnemonic, family.into(), index, &name),
        Commands::Remove { address } => vault::cmd_remove(out, cfg, &path, &address),
        Commands::Mnemonic { command } => match command {
            MnemonicCommands::Add { label } => vault::cmd_mnemonic_add(out, cfg, &path, &label),
            MnemonicCommands::Generate { label, words } => {
                vault::cmd_mnemonic_generate(out, cfg, &path, &label, words)
            }
            MnemonicCommands::Confirm { id } => vault::cmd_mnemonic_confirm(out, cfg, &path, &id),
            MnemonicCommands::Reveal { id } => vault::cmd_mnemonic_reveal(out, cfg, &path, &id),
            MnemonicCommands::List => vault::cmd_mnemonic_list(out, cfg, &path),
        },
        Commands::List => vault::cmd_list(out, cfg, &path),
        Commands::ChangePassword => vault::cmd_change_password(out, cfg, &path),
        Commands::Serve { socket } => {
            let socket = socket.unwrap_or_else(|| cfg.socket_path(&path));
            commands::serve::cmd_serve(out, cfg, &path, &socket)
        }
    }
}
