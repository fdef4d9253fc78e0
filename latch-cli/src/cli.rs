// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use latch_core::NetworkFamily;

#[derive(Parser)]
#[command(name = "latch")]
#[command(about = "Wallet secret store and approval broker for EVM and substrate accounts")]
#[command(version)]
pub(crate) struct Cli {
    #[arg(short, long, global = true, help = "Vault file")]
    pub path: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Family {
    Evm,
    Substrate,
}

impl From<Family> for NetworkFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Evm => NetworkFamily::Evm,
            Family::Substrate => NetworkFamily::Substrate,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    Init,
    Generate {
        #[arg(short, long, value_enum, default_value = "evm")]
        family: Family,
        #[arg(short, long, default_value = "default")]
        name: String,
    },
    Import {
        #[arg(short, long, value_enum, default_value = "evm")]
        family: Family,
        #[arg(short, long, default_value = "imported")]
        name: String,
    },
    /// Adds an account whose secret stays on another device.
    WatchOnly {
        #[arg(short, long, value_enum)]
        family: Family,
        #[arg(long, help = "Hex-encoded public key")]
        public_key: String,
        #[arg(short, long, default_value = "watch-only")]
        name: String,
        #[arg(long, help = "Signatures come from a hardware device")]
        hardware: bool,
    },
    Derive {
        #[arg(short, long, help = "Mnemonic id")]
        mnemonic: String,
        #[arg(short, long, value_enum, default_value = "evm")]
        family: Family,
        #[arg(short, long, default_value = "0")]
        index: u32,
        #[arg(short, long, default_value = "derived")]
        name: String,
    },
    Remove {
        #[arg(help = "Account address")]
        address: String,
    },
    Mnemonic {
        #[command(subcommand)]
        command: MnemonicCommands,
    },
    List,
    ChangePassword,
    Serve {
        #[arg(short, long, help = "Unix socket to listen on")]
        socket: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub(crate) enum MnemonicCommands {
    Add {
        #[arg(short, long, default_value = "imported")]
        label: String,
    },
    Generate {
        #[arg(short, long, default_value = "default")]
        label: String,
        #[arg(short, long, default_value = "24")]
        words: usize,
    },
    Confirm {
        #[arg(help = "Mnemonic id")]
        id: String,
    },
    Reveal {
        #[arg(help = "Mnemonic id")]
        id: String,
    },
    List,
}
