// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::anyhow;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::{
    device::usb::UsbProvider,
    restore::{self, Failure, Flags, RestoreClient},
};

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Restore legacy 32-bit devices by replaying saved signing tickets"
)]
pub struct Cli {
    /// Path to the firmware archive.
    #[arg(value_name = "IPSW")]
    pub ipsw: PathBuf,

    /// Replay a previously issued ticket instead of requesting a new one.
    #[arg(short, long)]
    pub rerestore: bool,

    /// Print debug information.
    #[arg(short, long)]
    pub debug: bool,
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "reticket=debug" } else { "reticket=info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn main(
    logging_initialized: &AtomicBool,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<(), Failure> {
    let cli = Cli::parse();

    init_logging(cli.debug);
    logging_initialized.store(true, Ordering::SeqCst);

    let mut flags = Flags::empty();
    if cli.debug {
        flags |= Flags::DEBUG;
    }
    if cli.rerestore {
        flags |= Flags::RERESTORE;
    }

    let mut client = RestoreClient::new();
    client.set_flags(flags);
    client.set_ipsw(&cli.ipsw);
    client.set_progress_callback(Box::new(|step, fraction| {
        debug!("Progress: {step:?} {:3.0}%", fraction * 100.0);
    }));

    let mut provider = UsbProvider::new().map_err(|e| Failure {
        code: -1,
        source: anyhow!("Could not initialize USB: {e}"),
    })?;

    restore::run(&mut client, &mut provider, cancel_signal)
}
