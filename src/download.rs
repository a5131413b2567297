// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Plain HTTP downloads of whole files.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("HTTP request failed")]
    Http(#[from] attohttpc::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Download `url` to `dest`, streaming in chunks so the cancel signal is
/// honored mid-transfer.
pub fn download_to_file(url: &str, dest: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    debug!("Downloading {url} to {dest:?}");

    let mut response = attohttpc::get(url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .send()
        .and_then(|r| r.error_for_status())?;

    let mut file = File::create(dest)?;
    let mut buf = [0u8; 65536];
    loop {
        if cancel_signal.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }
    file.flush()?;

    Ok(())
}
