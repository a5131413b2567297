// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! On-disk ticket cache files.
//!
//! A cached ticket is a gzip-compressed property list. The decompressed body
//! is either a binary plist (detected by its `bplist00` prefix) or XML. New
//! files are always written as gzip-wrapped binary plists.

use std::{
    fs::File,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use plist::{Dictionary, Value};
use thiserror::Error;

const BPLIST_MAGIC: &[u8; 8] = b"bplist00";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Ticket file is not a property list dictionary")]
    NotADictionary,
    #[error("Failed to parse ticket property list")]
    Plist(#[from] plist::Error),
    #[error("I/O error on ticket file")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Cache filename for a ticket: `<ECID>-<product>-<version>-<build>.shsh`
/// under the `shsh` subdirectory.
pub fn ticket_path(
    cache_dir: Option<&Path>,
    ecid: u64,
    product: &str,
    version: &str,
    build: &str,
) -> PathBuf {
    let mut path = cache_dir.map_or_else(PathBuf::new, Path::to_path_buf);
    path.push("shsh");
    path.push(format!("{ecid}-{product}-{version}-{build}.shsh"));
    path
}

pub fn load_ticket(path: &Path) -> Result<Dictionary> {
    let mut body = Vec::new();
    GzDecoder::new(File::open(path)?).read_to_end(&mut body)?;

    let value = if body.len() >= BPLIST_MAGIC.len() && &body[..BPLIST_MAGIC.len()] == BPLIST_MAGIC
    {
        Value::from_reader(Cursor::new(&body))?
    } else {
        Value::from_reader_xml(Cursor::new(&body))?
    };

    match value {
        Value::Dictionary(dict) => Ok(dict),
        _ => Err(Error::NotADictionary),
    }
}

pub fn save_ticket(path: &Path, ticket: &Dictionary) -> Result<()> {
    let mut body = Vec::new();
    Value::Dictionary(ticket.clone()).to_writer_binary(Cursor::new(&mut body))?;

    let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
    encoder.write_all(&body)?;
    encoder.finish()?;

    Ok(())
}
