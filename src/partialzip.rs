// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Range-fetching of single files out of remote ZIP archives.
//!
//! Instead of downloading a multi-hundred-megabyte firmware archive for one
//! manifest or baseband blob, this reads the end-of-central-directory record
//! and central directory via HTTP Range requests and then fetches only the
//! target entry's bytes.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
    time::Duration,
};

use byteorder::{ByteOrder, LittleEndian};
use flate2::read::DeflateDecoder;
use memchr::memmem;
use thiserror::Error;
use tracing::debug;

pub const EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";
const CD_ENTRY_MAGIC: &[u8; 4] = b"PK\x01\x02";
const LOCAL_HEADER_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// EOCD is 22 bytes plus up to a 64 KiB archive comment.
const EOCD_SEARCH_WINDOW: u64 = 22 + 65536;

const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot find EOCD magic")]
    EocdMagicNotFound,
    #[error("Server did not return a Content-Length")]
    MissingContentLength,
    #[error("Server returned {actual} bytes for a {expected} byte range")]
    ShortRange { expected: u64, actual: u64 },
    #[error("No such entry in remote archive: {0}")]
    EntryNotFound(String),
    #[error("Invalid local file header for entry: {0}")]
    InvalidLocalHeader(String),
    #[error("Unsupported compression method: {0}")]
    UnsupportedMethod(u16),
    #[error("HTTP request failed")]
    Http(#[from] attohttpc::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Eocd {
    cd_offset: u64,
    cd_size: u64,
}

/// Locate the EOCD record in the archive's trailing bytes. The magic is
/// searched back to front since an archive comment may contain arbitrary
/// data.
fn find_eocd(tail: &[u8]) -> Result<Eocd> {
    let mut search_end = tail.len();
    while let Some(pos) = memmem::rfind(&tail[..search_end], EOCD_MAGIC) {
        if tail.len() - pos >= 22 {
            let record = &tail[pos..];
            return Ok(Eocd {
                cd_size: u64::from(LittleEndian::read_u32(&record[12..16])),
                cd_offset: u64::from(LittleEndian::read_u32(&record[16..20])),
            });
        }
        search_end = pos;
    }

    Err(Error::EocdMagicNotFound)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CdEntry {
    method: u16,
    compressed_size: u64,
    local_header_offset: u64,
}

/// Scan central directory bytes for an entry by exact name.
fn find_entry(cd: &[u8], name: &str) -> Result<CdEntry> {
    let mut offset = 0;

    while offset + 46 <= cd.len() {
        let record = &cd[offset..];
        if &record[0..4] != CD_ENTRY_MAGIC {
            break;
        }

        let method = LittleEndian::read_u16(&record[10..12]);
        let compressed_size = u64::from(LittleEndian::read_u32(&record[20..24]));
        let name_len = LittleEndian::read_u16(&record[28..30]) as usize;
        let extra_len = LittleEndian::read_u16(&record[30..32]) as usize;
        let comment_len = LittleEndian::read_u16(&record[32..34]) as usize;
        let local_header_offset = u64::from(LittleEndian::read_u32(&record[42..46]));

        if 46 + name_len > record.len() {
            break;
        }
        if &record[46..46 + name_len] == name.as_bytes() {
            return Ok(CdEntry {
                method,
                compressed_size,
                local_header_offset,
            });
        }

        offset += 46 + name_len + extra_len + comment_len;
    }

    Err(Error::EntryNotFound(name.to_owned()))
}

/// Size of the local file header preceding the entry data.
fn local_header_size(header: &[u8], name: &str) -> Result<u64> {
    if header.len() < 30 || &header[0..4] != LOCAL_HEADER_MAGIC {
        return Err(Error::InvalidLocalHeader(name.to_owned()));
    }
    let name_len = u64::from(LittleEndian::read_u16(&header[26..28]));
    let extra_len = u64::from(LittleEndian::read_u16(&header[28..30]));
    Ok(30 + name_len + extra_len)
}

fn content_length(url: &str) -> Result<u64> {
    let response = attohttpc::head(url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .send()
        .and_then(|r| r.error_for_status())?;

    response
        .headers()
        .get("Content-Length")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse().ok())
        .ok_or(Error::MissingContentLength)
}

fn fetch_range(url: &str, start: u64, len: u64) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut response = attohttpc::get(url)
        .connect_timeout(TIMEOUT)
        .read_timeout(TIMEOUT)
        .header("Range", &format!("bytes={}-{}", start, start + len - 1))
        .send()
        .and_then(|r| r.error_for_status())?;

    let mut data = Vec::with_capacity(len as usize);
    response.read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(Error::ShortRange {
            expected: len,
            actual: data.len() as u64,
        });
    }

    Ok(data)
}

/// Fetch a single entry from the remote archive at `url` into `dest`.
pub fn download_file(url: &str, name: &str, dest: &Path) -> Result<()> {
    let file_size = content_length(url)?;
    let window = EOCD_SEARCH_WINDOW.min(file_size);
    let tail = fetch_range(url, file_size - window, window)?;
    let eocd = find_eocd(&tail)?;

    let cd = fetch_range(url, eocd.cd_offset, eocd.cd_size)?;
    let entry = find_entry(&cd, name)?;

    debug!(
        "Entry {name} at offset {:#x}, {} bytes compressed",
        entry.local_header_offset, entry.compressed_size
    );

    let header = fetch_range(url, entry.local_header_offset, 30)?;
    let data_offset = entry.local_header_offset + local_header_size(&header, name)?;
    let compressed = fetch_range(url, data_offset, entry.compressed_size)?;

    let mut file = File::create(dest)?;
    match entry.method {
        METHOD_STORE => file.write_all(&compressed)?,
        METHOD_DEFLATE => {
            io::copy(&mut DeflateDecoder::new(compressed.as_slice()), &mut file)?;
        }
        method => return Err(Error::UnsupportedMethod(method)),
    }
    file.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use zip::{write::FileOptions, CompressionMethod, ZipWriter};

    use super::*;

    fn build_archive() -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(
                "BuildManifest.plist",
                FileOptions::default().compression_method(CompressionMethod::Deflated),
            )
            .unwrap();
        writer.write_all(b"<plist><dict/></plist>").unwrap();
        writer
            .start_file(
                "Firmware/Mav5-11.80.00.Release.bbfw",
                FileOptions::default().compression_method(CompressionMethod::Stored),
            )
            .unwrap();
        writer.write_all(b"baseband").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn locates_entries_through_central_directory() {
        let archive = build_archive();
        let window = EOCD_SEARCH_WINDOW.min(archive.len() as u64) as usize;
        let eocd = find_eocd(&archive[archive.len() - window..]).unwrap();

        let cd = &archive[eocd.cd_offset as usize..(eocd.cd_offset + eocd.cd_size) as usize];
        let entry = find_entry(cd, "Firmware/Mav5-11.80.00.Release.bbfw").unwrap();
        assert_eq!(entry.method, METHOD_STORE);
        assert_eq!(entry.compressed_size, 8);

        let header = &archive[entry.local_header_offset as usize..];
        let data_offset = entry.local_header_offset
            + local_header_size(&header[..30], "Firmware/Mav5-11.80.00.Release.bbfw").unwrap();
        assert_eq!(
            &archive[data_offset as usize..data_offset as usize + 8],
            b"baseband"
        );

        assert_matches!(find_entry(cd, "missing"), Err(Error::EntryNotFound(_)));
    }

    #[test]
    fn inflates_deflated_entries() {
        let archive = build_archive();
        let window = EOCD_SEARCH_WINDOW.min(archive.len() as u64) as usize;
        let eocd = find_eocd(&archive[archive.len() - window..]).unwrap();
        let cd = &archive[eocd.cd_offset as usize..(eocd.cd_offset + eocd.cd_size) as usize];

        let entry = find_entry(cd, "BuildManifest.plist").unwrap();
        assert_eq!(entry.method, METHOD_DEFLATE);

        let header = &archive[entry.local_header_offset as usize..];
        let data_offset = (entry.local_header_offset
            + local_header_size(&header[..30], "BuildManifest.plist").unwrap())
            as usize;
        let compressed = &archive[data_offset..data_offset + entry.compressed_size as usize];

        let mut inflated = Vec::new();
        DeflateDecoder::new(compressed)
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, b"<plist><dict/></plist>");
    }

    #[test]
    fn rejects_data_without_eocd() {
        assert_matches!(find_eocd(&[0u8; 64]), Err(Error::EocdMagicNotFound));
    }
}
