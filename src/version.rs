// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Cached copy of the vendor's version index document.
//!
//! The index maps product types to their latest signed firmware URLs and
//! also carries the recovery ("WTF") firmware URLs for the oldest devices.
//! A copy is kept on disk and reused for up to a day before being refetched.

use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::{Duration, SystemTime},
};

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{download, util};

pub const VERSION_URL: &str = "http://itunes.apple.com/check/version";

const VERSION_XML: &str = "version.xml";

/// How long a cached copy stays fresh.
const MAX_AGE: Duration = Duration::from_secs(86400);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not load version data from {0:?}")]
    Unavailable(PathBuf),
    #[error("No firmware URL for product {0:?} in version data")]
    NoFirmwareUrl(String),
    #[error("Firmware digest mismatch for {0}")]
    DigestMismatch(String),
    #[error("Failed to parse version data")]
    Plist(#[from] plist::Error),
    #[error("Download failed")]
    Download(#[from] download::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn is_fresh(mtime: SystemTime, now: SystemTime) -> bool {
    now.duration_since(mtime).map_or(true, |age| age <= MAX_AGE)
}

pub struct VersionData {
    root: Dictionary,
}

/// Load the version index, refetching when the on-disk copy is missing or
/// older than a day. A corrupt cached copy is deleted so the next run can
/// refetch it.
pub fn load(cache_dir: Option<&Path>, cancel_signal: &AtomicBool) -> Result<VersionData> {
    let path = match cache_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            dir.join(VERSION_XML)
        }
        None => PathBuf::from(VERSION_XML),
    };

    let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
    let cached = mtime.is_some_and(|mtime| is_fresh(mtime, SystemTime::now()));

    if !cached {
        let tmp = path.with_extension("xml.tmp");
        match download::download_to_file(VERSION_URL, &tmp, cancel_signal) {
            Ok(()) => {
                fs::rename(&tmp, &path)?;
                info!("Updated version data");
            }
            Err(e) => {
                warn!("Could not update version data: {e}");
                let _ = fs::remove_file(&tmp);
            }
        }
    }

    let mut xml = Vec::new();
    File::open(&path)
        .map_err(|_| Error::Unavailable(path.clone()))?
        .read_to_end(&mut xml)?;

    let root = match Value::from_reader_xml(xml.as_slice()) {
        Ok(Value::Dictionary(dict)) => dict,
        _ => {
            // Do not leave a corrupt file around for the next run.
            let _ = fs::remove_file(&path);
            return Err(Error::Unavailable(path));
        }
    };

    if cached {
        info!("Using cached version data");
    }

    Ok(VersionData { root })
}

/// Latest firmware reference for one product type.
pub struct FirmwareRef {
    pub url: String,
    pub sha1: Option<Vec<u8>>,
}

impl VersionData {
    pub fn from_dict(root: Dictionary) -> Self {
        Self { root }
    }

    fn access(&self, path: &[&str]) -> Option<&Value> {
        let mut node = self.root.get(path[0])?;
        for key in &path[1..] {
            node = node.as_dictionary()?.get(key)?;
        }
        Some(node)
    }

    /// URL (and digest, when present) of the latest signed firmware for
    /// `product`.
    pub fn latest_firmware(&self, product: &str) -> Result<FirmwareRef> {
        let restore = self
            .access(&[
                "MobileDeviceSoftwareVersionsByVersion",
                "5",
                "MobileDeviceSoftwareVersions",
                product,
                "Unknown",
                "Universal",
                "Restore",
            ])
            .and_then(Value::as_dictionary)
            .ok_or_else(|| Error::NoFirmwareUrl(product.to_owned()))?;

        let url = restore
            .get("FirmwareURL")
            .and_then(Value::as_string)
            .ok_or_else(|| Error::NoFirmwareUrl(product.to_owned()))?
            .to_owned();
        let sha1 = restore
            .get("FirmwareSHA1")
            .and_then(Value::as_string)
            .and_then(|s| hex::decode(s).ok());

        Ok(FirmwareRef { url, sha1 })
    }

    /// URL of the recovery firmware used to move a WTF mode device into DFU.
    pub fn wtf_firmware_url(&self) -> Option<String> {
        self.access(&[
            "MobileDeviceSoftwareVersionsByVersion",
            "5",
            "RecoverySoftwareVersions",
            "WTF",
            "304218112",
            "5",
            "FirmwareURL",
        ])
        .and_then(Value::as_string)
        .map(str::to_owned)
    }
}

/// Download the latest firmware archive for `product` into the cache
/// directory, reusing an existing download. Returns the local path.
pub fn download_latest_firmware(
    version_data: &VersionData,
    product: &str,
    cache_dir: Option<&Path>,
    cancel_signal: &AtomicBool,
) -> Result<PathBuf> {
    let fw = version_data.latest_firmware(product)?;
    let name = util::url_basename(&fw.url);

    let path = match cache_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            dir.join(name)
        }
        None => PathBuf::from(name),
    };

    if path.is_file() {
        debug!("Reusing downloaded firmware {path:?}");
        return Ok(path);
    }

    info!("Downloading {} ...", fw.url);
    download::download_to_file(&fw.url, &path, cancel_signal)?;

    if let Some(expected) = &fw.sha1 {
        let digest = sha1_file(&path)?;
        if digest != *expected {
            let _ = fs::remove_file(&path);
            return Err(Error::DigestMismatch(name.to_owned()));
        }
    }

    Ok(path)
}

fn sha1_file(path: &Path) -> Result<Vec<u8>> {
    let mut context = ring::digest::Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);
    let mut file = File::open(path)?;
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }
    Ok(context.finish().as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_window() {
        let now = SystemTime::now();
        assert!(is_fresh(now - Duration::from_secs(60), now));
        assert!(is_fresh(now - MAX_AGE, now));
        assert!(!is_fresh(now - MAX_AGE - Duration::from_secs(1), now));
        // A file from the future is not stale.
        assert!(is_fresh(now + Duration::from_secs(60), now));
    }

    #[test]
    fn firmware_url_lookup() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0"><dict>
              <key>MobileDeviceSoftwareVersionsByVersion</key><dict>
                <key>5</key><dict>
                  <key>MobileDeviceSoftwareVersions</key><dict>
                    <key>iPhone5,2</key><dict>
                      <key>Unknown</key><dict>
                        <key>Universal</key><dict>
                          <key>Restore</key><dict>
                            <key>FirmwareURL</key><string>http://example.com/iPhone5,2_10.3.4.ipsw</string>
                            <key>FirmwareSHA1</key><string>00112233445566778899aabbccddeeff00112233</string>
                          </dict>
                        </dict>
                      </dict>
                    </dict>
                  </dict>
                  <key>RecoverySoftwareVersions</key><dict>
                    <key>WTF</key><dict>
                      <key>304218112</key><dict>
                        <key>5</key><dict>
                          <key>FirmwareURL</key><string>http://example.com/x12220000_5_Recovery.ipsw</string>
                        </dict>
                      </dict>
                    </dict>
                  </dict>
                </dict>
              </dict>
            </dict></plist>"#;

        let root = match Value::from_reader_xml(xml.as_bytes()).unwrap() {
            Value::Dictionary(dict) => dict,
            _ => unreachable!(),
        };
        let data = VersionData::from_dict(root);

        let fw = data.latest_firmware("iPhone5,2").unwrap();
        assert_eq!(fw.url, "http://example.com/iPhone5,2_10.3.4.ipsw");
        assert_eq!(fw.sha1.unwrap().len(), 20);

        assert!(matches!(
            data.latest_firmware("iPhone9,1"),
            Err(Error::NoFirmwareUrl(_))
        ));

        assert_eq!(
            data.wtf_firmware_url().unwrap(),
            "http://example.com/x12220000_5_Recovery.ipsw"
        );
    }
}
