// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Access to the local firmware archive (a ZIP file) and the shared
//! filesystem cache directory.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info};
use zip::{result::ZipError, ZipArchive};

use crate::format::manifest::BuildManifest;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Firmware archive does not exist: {0:?}")]
    ArchiveNotFound(PathBuf),
    #[error("No such entry in archive: {0}")]
    EntryNotFound(String),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Failed to parse BuildManifest")]
    Manifest(#[from] crate::format::manifest::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

const COPY_BUF_SIZE: usize = 65536;

/// A local firmware archive. The file is reopened for every operation so
/// that a long-lived [`Ipsw`] does not pin a file descriptor.
#[derive(Debug, Clone)]
pub struct Ipsw {
    path: PathBuf,
}

impl Ipsw {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::ArchiveNotFound(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive(&self) -> Result<ZipArchive<File>> {
        Ok(ZipArchive::new(File::open(&self.path)?)?)
    }

    /// Uncompressed size of an entry, or [`Error::EntryNotFound`].
    pub fn entry_size(&self, name: &str) -> Result<u64> {
        let mut archive = self.archive()?;
        let result = match archive.by_name(name) {
            Ok(entry) => Ok(entry.size()),
            Err(ZipError::FileNotFound) => Err(Error::EntryNotFound(name.to_owned())),
            Err(e) => Err(e.into()),
        };
        result
    }

    pub fn extract_to_memory(&self, name: &str) -> Result<Vec<u8>> {
        let mut archive = self.archive()?;
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(Error::EntryNotFound(name.to_owned())),
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Stream an entry to `dest`, checking the cancel signal between chunks.
    pub fn extract_to_file(
        &self,
        name: &str,
        dest: &Path,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let mut archive = self.archive()?;
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(Error::EntryNotFound(name.to_owned())),
            Err(e) => return Err(e.into()),
        };

        let total = entry.size();
        debug!("Extracting {name} ({total} bytes) to {dest:?}");

        let mut file = File::create(dest)?;
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            if cancel_signal.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let n = entry.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
        }
        file.flush()?;

        Ok(())
    }
}

/// Parse the archive's BuildManifest. Also reports whether the firmware is
/// ticket-enabled so the caller doesn't need to reparse.
pub fn extract_build_manifest(ipsw: &Ipsw) -> Result<(BuildManifest, bool)> {
    let data = ipsw.extract_to_memory("BuildManifest.plist")?;
    let manifest = BuildManifest::from_reader(io::Cursor::new(data))?;
    let ticket_enabled = manifest.ticket_enabled();
    Ok((manifest, ticket_enabled))
}

/// Cache location for the extracted filesystem of an archive:
/// `<cache>/<archive stem>/<fs entry>`. Without a cache directory the
/// directory is created next to the archive.
pub fn cached_filesystem_path(cache_dir: Option<&Path>, ipsw_path: &Path, entry: &str) -> PathBuf {
    let mut base = match cache_dir {
        Some(dir) => dir.to_path_buf(),
        None => ipsw_path.parent().map_or_else(PathBuf::new, Path::to_path_buf),
    };
    base.push(crate::util::archive_stem(ipsw_path));
    base.push(entry);
    base
}

/// Advisory lock file guarding sentinel creation in the shared filesystem
/// cache. Acquisition creates `<path>` exclusively, retrying while another
/// process holds it. The lock is removed on drop.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    const RETRY_INTERVAL: Duration = Duration::from_millis(100);
    const MAX_RETRIES: u32 = 600;

    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..Self::MAX_RETRIES {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    thread::sleep(Self::RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // A stale lock from a dead process; take it over.
        info!("Breaking stale lock {:?}", path);
        fs::remove_file(path)?;
        OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use zip::{write::FileOptions, ZipWriter};

    use super::*;

    fn write_test_archive(dir: &Path) -> PathBuf {
        let path = dir.join("Device_1.0_1A1.ipsw");
        let mut writer = ZipWriter::new(File::create(&path).unwrap());
        writer
            .start_file("Firmware/dfu/iBSS.dfu", FileOptions::default())
            .unwrap();
        writer.write_all(b"bootstrap image").unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn extracts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw = Ipsw::open(&write_test_archive(dir.path())).unwrap();

        assert_eq!(
            ipsw.extract_to_memory("Firmware/dfu/iBSS.dfu").unwrap(),
            b"bootstrap image"
        );
        assert_eq!(ipsw.entry_size("Firmware/dfu/iBSS.dfu").unwrap(), 15);

        assert!(matches!(
            ipsw.extract_to_memory("missing"),
            Err(Error::EntryNotFound(_))
        ));
    }

    #[test]
    fn filesystem_cache_path_uses_archive_stem() {
        let path = cached_filesystem_path(
            Some(Path::new("/cache")),
            Path::new("/fw/Device_1.0_1A1.ipsw"),
            "058-1234.dmg",
        );
        assert_eq!(path, Path::new("/cache/Device_1.0_1A1/058-1234.dmg"));
    }

    #[test]
    fn lock_file_excludes_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.lock");

        let lock = LockFile::acquire(&path).unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn missing_archive_is_an_error() {
        assert!(matches!(
            Ipsw::open(Path::new("/nonexistent/fw.ipsw")),
            Err(Error::ArchiveNotFound(_))
        ));
    }
}
