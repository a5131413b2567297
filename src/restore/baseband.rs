// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Baseband firmware reconciliation.
//!
//! The replayed restore must ship a baseband signed under the latest
//! firmware. When the local archive's BasebandFirmware manifest entry is
//! structurally identical to the latest manifest's entry, the local blob is
//! reused; otherwise the blob is range-fetched out of the remote archive.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use phf::phf_map;
use plist::{Dictionary, Value};
use tracing::{debug, info};

use super::Flags;
use crate::{
    format::manifest::{BuildIdentity, BuildManifest},
    ipsw::Ipsw,
    partialzip, util,
    version::VersionData,
};

const REMOTE_MANIFEST_NAME: &str = "BuildManifest_New.plist";
const BASEBAND_TMP_NAME: &str = "bbfw.tmp";

/// Remote build identity index per device. The latest-firmware manifests
/// interleave Erase and Update identities per model in a fixed order.
static IDENTITY_INDEX: phf::Map<&'static str, usize> = phf_map! {
    "iPhone5,2" => 0,
    "iPad3,5" => 0,
    "iPhone5,4" => 2,
    "iPad3,6" => 2,
    "iPhone5,1" => 4,
    "iPad3,4" => 4,
    "iPhone5,3" => 6,
};

fn identity_index(product: &str, update: bool) -> Option<usize> {
    IDENTITY_INDEX
        .get(product)
        .map(|&index| if update { index + 1 } else { index })
}

/// Structural equality of two BasebandFirmware manifest entries. The `Info`
/// subtree differs by construction (it holds archive paths) and is ignored.
fn entries_match(local: &Dictionary, remote: &Dictionary) -> bool {
    if local.len() != remote.len() {
        return false;
    }

    for (key, local_value) in local.iter() {
        let Some(remote_value) = remote.get(key) else {
            debug!("{key} missing from latest manifest");
            return false;
        };

        match (local_value, remote_value) {
            (Value::Data(a), Value::Data(b)) => {
                if a.len() != b.len() || a != b {
                    debug!("{key} does not match the latest manifest entry");
                    return false;
                }
            }
            (Value::Integer(a), Value::Integer(b)) => {
                if a != b {
                    debug!("{key} does not match the latest manifest entry");
                    return false;
                }
            }
            (Value::Dictionary(_), Value::Dictionary(_)) if key == "Info" => {}
            _ => {
                debug!("Unhandled entry {key}");
                return false;
            }
        }
    }

    true
}

/// Artifacts produced by reconciliation.
pub struct BasebandArtifacts {
    /// Local path of the baseband blob to restore, when the device has one.
    pub baseband_path: Option<PathBuf>,
    /// Where the latest firmware's manifest was stored.
    pub remote_manifest_path: PathBuf,
}

pub fn reconcile(
    version_data: &VersionData,
    ipsw: &Ipsw,
    local_identity: &BuildIdentity,
    product: &str,
    flags: Flags,
    cache_dir: Option<&Path>,
) -> Result<BasebandArtifacts> {
    let fw = version_data
        .latest_firmware(product)
        .context("Cannot resolve latest firmware URL")?;
    debug!("Latest firmware: {}", fw.url);

    let base_dir = cache_dir.map_or_else(PathBuf::new, Path::to_path_buf);
    if !base_dir.as_os_str().is_empty() {
        fs::create_dir_all(&base_dir)?;
    }
    let manifest_path = base_dir.join(REMOTE_MANIFEST_NAME);
    let baseband_path = base_dir.join(BASEBAND_TMP_NAME);

    partialzip::download_file(&fw.url, "BuildManifest.plist", &manifest_path)
        .context("Failed to fetch latest BuildManifest")?;

    let remote_manifest = BuildManifest::from_reader(fs::File::open(&manifest_path)?)
        .context("Failed to parse latest BuildManifest")?;
    let remote_version = remote_manifest.version_info()?;

    let index = identity_index(product, flags.contains(Flags::UPDATE));
    let remote_identity = if remote_version.build_major >= 14 {
        let index = index.ok_or_else(|| {
            anyhow!("No identity index for {product} in a {} manifest", remote_version.build)
        })?;
        remote_manifest
            .identity_at(index)?
            .ok_or_else(|| anyhow!("Latest manifest has no identity at index {index}"))?
    } else {
        remote_manifest
            .identity_at(0)?
            .ok_or_else(|| anyhow!("Latest manifest has no identities"))?
    };

    let Ok(remote_bbfw_path) = remote_identity.component_path("BasebandFirmware") else {
        info!("No BasebandFirmware in latest manifest");
        return Ok(BasebandArtifacts {
            baseband_path: None,
            remote_manifest_path: manifest_path,
        });
    };

    let local_entry = if local_identity.has_component("BasebandFirmware") {
        local_identity
            .manifest()
            .and_then(|m| m.get("BasebandFirmware"))
            .and_then(Value::as_dictionary)
    } else {
        None
    };
    let remote_entry = remote_identity
        .manifest()
        .and_then(|m| m.get("BasebandFirmware"))
        .and_then(Value::as_dictionary);

    let matches = match (local_entry, remote_entry) {
        (Some(local), Some(remote)) if !remote.is_empty() => entries_match(local, remote),
        (_, Some(remote)) if remote.is_empty() => {
            return Ok(BasebandArtifacts {
                baseband_path: None,
                remote_manifest_path: manifest_path,
            });
        }
        _ => false,
    };

    if matches {
        info!("Local baseband matches the latest manifest entry, using local file");
        let local_path = local_identity.component_path("BasebandFirmware")?;
        let data = ipsw
            .extract_to_memory(&local_path)
            .context("Failed to extract baseband from archive")?;
        fs::write(&baseband_path, data)?;
    } else {
        info!("Downloading baseband firmware");
        let name = util::url_basename(&remote_bbfw_path);
        debug!("Remote baseband: {name}");
        partialzip::download_file(&fw.url, &remote_bbfw_path, &baseband_path)
            .context("Failed to fetch baseband firmware")?;
    }

    Ok(BasebandArtifacts {
        baseband_path: Some(baseband_path),
        remote_manifest_path: manifest_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(digest: &[u8], chip_id: u64, with_info: Option<&str>) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("Digest".into(), Value::Data(digest.to_vec()));
        dict.insert("ChipID".into(), Value::Integer(chip_id.into()));
        if let Some(path) = with_info {
            let mut info = Dictionary::new();
            info.insert("Path".into(), Value::String(path.into()));
            dict.insert("Info".into(), Value::Dictionary(info));
        }
        dict
    }

    #[test]
    fn entries_differing_only_in_info_match() {
        let local = entry(&[1; 20], 0x10, Some("Firmware/Mav5-Local.bbfw"));
        let remote = entry(&[1; 20], 0x10, Some("Firmware/Mav5-Remote.bbfw"));
        assert!(entries_match(&local, &remote));
    }

    #[test]
    fn differing_digests_force_download() {
        let local = entry(&[1; 20], 0x10, None);
        let remote = entry(&[2; 20], 0x10, None);
        assert!(!entries_match(&local, &remote));
    }

    #[test]
    fn differing_uints_force_download() {
        let local = entry(&[1; 20], 0x10, None);
        let remote = entry(&[1; 20], 0x11, None);
        assert!(!entries_match(&local, &remote));
    }

    #[test]
    fn size_mismatch_forces_download() {
        let local = entry(&[1; 20], 0x10, Some("a"));
        let remote = entry(&[1; 20], 0x10, None);
        assert!(!entries_match(&local, &remote));
    }

    #[test]
    fn unexpected_types_force_download() {
        let mut local = entry(&[1; 20], 0x10, None);
        let mut remote = entry(&[1; 20], 0x10, None);
        local.insert("Note".into(), Value::String("x".into()));
        remote.insert("Note".into(), Value::String("x".into()));
        assert!(!entries_match(&local, &remote));
    }

    #[test]
    fn identity_index_table() {
        assert_eq!(identity_index("iPhone5,2", false), Some(0));
        assert_eq!(identity_index("iPhone5,2", true), Some(1));
        assert_eq!(identity_index("iPad3,4", false), Some(4));
        assert_eq!(identity_index("iPhone5,3", true), Some(7));
        assert_eq!(identity_index("iPhone9,1", false), None);
    }
}
