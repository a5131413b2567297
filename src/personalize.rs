// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Per-component personalization: combining a raw firmware image with the
//! ticket material the device's boot chain will accept.

use std::fs;

use plist::Dictionary;
use thiserror::Error;
use tracing::{info, warn};

use crate::{format::img3, tss};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Ticket carries an Image4 blob; this tool only personalizes IMG3 firmware")]
    Image4Unsupported,
    #[error("Unable to replace {0} signature")]
    Stitch(String, #[source] img3::Error),
    #[error("Failed to write personalized {0}")]
    Keep(String, #[source] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Produce the signed image for one component.
///
/// With a per-component blob in the ticket, the blob is stitched into the
/// image's signature slot; without one the image passes through unchanged.
/// When `keep_personalized` is set, each produced image is also written to
/// the working directory under the component name.
pub fn personalize(
    name: &str,
    data: &[u8],
    tss: Option<&Dictionary>,
    keep_personalized: bool,
) -> Result<Vec<u8>> {
    let stitched = match tss {
        Some(tss) if tss::img4_ticket(tss).is_some() => {
            return Err(Error::Image4Unsupported);
        }
        Some(tss) => match tss::blob_for_entry(tss, name) {
            Some(blob) => img3::stitch_signature(data, &blob)
                .map_err(|e| Error::Stitch(name.to_owned(), e))?,
            None => {
                info!("Not personalizing component {name}");
                data.to_vec()
            }
        },
        None => {
            info!("Not personalizing component {name}");
            data.to_vec()
        }
    };

    if keep_personalized {
        fs::write(name, &stitched).map_err(|e| Error::Keep(name.to_owned(), e))?;
    }

    Ok(stitched)
}

/// Canonical component name for a firmware filename, eg.
/// `applelogo@2x~iphone.s5l8950x.img3` -> `AppleLogo`.
pub fn component_name(filename: &str) -> &str {
    static PREFIXES: &[(&str, &str)] = &[
        ("LLB", "LLB"),
        ("iBoot", "iBoot"),
        ("iBSS", "iBSS"),
        ("iBEC", "iBEC"),
        ("DeviceTree", "DeviceTree"),
        ("applelogo", "AppleLogo"),
        ("liquiddetect", "Liquid"),
        ("recoverymode", "RecoveryMode"),
        ("batterylow0", "BatteryLow0"),
        ("batterylow1", "BatteryLow1"),
        ("glyphcharging", "BatteryCharging"),
        ("glyphplugin", "BatteryPlugin"),
        ("batterycharging0", "BatteryCharging0"),
        ("batterycharging1", "BatteryCharging1"),
        ("batteryfull", "BatteryFull"),
        ("needservice", "NeedService"),
        ("SCAB", "SCAB"),
        ("sep-firmware", "RestoreSEP"),
    ];

    for (prefix, name) in PREFIXES {
        if filename.starts_with(prefix) {
            return name;
        }
    }

    warn!("Unhandled component {filename:?}");
    filename
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use plist::Value;

    use super::*;

    fn image_with_signature_slot() -> Vec<u8> {
        let mut tags = Vec::new();
        // DATA tag.
        tags.extend_from_slice(b"ATAD");
        tags.extend_from_slice(&28u32.to_le_bytes());
        tags.extend_from_slice(&16u32.to_le_bytes());
        tags.extend_from_slice(&[0x42; 16]);
        // SHSH tag with a 128 byte slot.
        tags.extend_from_slice(b"HSHS");
        tags.extend_from_slice(&140u32.to_le_bytes());
        tags.extend_from_slice(&128u32.to_le_bytes());
        tags.extend_from_slice(&[0; 128]);

        let mut image = Vec::new();
        image.extend_from_slice(img3::HEADER_MAGIC);
        image.extend_from_slice(&((0x14 + tags.len()) as u32).to_le_bytes());
        image.extend_from_slice(&(tags.len() as u32).to_le_bytes());
        image.extend_from_slice(&(tags.len() as u32).to_le_bytes());
        image.extend_from_slice(b"lnrk");
        image.extend_from_slice(&tags);
        image
    }

    fn ticket_with_blob(name: &str, blob: &[u8]) -> Dictionary {
        let mut entry = Dictionary::new();
        entry.insert("Blob".into(), Value::Data(blob.to_vec()));
        let mut tss = Dictionary::new();
        tss.insert(name.into(), Value::Dictionary(entry));
        tss
    }

    #[test]
    fn stitches_component_blob() {
        let image = image_with_signature_slot();
        let tss = ticket_with_blob("KernelCache", &[0x77; img3::BLOB_SIZE]);

        let out = personalize("KernelCache", &image, Some(&tss), false).unwrap();
        assert_ne!(out, image);
        assert!(memchr::memmem::find(&out, &[0x77; img3::BLOB_SIZE]).is_some());
    }

    #[test]
    fn passes_through_without_blob() {
        let image = image_with_signature_slot();
        let tss = ticket_with_blob("KernelCache", &[0x77; img3::BLOB_SIZE]);

        let out = personalize("DeviceTree", &image, Some(&tss), false).unwrap();
        assert_eq!(out, image);

        let out = personalize("DeviceTree", &image, None, false).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn rejects_img4_tickets() {
        let mut tss = Dictionary::new();
        tss.insert("ApImg4Ticket".into(), Value::Data(vec![0x30, 0x82]));

        assert_matches!(
            personalize("KernelCache", &[], Some(&tss), false),
            Err(Error::Image4Unsupported)
        );
    }

    #[test]
    fn stitch_failure_is_fatal() {
        let tss = ticket_with_blob("KernelCache", &[0x77; img3::BLOB_SIZE]);
        assert_matches!(
            personalize("KernelCache", &[0u8; 4], Some(&tss), false),
            Err(Error::Stitch(_, _))
        );
    }

    #[test]
    fn component_names_from_filenames() {
        assert_eq!(component_name("applelogo@2x~iphone.img3"), "AppleLogo");
        assert_eq!(component_name("sep-firmware.n42.RELEASE.im4p"), "RestoreSEP");
        assert_eq!(component_name("unknown.bin"), "unknown.bin");
    }
}
