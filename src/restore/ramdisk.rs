// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Matching a previously issued ticket against the manifest's ramdisks.
//!
//! A replayed ticket authorizes exactly one RestoreRamDisk. To find out
//! whether it was issued for an Erase or an Update restore, the signed
//! region of the candidate ramdisk is hashed and the digest searched for in
//! the raw ticket bytes, flipping the build identity once if the first
//! candidate does not match.

use anyhow::Result;
use memchr::memmem;
use plist::Dictionary;
use ring::digest;
use tracing::{debug, warn};

use super::Flags;
use crate::{
    format::{
        img3,
        manifest::{Behavior, BuildIdentity, BuildManifest},
    },
    ipsw::Ipsw,
    tss,
};

const RAMDISK_COMPONENT: &str = "RestoreRamDisk";

/// What the reconciliation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The ticket authorizes the now-selected identity's ramdisk.
    Authorized,
    /// The ramdisk is unsigned or matches nothing; this is a custom restore.
    Custom,
    /// Reconciliation could not run to a conclusion; the identity is
    /// unchanged.
    Inconclusive,
}

fn select(
    manifest: &BuildManifest,
    model: &str,
    behavior: Behavior,
) -> Result<Option<BuildIdentity>> {
    Ok(manifest.identity_for_model_and_behavior(model, Some(behavior))?)
}

fn set_behavior(flags: &mut Flags, behavior: Behavior) {
    match behavior {
        Behavior::Erase => {
            flags.remove(Flags::UPDATE);
            flags.insert(Flags::ERASE);
        }
        Behavior::Update => {
            flags.remove(Flags::ERASE);
            flags.insert(Flags::UPDATE);
        }
    }
}

/// Decide which build identity the ticket actually authorizes.
///
/// `flags` and `identity` are always updated together; on every exit path
/// they agree with each other.
pub fn reconcile(
    manifest: &BuildManifest,
    ipsw: &Ipsw,
    model: &str,
    flags: &mut Flags,
    identity: &mut BuildIdentity,
    ticket: &Dictionary,
) -> Result<Outcome> {
    let Some(ticket_data) = tss::ap_ticket(ticket) else {
        warn!("No raw ticket in signing response; skipping ramdisk check");
        return Ok(Outcome::Inconclusive);
    };

    let mut behavior = if flags.contains(Flags::UPDATE) {
        Behavior::Update
    } else {
        Behavior::Erase
    };

    for tries in 0..2 {
        let path = match identity.component_path(RAMDISK_COMPONENT) {
            Ok(path) => path,
            Err(e) => {
                warn!("Unable to get path for component {RAMDISK_COMPONENT}: {e}");
                return Ok(Outcome::Inconclusive);
            }
        };

        let ramdisk = match ipsw.extract_to_memory(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Unable to extract component {RAMDISK_COMPONENT}: {e}");
                return Ok(Outcome::Inconclusive);
            }
        };

        if ramdisk.len() < img3::MIN_SIZE {
            debug!("Ramdisk too small to be a signed image");
            return Ok(Outcome::Inconclusive);
        }

        // An unsigned ramdisk never matches a ticket; assume a custom
        // restore and stop probing.
        if img3::is_unsigned(&ramdisk) {
            flags.insert(Flags::CUSTOM);
            return Ok(Outcome::Custom);
        }

        let digest = digest::digest(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            img3::signed_region(&ramdisk)?,
        );

        if memmem::find(&ticket_data, digest.as_ref()).is_some() {
            debug!("Found {} ramdisk hash in ticket", behavior.as_str());
            return Ok(Outcome::Authorized);
        }

        if tries == 0 {
            // Flip to the other behavior and try once more.
            let flipped = behavior.other();
            match select(manifest, model, flipped)? {
                Some(candidate) => {
                    debug!(
                        "Ramdisk hash not in ticket; trying the {} identity",
                        flipped.as_str()
                    );
                    *identity = candidate;
                    set_behavior(flags, flipped);
                    behavior = flipped;
                }
                None => {
                    // Nothing to flip to; keep what we started with.
                    debug!("No {} identity in manifest", flipped.as_str());
                    return Ok(Outcome::Inconclusive);
                }
            }
        } else {
            // Neither ramdisk hash is in the ticket. Fall back to Erase and
            // treat the restore as custom.
            if let Some(erase) = select(manifest, model, Behavior::Erase)? {
                *identity = erase;
            }
            set_behavior(flags, Behavior::Erase);
            flags.insert(Flags::CUSTOM);
            return Ok(Outcome::Custom);
        }
    }

    unreachable!("reconciliation loop always returns within two tries")
}
