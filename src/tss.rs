// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Client for the online signing service.
//!
//! A signing request is a property list assembled from device parameters
//! and the chosen build identity's manifest. The service answers with a
//! form-encoded status line whose `REQUEST_STRING` field carries the ticket
//! dictionary.

use std::time::Duration;

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::{debug, info};

/// Official signing endpoint.
pub const TSS_URL: &str = "http://gs.apple.com/TSS/controller?action=2";
/// Community mirror holding previously issued tickets.
pub const CYDIA_TSS_URL: &str = "http://cydia.saurik.com/TSS/controller?action=2";

const CLIENT_VERSION: &str = "libauthinstall-293.1.16";

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signing server rejected request: status {status}: {message}")]
    ServerStatus { status: i64, message: String },
    #[error("Malformed signing server response")]
    MalformedResponse,
    #[error("HTTP request failed")]
    Http(#[from] attohttpc::Error),
    #[error("Property list error")]
    Plist(#[from] plist::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Copy identity-level signing parameters and the component manifest out of
/// the chosen build identity.
pub fn parameters_from_identity(
    parameters: &mut Dictionary,
    identity: &crate::format::manifest::BuildIdentity,
) {
    let dict = identity.as_dict();
    for key in [
        "ApChipID",
        "ApBoardID",
        "ApSecurityDomain",
        "UniqueBuildID",
    ] {
        if let Some(value) = dict.get(key) {
            parameters.insert(key.to_owned(), value.clone());
        }
    }
    if let Some(manifest) = dict.get("Manifest") {
        parameters.insert("Manifest".to_owned(), manifest.clone());
    }
}

/// A signing request under construction.
pub struct Request {
    dict: Dictionary,
}

impl Request {
    pub fn new() -> Self {
        let mut dict = Dictionary::new();
        dict.insert("@HostPlatformInfo".into(), Value::String("mac".into()));
        dict.insert("@VersionInfo".into(), Value::String(CLIENT_VERSION.into()));
        Self { dict }
    }

    fn copy_from(&mut self, parameters: &Dictionary, keys: &[&str]) {
        for key in keys {
            if let Some(value) = parameters.get(*key) {
                self.dict.insert((*key).to_owned(), value.clone());
            }
        }
    }

    pub fn add_common_tags(&mut self, parameters: &Dictionary) {
        self.copy_from(
            parameters,
            &[
                "ApECID",
                "UniqueBuildID",
                "ApChipID",
                "ApBoardID",
                "ApSecurityDomain",
                "ApProductionMode",
            ],
        );
    }

    /// Add one entry per firmware component from the manifest parameters.
    /// The per-component `Info` subtree is local bookkeeping and never sent.
    pub fn add_ap_tags(&mut self, parameters: &Dictionary) {
        let Some(manifest) = parameters.get("Manifest").and_then(Value::as_dictionary) else {
            return;
        };

        for (name, entry) in manifest.iter() {
            if name == "BasebandFirmware" {
                continue;
            }
            let Some(entry) = entry.as_dictionary() else {
                continue;
            };
            let mut trimmed = entry.clone();
            trimmed.remove("Info");
            self.dict.insert(name.clone(), Value::Dictionary(trimmed));
        }
    }

    pub fn add_ap_img3_tags(&mut self, parameters: &Dictionary) {
        self.copy_from(parameters, &["ApNonce"]);
        self.dict.insert("@APTicket".into(), Value::Boolean(true));
    }

    pub fn add_ap_img4_tags(&mut self, parameters: &Dictionary) {
        self.copy_from(parameters, &["ApNonce", "ApSecurityMode"]);
        if let Some(nonce) = parameters.get("ApSepNonce") {
            self.dict.insert("SepNonce".into(), nonce.clone());
        }
        self.dict
            .insert("@ApImg4Ticket".into(), Value::Boolean(true));
    }

    pub fn add_baseband_tags(&mut self, parameters: &Dictionary) {
        self.copy_from(
            parameters,
            &["BbNonce", "BbChipID", "BbGoldCertId", "BbSNUM"],
        );

        if let Some(entry) = parameters
            .get("Manifest")
            .and_then(Value::as_dictionary)
            .and_then(|m| m.get("BasebandFirmware"))
            .and_then(Value::as_dictionary)
        {
            let mut trimmed = entry.clone();
            trimmed.remove("Info");
            self.dict
                .insert("BasebandFirmware".into(), Value::Dictionary(trimmed));
        }

        self.dict.insert("@BBTicket".into(), Value::Boolean(true));
    }

    /// POST the request and parse the response into the ticket dictionary.
    pub fn send(&self, url: &str) -> Result<Dictionary> {
        let mut body = Vec::new();
        Value::Dictionary(self.dict.clone()).to_writer_xml(&mut body)?;

        info!("Sending signing request to {url}");
        let response = attohttpc::post(url)
            .connect_timeout(TIMEOUT)
            .read_timeout(TIMEOUT)
            .header("Cache-Control", "no-cache")
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("User-Agent", "InetURL/1.0")
            .bytes(body)
            .send()
            .and_then(|r| r.error_for_status())?;

        parse_response(&response.text()?)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// The server's `STATUS=…&MESSAGE=…&REQUEST_STRING=…` response body.
fn parse_response(body: &str) -> Result<Dictionary> {
    let mut status = None;
    let mut message = None;

    for field in body.splitn(3, '&') {
        if let Some(value) = field.strip_prefix("STATUS=") {
            status = value.parse::<i64>().ok();
        } else if let Some(value) = field.strip_prefix("MESSAGE=") {
            message = Some(value.to_owned());
        }
    }

    let status = status.ok_or(Error::MalformedResponse)?;
    let message = message.ok_or(Error::MalformedResponse)?;
    if status != 0 || message != "SUCCESS" {
        return Err(Error::ServerStatus { status, message });
    }

    let plist_body = body
        .split_once("REQUEST_STRING=")
        .map(|(_, rest)| rest)
        .ok_or(Error::MalformedResponse)?;

    debug!("Received ticket ({} bytes)", plist_body.len());
    match Value::from_reader_xml(plist_body.as_bytes())? {
        Value::Dictionary(dict) => Ok(dict),
        _ => Err(Error::MalformedResponse),
    }
}

/// Raw ticket bytes from a ticket dictionary.
pub fn ap_ticket(tss: &Dictionary) -> Option<Vec<u8>> {
    tss.get("APTicket").and_then(Value::as_data).map(<[u8]>::to_vec)
}

/// Per-component signature blob, from `<name>.Blob`.
pub fn blob_for_entry(tss: &Dictionary, name: &str) -> Option<Vec<u8>> {
    tss.get(name)?
        .as_dictionary()?
        .get("Blob")
        .and_then(Value::as_data)
        .map(<[u8]>::to_vec)
}

/// Whole-ticket blob used by the newer container format.
pub fn img4_ticket(tss: &Dictionary) -> Option<Vec<u8>> {
    tss.get("ApImg4Ticket")
        .and_then(Value::as_data)
        .map(<[u8]>::to_vec)
}

/// Some tickets come back with empty dicts for the Restore* variants of
/// components that share a digest with their non-restore counterpart. Fill
/// those from the counterpart so personalization can find the blobs.
pub fn fixup_ticket(tss: &mut Dictionary) {
    const PAIRS: &[(&str, &str)] = &[
        ("RestoreLogo", "AppleLogo"),
        ("RestoreDeviceTree", "DeviceTree"),
        ("RestoreKernelCache", "KernelCache"),
    ];

    for (restore_key, source_key) in PAIRS {
        let is_empty = tss
            .get(*restore_key)
            .and_then(Value::as_dictionary)
            .is_some_and(Dictionary::is_empty);
        if !is_empty {
            continue;
        }

        let source = tss
            .get(*source_key)
            .and_then(Value::as_dictionary)
            .filter(|d| !d.is_empty())
            .cloned();
        if let Some(source) = source {
            debug!("Replacing empty {restore_key} with {source_key}");
            tss.insert((*restore_key).to_owned(), Value::Dictionary(source));
        }
    }
}
