// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Reader for the firmware archive's BuildManifest property list.
//!
//! A manifest enumerates build identities, one per (device model, restore
//! behavior) combination. Identities extracted from a manifest are owned
//! copies so that they outlive the manifest they came from.

use std::io::{Read, Seek};

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::info;

use crate::util;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing manifest key: {0}")]
    MissingKey(&'static str),
    #[error("Manifest key has wrong type: {0}")]
    WrongType(&'static str),
    #[error("Missing component in manifest: {0}")]
    MissingComponent(String),
    #[error("Product type {0:?} is not supported by this firmware")]
    IncompatibleProduct(String),
    #[error("Failed to parse property list")]
    Plist(#[from] plist::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Restore behavior of a build identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Erase,
    Update,
}

impl Behavior {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Erase => "Erase",
            Self::Update => "Update",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Erase => Self::Update,
            Self::Update => Self::Erase,
        }
    }
}

/// Version fields shared by every identity in a manifest.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: String,
    pub build: String,
    /// Decimal prefix of `build`, eg. `14G61` -> 14.
    pub build_major: u32,
}

pub struct BuildManifest {
    dict: Dictionary,
}

impl BuildManifest {
    pub fn from_reader(reader: impl Read + Seek) -> Result<Self> {
        let value = Value::from_reader(reader)?;
        let dict = match value {
            Value::Dictionary(d) => d,
            _ => return Err(Error::WrongType("BuildManifest")),
        };
        Ok(Self { dict })
    }

    fn identities(&self) -> Result<&Vec<Value>> {
        self.dict
            .get("BuildIdentities")
            .ok_or(Error::MissingKey("BuildIdentities"))?
            .as_array()
            .ok_or(Error::WrongType("BuildIdentities"))
    }

    pub fn identity_count(&self) -> Result<usize> {
        Ok(self.identities()?.len())
    }

    /// An owned copy of the identity at `index`, or `None` when out of range.
    pub fn identity_at(&self, index: usize) -> Result<Option<BuildIdentity>> {
        let identities = self.identities()?;
        Ok(identities
            .get(index)
            .and_then(Value::as_dictionary)
            .cloned()
            .map(|dict| BuildIdentity { dict }))
    }

    /// Linear scan for the first identity whose `Info.DeviceClass` matches
    /// `model` (case-insensitively) and, when given, whose
    /// `Info.RestoreBehavior` matches `behavior`.
    pub fn identity_for_model_and_behavior(
        &self,
        model: &str,
        behavior: Option<Behavior>,
    ) -> Result<Option<BuildIdentity>> {
        for value in self.identities()? {
            let Some(ident) = value.as_dictionary() else {
                continue;
            };
            let Some(info) = ident.get("Info").and_then(Value::as_dictionary) else {
                continue;
            };
            let Some(devclass) = info.get("DeviceClass").and_then(Value::as_string) else {
                continue;
            };
            if !devclass.eq_ignore_ascii_case(model) {
                continue;
            }
            if let Some(behavior) = behavior {
                let Some(rbehavior) = info.get("RestoreBehavior").and_then(Value::as_string)
                else {
                    continue;
                };
                if !rbehavior.eq_ignore_ascii_case(behavior.as_str()) {
                    continue;
                }
            }
            return Ok(Some(BuildIdentity {
                dict: ident.clone(),
            }));
        }

        Ok(None)
    }

    pub fn identity_for_model(&self, model: &str) -> Result<Option<BuildIdentity>> {
        self.identity_for_model_and_behavior(model, None)
    }

    /// Ok iff `product` appears in `SupportedProductTypes`.
    pub fn check_compatibility(&self, product: &str) -> Result<()> {
        let supported = self
            .dict
            .get("SupportedProductTypes")
            .ok_or(Error::MissingKey("SupportedProductTypes"))?
            .as_array()
            .ok_or(Error::WrongType("SupportedProductTypes"))?;

        let found = supported
            .iter()
            .filter_map(Value::as_string)
            .any(|p| p == product);
        if !found {
            return Err(Error::IncompatibleProduct(product.to_owned()));
        }

        Ok(())
    }

    pub fn version_info(&self) -> Result<VersionInfo> {
        let version = self
            .dict
            .get("ProductVersion")
            .and_then(Value::as_string)
            .ok_or(Error::MissingKey("ProductVersion"))?
            .to_owned();
        let build = self
            .dict
            .get("ProductBuildVersion")
            .and_then(Value::as_string)
            .ok_or(Error::MissingKey("ProductBuildVersion"))?
            .to_owned();
        let build_major = util::decimal_prefix(&build);

        Ok(VersionInfo {
            version,
            build,
            build_major,
        })
    }

    /// Whether this firmware requires a signing ticket. Pre-ticket firmware
    /// carries no `UniqueBuildID` in its identities.
    pub fn ticket_enabled(&self) -> bool {
        self.identities().map_or(false, |identities| {
            identities
                .iter()
                .filter_map(Value::as_dictionary)
                .any(|ident| ident.contains_key("UniqueBuildID"))
        })
    }
}

/// A single build identity, owned independently of its manifest.
#[derive(Debug, Clone)]
pub struct BuildIdentity {
    dict: Dictionary,
}

impl BuildIdentity {
    pub fn as_dict(&self) -> &Dictionary {
        &self.dict
    }

    fn info(&self) -> Option<&Dictionary> {
        self.dict.get("Info").and_then(Value::as_dictionary)
    }

    pub fn device_class(&self) -> Option<&str> {
        self.info()?.get("DeviceClass").and_then(Value::as_string)
    }

    pub fn restore_behavior(&self) -> Option<&str> {
        self.info()?
            .get("RestoreBehavior")
            .and_then(Value::as_string)
    }

    pub fn variant(&self) -> Option<&str> {
        self.info()?.get("Variant").and_then(Value::as_string)
    }

    /// The `Manifest` dict holding one entry per firmware component.
    pub fn manifest(&self) -> Option<&Dictionary> {
        self.dict.get("Manifest").and_then(Value::as_dictionary)
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.manifest()
            .and_then(|m| m.get(component))
            .and_then(Value::as_dictionary)
            .is_some()
    }

    /// Archive-relative path of a component, from `Manifest.<c>.Info.Path`.
    /// Every missing or mistyped level is an error rather than an empty path.
    pub fn component_path(&self, component: &str) -> Result<String> {
        let manifest = self.manifest().ok_or(Error::MissingKey("Manifest"))?;
        let entry = manifest
            .get(component)
            .and_then(Value::as_dictionary)
            .ok_or_else(|| Error::MissingComponent(component.to_owned()))?;
        let info = entry
            .get("Info")
            .and_then(Value::as_dictionary)
            .ok_or(Error::MissingKey("Info"))?;
        let path = info
            .get("Path")
            .and_then(Value::as_string)
            .ok_or(Error::MissingKey("Path"))?;

        Ok(path.to_owned())
    }

    /// Log what this identity will do to the device.
    pub fn log_information(&self) {
        if let Some(variant) = self.variant() {
            info!("Variant: {variant}");
        }
        match self.restore_behavior() {
            Some("Erase") => info!("This restore will erase your device data"),
            Some("Update") => info!("This restore will update your device without losing data"),
            _ => {}
        }
    }
}
