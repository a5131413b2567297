// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Device discovery and per-mode capability dispatch.
//!
//! A device is reachable in exactly one mode at a time. Each mode has its
//! own transport (see [`transport`]) and not every query is available in
//! every mode; asking for one the mode cannot answer is a
//! [`Error::InvalidState`] error.

pub mod lockdown;
pub mod transport;
pub mod usb;

use std::{fmt, io};

use thiserror::Error;
use tracing::debug;

use crate::device::transport::{
    DfuKind, DfuTransport, NormalTransport, RecoveryTransport, RestoreTransport,
    TransportProvider,
};

/// iBoot reports this bit in its flags when the boot chain uses the newer
/// signed container format.
pub const IBOOT_FLAG_IMAGE4_AWARE: u32 = 1 << 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device is in an invalid state for this operation")]
    InvalidState,
    #[error("Unknown device: CPID {cpid:#06x}, BDID {bdid:#04x}")]
    UnknownDevice { cpid: u32, bdid: u32 },
    #[error("Unknown hardware model: {0}")]
    UnknownModel(String),
    #[error("Device did not report {0}")]
    MissingValue(&'static str),
    #[error("Unexpected response from device service")]
    UnexpectedResponse,
    #[error("Transport open failed: {0}")]
    Open(String),
    #[error("USB error")]
    Usb(#[from] rusb::Error),
    #[error("Property list error")]
    Plist(#[from] plist::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The boot/recovery modes a device can be found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unknown,
    Wtf,
    Dfu,
    Recovery,
    Restore,
    Normal,
}

impl Mode {
    pub fn index(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Wtf => 1,
            Self::Dfu => 2,
            Self::Recovery => 3,
            Self::Restore => 4,
            Self::Normal => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Wtf => "WTF",
            Self::Dfu => "DFU",
            Self::Recovery => "Recovery",
            Self::Restore => "Restore",
            Self::Normal => "Normal",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fields reported by the boot loader modes, parsed out of the USB serial
/// descriptor string.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub cpid: u32,
    pub bdid: u32,
    pub ecid: u64,
    /// Boot-stage flags; see [`IBOOT_FLAG_IMAGE4_AWARE`] and the iBEC entry
    /// checks in the orchestrator.
    pub ibfl: u32,
    pub srtg: Option<String>,
    pub srnm: Option<String>,
    pub ap_nonce: Option<Vec<u8>>,
    pub sep_nonce: Option<Vec<u8>>,
}

/// One hardware model the tool knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEntry {
    pub product_type: &'static str,
    pub hardware_model: &'static str,
    pub cpid: u32,
    pub bdid: u32,
}

/// The supported 32-bit lineup.
static DEVICES: &[DeviceEntry] = &[
    DeviceEntry { product_type: "iPhone2,1", hardware_model: "N88AP", cpid: 0x8920, bdid: 0x00 },
    DeviceEntry { product_type: "iPhone3,1", hardware_model: "N90AP", cpid: 0x8930, bdid: 0x00 },
    DeviceEntry { product_type: "iPhone4,1", hardware_model: "N94AP", cpid: 0x8940, bdid: 0x08 },
    DeviceEntry { product_type: "iPhone5,1", hardware_model: "N41AP", cpid: 0x8950, bdid: 0x00 },
    DeviceEntry { product_type: "iPhone5,2", hardware_model: "N42AP", cpid: 0x8950, bdid: 0x02 },
    DeviceEntry { product_type: "iPhone5,3", hardware_model: "N48AP", cpid: 0x8950, bdid: 0x04 },
    DeviceEntry { product_type: "iPhone5,4", hardware_model: "N49AP", cpid: 0x8950, bdid: 0x06 },
    DeviceEntry { product_type: "iPad1,1", hardware_model: "K48AP", cpid: 0x8930, bdid: 0x02 },
    DeviceEntry { product_type: "iPad2,1", hardware_model: "K93AP", cpid: 0x8940, bdid: 0x04 },
    DeviceEntry { product_type: "iPad2,2", hardware_model: "K94AP", cpid: 0x8940, bdid: 0x06 },
    DeviceEntry { product_type: "iPad2,3", hardware_model: "K95AP", cpid: 0x8940, bdid: 0x02 },
    DeviceEntry { product_type: "iPad2,4", hardware_model: "K93AAP", cpid: 0x8942, bdid: 0x06 },
    DeviceEntry { product_type: "iPad3,1", hardware_model: "J1AP", cpid: 0x8945, bdid: 0x00 },
    DeviceEntry { product_type: "iPad3,2", hardware_model: "J2AP", cpid: 0x8945, bdid: 0x02 },
    DeviceEntry { product_type: "iPad3,3", hardware_model: "J2AAP", cpid: 0x8945, bdid: 0x04 },
    DeviceEntry { product_type: "iPad3,4", hardware_model: "P101AP", cpid: 0x8955, bdid: 0x00 },
    DeviceEntry { product_type: "iPad3,5", hardware_model: "P102AP", cpid: 0x8955, bdid: 0x02 },
    DeviceEntry { product_type: "iPad3,6", hardware_model: "P103AP", cpid: 0x8955, bdid: 0x04 },
    DeviceEntry { product_type: "iPod4,1", hardware_model: "N81AP", cpid: 0x8930, bdid: 0x08 },
    DeviceEntry { product_type: "iPod5,1", hardware_model: "N78AP", cpid: 0x8942, bdid: 0x00 },
    DeviceEntry { product_type: "AppleTV2,1", hardware_model: "K66AP", cpid: 0x8930, bdid: 0x10 },
    DeviceEntry { product_type: "AppleTV3,1", hardware_model: "J33AP", cpid: 0x8942, bdid: 0x08 },
    DeviceEntry { product_type: "AppleTV3,2", hardware_model: "J33IAP", cpid: 0x8947, bdid: 0x00 },
];

pub fn device_by_hardware_model(model: &str) -> Result<&'static DeviceEntry> {
    DEVICES
        .iter()
        .find(|d| d.hardware_model.eq_ignore_ascii_case(model))
        .ok_or_else(|| Error::UnknownModel(model.to_owned()))
}

pub fn device_by_product_type(product: &str) -> Result<&'static DeviceEntry> {
    DEVICES
        .iter()
        .find(|d| d.product_type == product)
        .ok_or_else(|| Error::UnknownModel(product.to_owned()))
}

pub fn device_by_chip(cpid: u32, bdid: u32) -> Result<&'static DeviceEntry> {
    DEVICES
        .iter()
        .find(|d| d.cpid == cpid && d.bdid == bdid)
        .ok_or(Error::UnknownDevice { cpid, bdid })
}

/// Detect which mode the attached device is in. Probes answer in a fixed
/// order; the first positive probe wins. A probe failure is treated the same
/// as "not in this mode".
pub fn probe_mode(provider: &mut dyn TransportProvider) -> Mode {
    match provider.probe_recovery() {
        Ok(true) => return Mode::Recovery,
        Ok(false) => {}
        Err(e) => debug!("Recovery probe failed: {e}"),
    }
    match provider.probe_dfu() {
        Ok(Some(DfuKind::Dfu)) => return Mode::Dfu,
        Ok(Some(DfuKind::Wtf)) => return Mode::Wtf,
        Ok(None) => {}
        Err(e) => debug!("DFU probe failed: {e}"),
    }
    match provider.probe_normal() {
        Ok(true) => return Mode::Normal,
        Ok(false) => {}
        Err(e) => debug!("Normal probe failed: {e}"),
    }
    match provider.probe_restore() {
        Ok(true) => return Mode::Restore,
        Ok(false) => {}
        Err(e) => debug!("Restore probe failed: {e}"),
    }

    Mode::Unknown
}

/// The active transport for whichever mode the device is in, with the
/// queries the restore flow needs dispatched per mode.
pub enum DeviceClient {
    Normal(Box<dyn NormalTransport>),
    Dfu(Box<dyn DfuTransport>),
    Recovery(Box<dyn RecoveryTransport>),
    Restore(Box<dyn RestoreTransport>),
}

impl DeviceClient {
    pub fn open(provider: &mut dyn TransportProvider, mode: Mode) -> Result<Self> {
        match mode {
            Mode::Normal => Ok(Self::Normal(provider.open_normal()?)),
            Mode::Dfu => Ok(Self::Dfu(provider.open_dfu()?)),
            Mode::Recovery => Ok(Self::Recovery(provider.open_recovery()?)),
            Mode::Restore => Ok(Self::Restore(provider.open_restore()?)),
            Mode::Wtf | Mode::Unknown => Err(Error::InvalidState),
        }
    }

    pub fn hardware_model(&mut self) -> Result<String> {
        match self {
            Self::Normal(t) => t.hardware_model(),
            Self::Restore(t) => t.hardware_model(),
            Self::Dfu(t) => {
                let info = t.device_info();
                Ok(device_by_chip(info.cpid, info.bdid)?.hardware_model.to_owned())
            }
            Self::Recovery(t) => {
                let info = t.device_info();
                Ok(device_by_chip(info.cpid, info.bdid)?.hardware_model.to_owned())
            }
        }
    }

    pub fn ecid(&mut self) -> Result<u64> {
        match self {
            Self::Normal(t) => t.ecid(),
            Self::Dfu(t) => Ok(t.device_info().ecid),
            Self::Recovery(t) => Ok(t.device_info().ecid),
            Self::Restore(_) => Err(Error::InvalidState),
        }
    }

    pub fn ap_nonce(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Normal(t) => t.ap_nonce(),
            Self::Dfu(t) => t
                .device_info()
                .ap_nonce
                .clone()
                .ok_or(Error::MissingValue("ApNonce")),
            Self::Recovery(t) => t
                .device_info()
                .ap_nonce
                .clone()
                .ok_or(Error::MissingValue("ApNonce")),
            Self::Restore(_) => Err(Error::InvalidState),
        }
    }

    pub fn sep_nonce(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Normal(t) => t.sep_nonce(),
            Self::Dfu(t) => t
                .device_info()
                .sep_nonce
                .clone()
                .ok_or(Error::MissingValue("SepNonce")),
            Self::Recovery(t) => t
                .device_info()
                .sep_nonce
                .clone()
                .ok_or(Error::MissingValue("SepNonce")),
            Self::Restore(_) => Err(Error::InvalidState),
        }
    }

    pub fn image4_supported(&mut self) -> Result<bool> {
        match self {
            Self::Normal(t) => t.image4_supported(),
            Self::Dfu(t) => Ok(t.device_info().ibfl & IBOOT_FLAG_IMAGE4_AWARE != 0),
            Self::Recovery(t) => Ok(t.device_info().ibfl & IBOOT_FLAG_IMAGE4_AWARE != 0),
            Self::Restore(_) => Err(Error::InvalidState),
        }
    }

    /// Baseband preflight record; only a booted device can answer.
    pub fn preflight_info(&mut self) -> Result<Option<plist::Dictionary>> {
        match self {
            Self::Normal(t) => t.preflight_info(),
            _ => Err(Error::InvalidState),
        }
    }

    pub fn enter_recovery(&mut self) -> Result<()> {
        match self {
            Self::Normal(t) => t.enter_recovery(),
            _ => Err(Error::InvalidState),
        }
    }

    pub fn serial_number(&mut self) -> Result<String> {
        match self {
            Self::Normal(t) => t.serial_number(),
            Self::Dfu(t) => t
                .device_info()
                .srnm
                .clone()
                .ok_or(Error::MissingValue("serial number")),
            Self::Recovery(t) => t
                .device_info()
                .srnm
                .clone()
                .ok_or(Error::MissingValue("serial number")),
            Self::Restore(_) => Err(Error::InvalidState),
        }
    }
}
