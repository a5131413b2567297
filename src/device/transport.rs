// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Interfaces to the per-mode device transports.
//!
//! The orchestrator is written against these traits only. The default
//! implementations live in [`super::usb`] (boot loader modes, over raw USB)
//! and [`super::lockdown`] (Normal and Restore modes, over the device mux
//! daemon); tests substitute scripted ones.

use std::path::Path;

use plist::Dictionary;

use super::{DeviceInfo, Result};
use crate::{format::manifest::BuildIdentity, ipsw::Ipsw};

/// What the DFU probe actually found; the oldest devices expose a separate
/// "WTF" pre-DFU mode on a different product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuKind {
    Dfu,
    Wtf,
}

/// A device waiting in DFU (or WTF) mode.
pub trait DfuTransport {
    fn device_info(&self) -> &DeviceInfo;

    /// Upload an image. DFU uploads complete with a reset, after which the
    /// device leaves this mode.
    fn send_buffer(&mut self, data: &[u8]) -> Result<()>;
}

/// A device waiting in the Recovery (iBoot/iBEC) shell.
pub trait RecoveryTransport {
    fn device_info(&self) -> &DeviceInfo;

    fn send_buffer(&mut self, data: &[u8]) -> Result<()>;

    fn send_command(&mut self, command: &str) -> Result<()>;

    fn set_autoboot(&mut self, enable: bool) -> Result<()>;

    fn reboot(&mut self) -> Result<()>;
}

/// A booted device reachable through its lockdown service.
pub trait NormalTransport {
    fn hardware_model(&mut self) -> Result<String>;

    fn product_type(&mut self) -> Result<String>;

    fn ecid(&mut self) -> Result<u64>;

    fn ap_nonce(&mut self) -> Result<Vec<u8>>;

    fn sep_nonce(&mut self) -> Result<Vec<u8>>;

    fn image4_supported(&mut self) -> Result<bool>;

    fn serial_number(&mut self) -> Result<String>;

    /// Baseband preflight record, when the device has a baseband at all.
    fn preflight_info(&mut self) -> Result<Option<Dictionary>>;

    fn enter_recovery(&mut self) -> Result<()>;
}

/// Everything the restore streamer needs to answer the device's data
/// requests during the final restore phase.
pub struct RestoreSource<'a> {
    pub identity: &'a BuildIdentity,
    pub ticket: Option<&'a Dictionary>,
    pub ipsw: &'a Ipsw,
    pub filesystem: &'a Path,
    pub baseband: Option<&'a Path>,
    pub keep_personalized: bool,
}

/// A device already sitting in the restore environment.
pub trait RestoreTransport {
    fn hardware_model(&mut self) -> Result<String>;

    /// Ask the restore daemon to reboot back into a normal boot.
    fn reboot(&mut self) -> Result<()>;

    /// Hand the restore over to the streamer: drive the device's restore
    /// daemon until it reports completion, serving firmware data out of
    /// `source` on demand.
    fn start_restore(&mut self, source: &RestoreSource<'_>) -> Result<()>;
}

/// Factory for probes and transports. Probes are cheap and do not keep the
/// device open; `open_*` hands out an exclusive transport for one mode.
pub trait TransportProvider {
    fn probe_recovery(&mut self) -> Result<bool>;

    fn probe_dfu(&mut self) -> Result<Option<DfuKind>>;

    fn probe_normal(&mut self) -> Result<bool>;

    fn probe_restore(&mut self) -> Result<bool>;

    fn open_dfu(&mut self) -> Result<Box<dyn DfuTransport>>;

    fn open_recovery(&mut self) -> Result<Box<dyn RecoveryTransport>>;

    fn open_normal(&mut self) -> Result<Box<dyn NormalTransport>>;

    fn open_restore(&mut self) -> Result<Box<dyn RestoreTransport>>;
}
