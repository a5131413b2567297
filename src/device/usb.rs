// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Raw USB transports for the boot loader modes (DFU, WTF, Recovery).
//!
//! Devices in these modes enumerate with fixed product ids and report their
//! identity (chip id, board id, ECID, boot-stage flags, nonces) through the
//! USB serial descriptor string.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::debug;

use super::{
    lockdown,
    transport::{
        DfuKind, DfuTransport, NormalTransport, RecoveryTransport, RestoreTransport,
        TransportProvider,
    },
    DeviceInfo, Error, Result,
};

const APPLE_VID: u16 = 0x05ac;
const PID_WTF: u16 = 0x1222;
const PID_DFU: u16 = 0x1227;
const PID_RECOVERY_FIRST: u16 = 0x1280;
const PID_RECOVERY_LAST: u16 = 0x1283;

const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// DFU transfers are split into 2 KiB blocks.
const DFU_CHUNK_SIZE: usize = 0x800;
/// Recovery bulk uploads use 32 KiB chunks on the file endpoint.
const RECOVERY_CHUNK_SIZE: usize = 0x8000;
const RECOVERY_FILE_ENDPOINT: u8 = 0x04;

/// Parse the `KEY:value` fields of a boot loader serial string, eg.
/// `CPID:8950 CPRV:20 BDID:02 ECID:000012345678ABCD IBFL:1A SRTG:[iBoot-2261.20.20]`.
fn parse_serial_fields(serial: &str) -> DeviceInfo {
    fn hex_field(serial: &str, key: &str) -> Option<u64> {
        let start = serial.find(key)? + key.len();
        let rest = &serial[start..];
        let end = rest.find(' ').unwrap_or(rest.len());
        u64::from_str_radix(&rest[..end], 16).ok()
    }

    fn bracket_field(serial: &str, key: &str) -> Option<String> {
        let start = serial.find(key)? + key.len();
        let rest = &serial[start..];
        let end = rest.find(']')?;
        Some(rest[..end].to_owned())
    }

    fn bytes_field(serial: &str, key: &str) -> Option<Vec<u8>> {
        let start = serial.find(key)? + key.len();
        let rest = &serial[start..];
        let end = rest.find(' ').unwrap_or(rest.len());
        hex::decode(&rest[..end]).ok()
    }

    DeviceInfo {
        cpid: hex_field(serial, "CPID:").unwrap_or(0) as u32,
        bdid: hex_field(serial, "BDID:").unwrap_or(0) as u32,
        ecid: hex_field(serial, "ECID:").unwrap_or(0),
        ibfl: hex_field(serial, "IBFL:").unwrap_or(0) as u32,
        srtg: bracket_field(serial, "SRTG:["),
        srnm: bracket_field(serial, "SRNM:["),
        ap_nonce: bytes_field(serial, "NONC:"),
        sep_nonce: bytes_field(serial, "SNON:"),
    }
}

fn find_device(context: &Context, matches: impl Fn(u16) -> bool) -> Result<Option<Device<Context>>> {
    for device in context.devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() == APPLE_VID && matches(descriptor.product_id()) {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

struct BootDevice {
    handle: DeviceHandle<Context>,
    info: DeviceInfo,
}

impl BootDevice {
    fn open(device: &Device<Context>) -> Result<Self> {
        let descriptor = device.device_descriptor()?;
        let handle = device.open()?;
        let serial = handle
            .read_serial_number_string_ascii(&descriptor)
            .unwrap_or_default();
        let info = parse_serial_fields(&serial);

        debug!(
            "Opened boot loader device: CPID:{:04x} BDID:{:02x} ECID:{:x} IBFL:{:02x}",
            info.cpid, info.bdid, info.ecid, info.ibfl
        );

        Ok(Self { handle, info })
    }
}

/// DFU mode upload: DNLOAD control transfers in numbered blocks, a zero
/// length block to finish, then status polls to walk the DFU state machine
/// into its manifest phase.
pub struct UsbDfuDevice {
    inner: BootDevice,
}

impl DfuTransport for UsbDfuDevice {
    fn device_info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    fn send_buffer(&mut self, data: &[u8]) -> Result<()> {
        let blocks = data.chunks(DFU_CHUNK_SIZE).count() as u16;

        for (block, chunk) in data.chunks(DFU_CHUNK_SIZE).enumerate() {
            self.inner
                .handle
                .write_control(0x21, 1, block as u16, 0, chunk, USB_TIMEOUT)?;
        }
        self.inner
            .handle
            .write_control(0x21, 1, blocks, 0, &[], USB_TIMEOUT)?;

        let mut status = [0u8; 6];
        for _ in 0..3 {
            let _ = self
                .inner
                .handle
                .read_control(0xA1, 3, 0, 0, &mut status, USB_TIMEOUT);
        }

        // The upload only takes effect once the device resets out of DFU.
        let _ = self.inner.handle.reset();

        Ok(())
    }
}

/// Recovery mode: commands go over a vendor control transfer, files over the
/// bulk file endpoint.
pub struct UsbRecoveryDevice {
    inner: BootDevice,
}

impl UsbRecoveryDevice {
    fn command_bytes(command: &str) -> Vec<u8> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.push(0);
        bytes
    }
}

impl RecoveryTransport for UsbRecoveryDevice {
    fn device_info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    fn send_buffer(&mut self, data: &[u8]) -> Result<()> {
        self.inner.handle.claim_interface(0)?;

        for chunk in data.chunks(RECOVERY_CHUNK_SIZE) {
            self.inner
                .handle
                .write_bulk(RECOVERY_FILE_ENDPOINT, chunk, USB_TIMEOUT)?;
        }

        Ok(())
    }

    fn send_command(&mut self, command: &str) -> Result<()> {
        debug!("Recovery command: {command}");
        self.inner.handle.write_control(
            0x40,
            1,
            0,
            0,
            &Self::command_bytes(command),
            USB_TIMEOUT,
        )?;
        Ok(())
    }

    fn set_autoboot(&mut self, enable: bool) -> Result<()> {
        self.send_command(&format!("setenv auto-boot {enable}"))?;
        self.send_command("saveenv")
    }

    fn reboot(&mut self) -> Result<()> {
        self.send_command("reboot")
    }
}

/// The default transport factory: raw USB for the boot loader modes, the
/// device mux daemon for Normal and Restore modes.
pub struct UsbProvider {
    context: Context,
}

impl UsbProvider {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }
}

impl TransportProvider for UsbProvider {
    fn probe_recovery(&mut self) -> Result<bool> {
        Ok(find_device(&self.context, |pid| {
            (PID_RECOVERY_FIRST..=PID_RECOVERY_LAST).contains(&pid)
        })?
        .is_some())
    }

    fn probe_dfu(&mut self) -> Result<Option<DfuKind>> {
        if find_device(&self.context, |pid| pid == PID_DFU)?.is_some() {
            return Ok(Some(DfuKind::Dfu));
        }
        if find_device(&self.context, |pid| pid == PID_WTF)?.is_some() {
            return Ok(Some(DfuKind::Wtf));
        }
        Ok(None)
    }

    fn probe_normal(&mut self) -> Result<bool> {
        lockdown::probe_normal()
    }

    fn probe_restore(&mut self) -> Result<bool> {
        lockdown::probe_restore()
    }

    fn open_dfu(&mut self) -> Result<Box<dyn DfuTransport>> {
        let device = find_device(&self.context, |pid| pid == PID_DFU || pid == PID_WTF)?
            .ok_or_else(|| Error::Open("no device in DFU mode".to_owned()))?;
        Ok(Box::new(UsbDfuDevice {
            inner: BootDevice::open(&device)?,
        }))
    }

    fn open_recovery(&mut self) -> Result<Box<dyn RecoveryTransport>> {
        let device = find_device(&self.context, |pid| {
            (PID_RECOVERY_FIRST..=PID_RECOVERY_LAST).contains(&pid)
        })?
        .ok_or_else(|| Error::Open("no device in recovery mode".to_owned()))?;
        Ok(Box::new(UsbRecoveryDevice {
            inner: BootDevice::open(&device)?,
        }))
    }

    fn open_normal(&mut self) -> Result<Box<dyn NormalTransport>> {
        Ok(Box::new(lockdown::NormalDevice::connect()?))
    }

    fn open_restore(&mut self) -> Result<Box<dyn RestoreTransport>> {
        Ok(Box::new(lockdown::RestoredClient::connect()?))
    }
}
