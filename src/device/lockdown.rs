// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Normal and Restore mode transports, reached through the device mux
//! daemon's unix socket rather than raw USB.
//!
//! Both services speak length-framed property lists. The mux daemon itself
//! uses a 16 byte little-endian header; once a connection is tunneled to a
//! device port, messages switch to a 4 byte big-endian length prefix.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use plist::{Dictionary, Value};
use tracing::debug;

use super::{
    transport::{NormalTransport, RestoreSource, RestoreTransport},
    Error, Result,
};
use crate::personalize;

const USBMUXD_SOCKET: &str = "/var/run/usbmuxd";
const LOCKDOWN_PORT: u16 = 62078;

const MUX_PROTOCOL_VERSION: u32 = 1;
const MUX_MESSAGE_PLIST: u32 = 8;

const LABEL: &str = "reticket";

const IO_TIMEOUT: Duration = Duration::from_secs(10);

fn plist_to_xml(dict: &Dictionary) -> Result<Vec<u8>> {
    let mut xml = Vec::new();
    Value::Dictionary(dict.clone()).to_writer_xml(&mut xml)?;
    Ok(xml)
}

fn plist_from_bytes(data: &[u8]) -> Result<Dictionary> {
    match Value::from_reader(std::io::Cursor::new(data))? {
        Value::Dictionary(dict) => Ok(dict),
        _ => Err(Error::UnexpectedResponse),
    }
}

/// Client for the mux daemon's own plist protocol.
struct MuxClient {
    stream: UnixStream,
    tag: u32,
}

impl MuxClient {
    fn connect() -> Result<Self> {
        let stream = UnixStream::connect(USBMUXD_SOCKET)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(Self { stream, tag: 0 })
    }

    fn request(&mut self, message: Dictionary) -> Result<Dictionary> {
        self.tag += 1;

        let payload = plist_to_xml(&message)?;
        let mut header = [0u8; 16];
        LittleEndian::write_u32(&mut header[0..4], (16 + payload.len()) as u32);
        LittleEndian::write_u32(&mut header[4..8], MUX_PROTOCOL_VERSION);
        LittleEndian::write_u32(&mut header[8..12], MUX_MESSAGE_PLIST);
        LittleEndian::write_u32(&mut header[12..16], self.tag);

        self.stream.write_all(&header)?;
        self.stream.write_all(&payload)?;

        let mut header = [0u8; 16];
        self.stream.read_exact(&mut header)?;
        let length = LittleEndian::read_u32(&header[0..4]) as usize;
        if length < 16 {
            return Err(Error::UnexpectedResponse);
        }

        let mut payload = vec![0u8; length - 16];
        self.stream.read_exact(&mut payload)?;
        plist_from_bytes(&payload)
    }

    fn base_message(message_type: &str) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), Value::String(message_type.into()));
        dict.insert("ProgName".into(), Value::String(LABEL.into()));
        dict.insert("ClientVersionString".into(), Value::String(LABEL.into()));
        dict
    }

    fn first_device_id(&mut self) -> Result<Option<u64>> {
        let reply = self.request(Self::base_message("ListDevices"))?;
        let devices = reply
            .get("DeviceList")
            .and_then(Value::as_array)
            .ok_or(Error::UnexpectedResponse)?;

        Ok(devices
            .iter()
            .filter_map(Value::as_dictionary)
            .find_map(|d| d.get("DeviceID").and_then(Value::as_unsigned_integer)))
    }

    /// Tunnel this connection to `port` on the device. On success the
    /// underlying stream becomes a pipe to that port.
    fn connect_to_device(mut self, device_id: u64, port: u16) -> Result<UnixStream> {
        let mut message = Self::base_message("Connect");
        message.insert("DeviceID".into(), Value::Integer(device_id.into()));
        // Port travels in network byte order.
        message.insert(
            "PortNumber".into(),
            Value::Integer(u64::from(port.swap_bytes()).into()),
        );

        let reply = self.request(message)?;
        let number = reply
            .get("Number")
            .and_then(Value::as_unsigned_integer)
            .ok_or(Error::UnexpectedResponse)?;
        if number != 0 {
            return Err(Error::Open(format!("mux connect failed with {number}")));
        }

        Ok(self.stream)
    }
}

/// Length-framed plist messages over a tunneled device connection.
struct PlistStream {
    stream: UnixStream,
}

impl PlistStream {
    fn send(&mut self, message: &Dictionary) -> Result<()> {
        let payload = plist_to_xml(message)?;
        let mut length = [0u8; 4];
        BigEndian::write_u32(&mut length, payload.len() as u32);
        self.stream.write_all(&length)?;
        self.stream.write_all(&payload)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Dictionary> {
        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length)?;
        let mut payload = vec![0u8; BigEndian::read_u32(&length) as usize];
        self.stream.read_exact(&mut payload)?;
        plist_from_bytes(&payload)
    }

    fn roundtrip(&mut self, message: &Dictionary) -> Result<Dictionary> {
        self.send(message)?;
        self.recv()
    }
}

/// Open a tunneled connection to the first attached device's lockdown port.
fn open_service() -> Result<Option<PlistStream>> {
    let mut mux = match MuxClient::connect() {
        Ok(mux) => mux,
        Err(_) => return Ok(None),
    };
    let Some(device_id) = mux.first_device_id()? else {
        return Ok(None);
    };
    let stream = mux.connect_to_device(device_id, LOCKDOWN_PORT)?;
    Ok(Some(PlistStream { stream }))
}

fn request(name: &str) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert("Label".into(), Value::String(LABEL.into()));
    dict.insert("Request".into(), Value::String(name.into()));
    dict
}

/// Service type reported by the device, distinguishing a booted system from
/// the restore environment.
fn query_service_type() -> Result<Option<String>> {
    let Some(mut conn) = open_service()? else {
        return Ok(None);
    };
    let reply = conn.roundtrip(&request("QueryType"))?;
    Ok(reply
        .get("Type")
        .and_then(Value::as_string)
        .map(str::to_owned))
}

pub fn probe_normal() -> Result<bool> {
    Ok(query_service_type()?.as_deref() == Some("com.apple.mobile.lockdown"))
}

pub fn probe_restore() -> Result<bool> {
    Ok(query_service_type()?.as_deref() == Some("com.apple.mobile.restored"))
}

/// A booted device's lockdown service.
pub struct NormalDevice {
    conn: PlistStream,
}

impl NormalDevice {
    pub fn connect() -> Result<Self> {
        let conn = open_service()?.ok_or_else(|| Error::Open("no device attached".to_owned()))?;
        Ok(Self { conn })
    }

    fn get_value(&mut self, key: &str) -> Result<Option<Value>> {
        let mut message = request("GetValue");
        message.insert("Key".into(), Value::String(key.into()));
        let mut reply = self.conn.roundtrip(&message)?;
        Ok(reply.remove("Value"))
    }

    fn get_string(&mut self, key: &'static str) -> Result<String> {
        self.get_value(key)?
            .as_ref()
            .and_then(Value::as_string)
            .map(str::to_owned)
            .ok_or(Error::MissingValue(key))
    }

    fn get_data(&mut self, key: &'static str) -> Result<Vec<u8>> {
        self.get_value(key)?
            .as_ref()
            .and_then(Value::as_data)
            .map(<[u8]>::to_vec)
            .ok_or(Error::MissingValue(key))
    }
}

impl NormalTransport for NormalDevice {
    fn hardware_model(&mut self) -> Result<String> {
        self.get_string("HardwareModel")
    }

    fn product_type(&mut self) -> Result<String> {
        self.get_string("ProductType")
    }

    fn ecid(&mut self) -> Result<u64> {
        self.get_value("UniqueChipID")?
            .as_ref()
            .and_then(Value::as_unsigned_integer)
            .ok_or(Error::MissingValue("UniqueChipID"))
    }

    fn ap_nonce(&mut self) -> Result<Vec<u8>> {
        self.get_data("ApNonce")
    }

    fn sep_nonce(&mut self) -> Result<Vec<u8>> {
        self.get_data("SEPNonce")
    }

    fn image4_supported(&mut self) -> Result<bool> {
        Ok(self
            .get_value("Image4Supported")?
            .as_ref()
            .and_then(Value::as_boolean)
            .unwrap_or(false))
    }

    fn serial_number(&mut self) -> Result<String> {
        self.get_string("SerialNumber")
    }

    fn preflight_info(&mut self) -> Result<Option<Dictionary>> {
        Ok(self
            .get_value("FirmwarePreflightInfo")?
            .and_then(|v| v.into_dictionary()))
    }

    fn enter_recovery(&mut self) -> Result<()> {
        debug!("Requesting transition to recovery mode");
        let reply = self.conn.roundtrip(&request("EnterRecovery"))?;
        match reply.get("Error").and_then(Value::as_string) {
            None => Ok(()),
            Some(e) => Err(Error::Open(format!("EnterRecovery failed: {e}"))),
        }
    }
}

/// The restore daemon running on a device in restore mode.
pub struct RestoredClient {
    conn: PlistStream,
}

impl RestoredClient {
    pub fn connect() -> Result<Self> {
        let conn = open_service()?.ok_or_else(|| Error::Open("no device attached".to_owned()))?;
        Ok(Self { conn })
    }

    fn query_value(&mut self, key: &str) -> Result<Option<Value>> {
        let mut message = request("QueryValue");
        message.insert("QueryKey".into(), Value::String(key.into()));
        let mut reply = self.conn.roundtrip(&message)?;
        Ok(reply.remove("QueryValue"))
    }
}

impl RestoredClient {
    /// Filesystem images go out in bounded chunks; an empty chunk marks the
    /// end of the stream.
    const IMAGE_CHUNK_SIZE: usize = 4 * 1024 * 1024;

    fn send_filesystem(&mut self, source: &RestoreSource<'_>) -> Result<()> {
        use std::{fs::File, io::Read};

        let mut file = File::open(source.filesystem)?;
        let mut buf = vec![0u8; Self::IMAGE_CHUNK_SIZE];

        loop {
            let n = file.read(&mut buf)?;
            let mut message = Dictionary::new();
            message.insert(
                "SystemImageData".into(),
                Value::Data(buf[..n].to_vec()),
            );
            self.conn.send(&message)?;
            if n == 0 {
                break;
            }
        }

        Ok(())
    }

    fn send_component(&mut self, source: &RestoreSource<'_>, component: &str) -> Result<()> {
        let path = source
            .identity
            .component_path(component)
            .map_err(|e| Error::Open(format!("cannot resolve {component}: {e}")))?;
        let data = source
            .ipsw
            .extract_to_memory(&path)
            .map_err(|e| Error::Open(format!("cannot extract {component}: {e}")))?;
        let personalized =
            personalize::personalize(component, &data, source.ticket, source.keep_personalized)
                .map_err(|e| Error::Open(format!("cannot personalize {component}: {e}")))?;

        let mut message = Dictionary::new();
        message.insert("FileData".into(), Value::Data(personalized));
        self.conn.send(&message)?;
        Ok(())
    }

    fn send_baseband(&mut self, source: &RestoreSource<'_>) -> Result<()> {
        let Some(path) = source.baseband else {
            return Err(Error::MissingValue("baseband firmware"));
        };
        let data = std::fs::read(path)?;
        let mut message = Dictionary::new();
        message.insert("BasebandData".into(), Value::Data(data));
        self.conn.send(&message)?;
        Ok(())
    }

    fn handle_data_request(
        &mut self,
        source: &RestoreSource<'_>,
        message: &Dictionary,
    ) -> Result<()> {
        let data_type = message
            .get("DataType")
            .and_then(Value::as_string)
            .ok_or(Error::UnexpectedResponse)?;

        debug!("Restore daemon requested {data_type}");
        match data_type {
            "SystemImageData" => self.send_filesystem(source),
            "KernelCache" => self.send_component(source, "RestoreKernelCache"),
            "DeviceTree" => self.send_component(source, "RestoreDeviceTree"),
            "BasebandData" => self.send_baseband(source),
            other => {
                debug!("Ignoring unknown data request {other}");
                Ok(())
            }
        }
    }
}

impl RestoreTransport for RestoredClient {
    fn hardware_model(&mut self) -> Result<String> {
        self.query_value("HardwareModel")?
            .as_ref()
            .and_then(Value::as_string)
            .map(str::to_owned)
            .ok_or(Error::MissingValue("HardwareModel"))
    }

    fn reboot(&mut self) -> Result<()> {
        debug!("Requesting reboot out of restore mode");
        self.conn.send(&request("Reboot"))?;
        Ok(())
    }

    fn start_restore(&mut self, source: &RestoreSource<'_>) -> Result<()> {
        let mut start = request("StartRestore");
        start.insert("RestoreProtocolVersion".into(), Value::Integer(14u64.into()));
        if let Some(behavior) = source.identity.restore_behavior() {
            start.insert("RestoreBehavior".into(), Value::String(behavior.into()));
        }
        self.conn.send(&start)?;

        loop {
            let message = self.conn.recv()?;
            let msg_type = message
                .get("MsgType")
                .and_then(Value::as_string)
                .unwrap_or_default();

            match msg_type {
                "ProgressMsg" => {
                    if let (Some(operation), Some(progress)) = (
                        message.get("Operation").and_then(Value::as_unsigned_integer),
                        message.get("Progress").and_then(Value::as_unsigned_integer),
                    ) {
                        debug!("Restore operation {operation}: {progress}%");
                    }
                }
                "StatusMsg" => {
                    let status = message
                        .get("Status")
                        .and_then(Value::as_unsigned_integer)
                        .unwrap_or(0);
                    if status != 0 {
                        return Err(Error::Open(format!(
                            "restore daemon reported status {status}"
                        )));
                    }
                    return Ok(());
                }
                "DataRequestMsg" => self.handle_data_request(source, &message)?,
                "Goodbye" => return Ok(()),
                other => debug!("Ignoring restore message {other:?}"),
            }
        }
    }
}
