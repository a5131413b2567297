// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! The top-level restore flow.
//!
//! One control thread drives the device through its modes: detect where it
//! is, obtain a ticket, reconcile it against the manifest, bootstrap the
//! recovery shell, and finally hand the device over to the restore
//! streamer. Long-running work blocks; the two fixed sleeps after the WTF
//! and iBEC uploads are part of the device's protocol, not tuning knobs.

pub mod baseband;
pub mod ramdisk;

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use bitflags::bitflags;
use plist::{Dictionary, Value};
use tracing::{debug, info, warn};

use crate::{
    device::{
        device_by_hardware_model, probe_mode,
        transport::{RecoveryTransport, RestoreSource, TransportProvider},
        DeviceClient, DeviceEntry, Mode,
    },
    format::{
        manifest::{Behavior, BuildIdentity, BuildManifest},
        shsh,
    },
    ipsw::{self, Ipsw, LockFile},
    personalize, tss, version,
};

/// Hardcoded fallback for the WTF recovery archive when the version index
/// doesn't resolve one.
const WTF_FALLBACK_URL: &str = "http://appldnld.apple.com.edgesuite.net/content.info.apple.com/iPhone/061-6618.20090617.Xse7Y/x12220000_5_Recovery.ipsw";

bitflags! {
    /// Restore options. `LATEST` and `CUSTOM` are mutually exclusive;
    /// `RERESTORE` without an install option is normalized to
    /// `RERESTORE | ERASE` at the start of a run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        const ERASE = 1 << 0;
        const UPDATE = 1 << 1;
        const RERESTORE = 1 << 2;
        const LATEST = 1 << 3;
        const CUSTOM = 1 << 4;
        const DEBUG = 1 << 5;
        const NO_ACTION = 1 << 6;
        const SHSH_ONLY = 1 << 7;
    }
}

/// Milestones reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Detect,
    Prepare,
    Restore,
}

pub type ProgressCallback = Box<dyn FnMut(Step, f64) + Send>;

/// A failed run, carrying the process exit code alongside the cause.
#[derive(Debug)]
pub struct Failure {
    pub code: i32,
    pub source: anyhow::Error,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.source)
    }
}

impl std::error::Error for Failure {}

fn fail(code: i32) -> impl FnOnce(anyhow::Error) -> Failure {
    move |source| Failure { code, source }
}

/// All state for one restore run. Created once, mutated only by the
/// orchestrator, released on termination.
pub struct RestoreClient {
    pub flags: Flags,
    pub keep_personalized: bool,
    ipsw_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    mode: Mode,
    device: Option<&'static DeviceEntry>,
    ecid: u64,
    nonce: Option<Vec<u8>>,
    version: Option<String>,
    build: Option<String>,
    build_major: u32,
    image4_supported: bool,
    tss: Option<Dictionary>,
    tss_url: String,
    srnm: Option<String>,
    preflight_info: Option<Dictionary>,
    baseband_path: Option<PathBuf>,
    ota_manifest_path: Option<PathBuf>,
    progress_cb: Option<ProgressCallback>,
}

impl RestoreClient {
    pub fn new() -> Self {
        Self {
            flags: Flags::empty(),
            keep_personalized: false,
            ipsw_path: None,
            cache_dir: None,
            mode: Mode::Unknown,
            device: None,
            ecid: 0,
            nonce: None,
            version: None,
            build: None,
            build_major: 0,
            image4_supported: false,
            tss: None,
            tss_url: tss::TSS_URL.to_owned(),
            srnm: None,
            preflight_info: None,
            baseband_path: None,
            ota_manifest_path: None,
            progress_cb: None,
        }
    }

    pub fn set_ipsw(&mut self, path: &Path) {
        self.ipsw_path = Some(path.to_path_buf());
    }

    pub fn set_cache_dir(&mut self, path: &Path) {
        self.cache_dir = Some(path.to_path_buf());
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    pub fn set_ecid(&mut self, ecid: u64) {
        self.ecid = ecid;
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_cb = Some(callback);
    }

    pub fn device(&self) -> Option<&'static DeviceEntry> {
        self.device
    }

    /// Baseband preflight record captured while the device was booted.
    pub fn preflight_info(&self) -> Option<&Dictionary> {
        self.preflight_info.as_ref()
    }

    /// Where the latest firmware's manifest was stored, after a re-restore
    /// reconciled the baseband.
    pub fn ota_manifest_path(&self) -> Option<&Path> {
        self.ota_manifest_path.as_deref()
    }

    fn progress(&mut self, step: Step, fraction: f64) {
        if let Some(cb) = self.progress_cb.as_mut() {
            cb(step, fraction);
        }
    }

    fn product_type(&self) -> &str {
        self.device.map_or("", |d| d.product_type)
    }

    fn hardware_model(&self) -> &str {
        self.device.map_or("", |d| d.hardware_model)
    }
}

impl Default for RestoreClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A re-restore with no install option means Erase; later reconciliation
/// may still switch it to Update.
fn normalize_flags(flags: &mut Flags) {
    if flags.contains(Flags::RERESTORE) && !flags.intersects(Flags::ERASE | Flags::UPDATE) {
        flags.insert(Flags::ERASE);
    }
}

/// Replace the stored nonce if the device reported a different one. Returns
/// whether it changed.
fn update_nonce(current: &mut Option<Vec<u8>>, new: Vec<u8>) -> bool {
    if current.as_deref() == Some(new.as_slice()) {
        return false;
    }
    *current = Some(new);
    true
}

/// Append a suffix to a path's final component, keeping the extension:
/// `058-1234.dmg` + `.lock` -> `058-1234.dmg.lock`.
fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(std::ffi::OsString::new, std::ffi::OsStr::to_os_string);
    name.push(suffix);
    path.with_file_name(name)
}

/// Run the restore. On failure the error carries the exit code: -1 for
/// general errors, -2 for restore-phase errors, -5 for mode-transition
/// errors.
pub fn run(
    client: &mut RestoreClient,
    provider: &mut dyn TransportProvider,
    cancel_signal: &AtomicBool,
) -> std::result::Result<(), Failure> {
    // Normalize the flag set before anything else looks at it.
    normalize_flags(&mut client.flags);
    if client.flags.contains(Flags::LATEST) && client.flags.contains(Flags::CUSTOM) {
        return Err(fail(-1)(anyhow!("LATEST cannot be combined with CUSTOM")));
    }
    if client.ipsw_path.is_none() && !client.flags.contains(Flags::LATEST) {
        return Err(fail(-1)(anyhow!("No firmware archive given")));
    }

    client.progress(Step::Detect, 0.0);

    // Version data is wanted, not required; later consumers cope without it.
    let version_data = match version::load(client.cache_dir.as_deref(), cancel_signal) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("Could not load version data: {e}");
            None
        }
    };

    client.mode = probe_mode(provider);
    if client.mode == Mode::Unknown {
        return Err(fail(-1)(anyhow!(
            "Unable to discover device mode. Please make sure a device is attached"
        )));
    }
    client.progress(Step::Detect, 0.1);
    info!("Found device in {} mode", client.mode);

    if client.mode == Mode::Wtf {
        wtf_into_dfu(client, provider, version_data.as_ref(), cancel_signal)
            .map_err(fail(-1))?;
        client.mode = Mode::Dfu;
    }

    // Resolve the hardware model from whatever mode we are in.
    {
        let mut dev = DeviceClient::open(provider, client.mode)
            .map_err(|e| fail(-1)(anyhow!("Unable to discover device model: {e}")))?;
        let model = dev
            .hardware_model()
            .map_err(|e| fail(-1)(anyhow!("Unable to discover device model: {e}")))?;
        client.device = Some(device_by_hardware_model(&model).map_err(|e| fail(-1)(e.into()))?);
        if let Ok(srnm) = dev.serial_number() {
            client.srnm = Some(srnm);
        }
    }
    client.progress(Step::Detect, 0.2);
    info!(
        "Identified device as {}, {}",
        client.hardware_model(),
        client.product_type()
    );

    if client.flags.contains(Flags::LATEST) {
        let version_data = version_data
            .as_ref()
            .ok_or_else(|| fail(-1)(anyhow!("Version data required for latest firmware")))?;
        let path = version::download_latest_firmware(
            version_data,
            client.product_type(),
            client.cache_dir.as_deref(),
            cancel_signal,
        )
        .map_err(|e| fail(-1)(e.into()))?;
        client.ipsw_path = Some(path);
    }
    client.progress(Step::Detect, 0.6);

    if client.flags.contains(Flags::NO_ACTION) {
        return Ok(());
    }

    // A device stuck in restore mode has to be rebooted before we can
    // drive it through a fresh restore.
    if client.mode == Mode::Restore {
        {
            let mut restore = provider
                .open_restore()
                .map_err(|e| fail(-2)(anyhow!("Unable to exit restore mode: {e}")))?;
            restore
                .reboot()
                .map_err(|e| fail(-2)(anyhow!("Unable to exit restore mode: {e}")))?;
        }
        client.mode = probe_mode(provider);
        if client.mode == Mode::Unknown {
            return Err(fail(-1)(anyhow!("Unable to discover device mode")));
        }
        info!("Found device in {} mode", client.mode);
    }

    let ipsw_path = client.ipsw_path.clone().unwrap();
    let ipsw = Ipsw::open(&ipsw_path).map_err(|e| fail(-1)(e.into()))?;

    info!("Extracting BuildManifest from IPSW");
    let (manifest, ticket_enabled) =
        ipsw::extract_build_manifest(&ipsw).map_err(|e| fail(-1)(e.into()))?;
    client.progress(Step::Detect, 0.8);

    manifest
        .check_compatibility(client.product_type())
        .context("This firmware is not suitable for the current device")
        .map_err(fail(-1))?;

    let version_info = manifest.version_info().map_err(|e| fail(-1)(e.into()))?;
    info!("Product Version: {}", version_info.version);
    info!(
        "Product Build: {} Major: {}",
        version_info.build, version_info.build_major
    );
    client.version = Some(version_info.version.clone());
    client.build = Some(version_info.build.clone());
    client.build_major = version_info.build_major;

    client.image4_supported = {
        let mut dev = DeviceClient::open(provider, client.mode).map_err(|e| fail(-1)(e.into()))?;
        dev.image4_supported().unwrap_or(false)
    };
    debug!("Device supports Image4: {}", client.image4_supported);
    if client.image4_supported {
        return Err(fail(-1)(anyhow!(
            "This tool does not support devices using the Image4 format"
        )));
    }

    let mut identity = select_identity(&manifest, client).map_err(fail(-1))?;

    client.progress(Step::Prepare, 0.0);
    debug!("Getting device's ECID for the signing request");
    {
        let mut dev = DeviceClient::open(provider, client.mode).map_err(|e| fail(-1)(e.into()))?;
        client.ecid = dev
            .ecid()
            .map_err(|e| fail(-1)(anyhow!("Unable to find device ECID: {e}")))?;
        info!("Found ECID {}", client.ecid);

        if client.build_major > 8 {
            // The first nonce read on older firmware may fail; that's fine.
            match dev.ap_nonce() {
                Ok(nonce) => {
                    update_nonce(&mut client.nonce, nonce);
                }
                Err(e) => info!("Unable to get nonce from device: {e}"),
            }
        }
    }

    fetch_ticket(client, provider, &identity)
        .context("Unable to get signing ticket for this device")
        .map_err(fail(-1))?;

    if client.flags.contains(Flags::SHSH_ONLY) {
        return save_ticket_only(client).map_err(fail(-1));
    }

    if ticket_enabled && client.flags.contains(Flags::RERESTORE) {
        if let Some(ticket) = client.tss.clone() {
            let model = client.hardware_model().to_owned();
            ramdisk::reconcile(
                &manifest,
                &ipsw,
                &model,
                &mut client.flags,
                &mut identity,
                &ticket,
            )
            .map_err(fail(-1))?;
        } else {
            warn!("No ticket in signing response");
        }
    }

    identity.log_information();

    if ticket_enabled && client.tss.is_none() {
        return Err(fail(-1)(anyhow!("Unable to proceed without a ticket")));
    }
    if let Some(tss_dict) = client.tss.as_mut() {
        tss::fixup_ticket(tss_dict);
    }
    client.progress(Step::Prepare, 0.1);

    let fs_entry = identity
        .component_path("OS")
        .context("Unable to get path for filesystem component")
        .map_err(fail(-1))?;
    let (filesystem, delete_fs) =
        obtain_filesystem(&ipsw, client.cache_dir.as_deref(), &fs_entry, cancel_signal)
            .map_err(fail(-1))?;
    let fs_guard = TempFileGuard {
        path: filesystem.clone(),
        armed: delete_fs,
    };

    // Mode transitions toward the recovery shell.
    if client.mode == Mode::Normal {
        info!("Entering recovery mode...");
        let mut dev = DeviceClient::open(provider, client.mode).map_err(|e| fail(-5)(e.into()))?;
        dev.enter_recovery()
            .map_err(|e| fail(-5)(anyhow!("Unable to place device into recovery mode: {e}")))?;
        drop(dev);
        if !wait_for_mode(provider, Mode::Recovery) {
            return Err(fail(-5)(anyhow!("Device did not reach recovery mode")));
        }
        client.mode = Mode::Recovery;
    }
    client.progress(Step::Prepare, 0.3);

    if client.mode == Mode::Dfu {
        dfu_enter_recovery(client, provider, &ipsw, &identity)
            .context("Unable to place device into recovery mode from DFU mode")
            .map_err(fail(-2))?;
    } else {
        let mut recovery = provider.open_recovery().map_err(|e| fail(-1)(e.into()))?;
        if client.build_major > 8 {
            if let Err(e) = send_ticket(client, recovery.as_mut()) {
                warn!("Unable to send ticket: {e}");
            }
        }
        send_ibec(client, recovery.as_mut(), &ipsw, &identity).map_err(fail(-2))?;
        drop(recovery);

        // Give the image time to boot before polling for the new shell.
        thread::sleep(Duration::from_secs(2));
        wait_for_mode(provider, Mode::Recovery);
    }
    client.mode = Mode::Recovery;

    // iBEC reports its health through the boot-stage flags.
    {
        let mut recovery = provider
            .open_recovery()
            .map_err(|e| fail(-1)(anyhow!("Couldn't query device info: {e}")))?;
        let info = recovery.device_info();
        if let Some(srnm) = &info.srnm {
            client.srnm = Some(srnm.clone());
        }
        check_ibfl(client, info.ibfl).map_err(fail(-1))?;
    }
    client.progress(Step::Prepare, 0.5);

    if client.flags.contains(Flags::RERESTORE) {
        let version_data = version_data
            .as_ref()
            .ok_or_else(|| fail(-1)(anyhow!("Version data required for baseband firmware")))?;
        let artifacts = baseband::reconcile(
            version_data,
            &ipsw,
            &identity,
            client.product_type(),
            client.flags,
            client.cache_dir.as_deref(),
        )
        .map_err(fail(-1))?;
        client.baseband_path = artifacts.baseband_path;
        client.ota_manifest_path = Some(artifacts.remote_manifest_path);
    }

    if !client.image4_supported && client.build_major > 8 {
        refresh_ticket_for_nonce(client, provider, &identity).map_err(fail(-2))?;
    }
    client.progress(Step::Prepare, 0.7);

    if client.mode == Mode::Recovery {
        if client.srnm.is_none() {
            return Err(fail(-1)(anyhow!(
                "Could not retrieve device serial number. Can't continue"
            )));
        }
        recovery_enter_restore(client, provider, &ipsw, &identity)
            .context("Unable to place device into restore mode")
            .map_err(fail(-2))?;
        client.mode = Mode::Restore;
    }
    client.progress(Step::Prepare, 0.9);

    if client.mode == Mode::Restore {
        info!("About to restore device...");
        let source = RestoreSource {
            identity: &identity,
            ticket: client.tss.as_ref(),
            ipsw: &ipsw,
            filesystem: &filesystem,
            baseband: client.baseband_path.as_deref(),
            keep_personalized: client.keep_personalized,
        };
        let mut restore = provider.open_restore().map_err(|e| fail(-2)(e.into()))?;
        restore
            .start_restore(&source)
            .map_err(|e| fail(-2)(anyhow!("Unable to restore device: {e}")))?;
    }

    info!("Cleaning up...");
    drop(fs_guard);

    // Set-top boxes are left waiting in recovery; boot them back out.
    if client.product_type().starts_with("AppleTV") {
        match provider.open_recovery() {
            Ok(mut recovery) => {
                if recovery.set_autoboot(true).is_ok() {
                    let _ = recovery.send_command("reset");
                } else {
                    warn!("Setting auto-boot failed");
                }
            }
            Err(_) => warn!("Could not connect to device in recovery mode"),
        }
    }

    info!("DONE");
    client.progress(Step::Restore, 1.0);

    Ok(())
}

fn select_identity(manifest: &BuildManifest, client: &RestoreClient) -> Result<BuildIdentity> {
    let model = client.hardware_model();

    if client.flags.contains(Flags::ERASE) {
        manifest
            .identity_for_model_and_behavior(model, Some(Behavior::Erase))?
            .ok_or_else(|| anyhow!("Unable to find any build identities"))
    } else if client.flags.contains(Flags::UPDATE) {
        // Older firmware has no Update identity; fall back to the first
        // identity for the model.
        match manifest.identity_for_model_and_behavior(model, Some(Behavior::Update))? {
            Some(identity) => Ok(identity),
            None => manifest
                .identity_for_model(model)?
                .ok_or_else(|| anyhow!("Unable to find any build identities")),
        }
    } else {
        bail!("No install option chosen");
    }
}

/// WTF mode predates DFU proper; upload the WTF stage so the device
/// re-enumerates as DFU.
fn wtf_into_dfu(
    client: &RestoreClient,
    provider: &mut dyn TransportProvider,
    version_data: Option<&version::VersionData>,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut dfu = provider
        .open_dfu()
        .context("Could not open device in WTF mode")?;
    let cpid = dfu.device_info().cpid;
    if cpid == 0 {
        bail!("Could not get CPID for WTF mode device");
    }

    let wtf_name = format!("Firmware/dfu/WTF.s5l{cpid:04x}xall.RELEASE.dfu");

    // Prefer the WTF stage from the local archive.
    let mut wtf_data = client
        .ipsw_path
        .as_deref()
        .and_then(|path| Ipsw::open(path).ok())
        .and_then(|archive| archive.extract_to_memory(&wtf_name).ok());

    if wtf_data.is_none() {
        let url = match version_data.and_then(version::VersionData::wtf_firmware_url) {
            Some(url) => url,
            None => {
                info!("Using hardcoded recovery archive URL");
                WTF_FALLBACK_URL.to_owned()
            }
        };

        let name = crate::util::url_basename(&url);
        let local = match client.cache_dir.as_deref() {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                dir.join(name)
            }
            None => PathBuf::from(name),
        };
        if !local.is_file() {
            crate::download::download_to_file(&url, &local, cancel_signal)?;
        }

        wtf_data = Some(
            Ipsw::open(&local)?
                .extract_to_memory(&wtf_name)
                .context("Could not extract WTF stage")?,
        );
    }

    dfu.send_buffer(&wtf_data.unwrap())
        .context("Could not send WTF stage")?;
    drop(dfu);

    // Give the device a moment to re-enumerate as DFU.
    thread::sleep(Duration::from_secs(1));

    Ok(())
}

/// Acquire a ticket: local cache first for re-restores, then the signing
/// service.
fn fetch_ticket(
    client: &mut RestoreClient,
    provider: &mut dyn TransportProvider,
    identity: &BuildIdentity,
) -> Result<()> {
    client.tss = None;

    if client.flags.contains(Flags::RERESTORE) {
        info!("Checking for local ticket");
        if let (Some(version), Some(build)) = (client.version.clone(), client.build.clone()) {
            let path = shsh::ticket_path(
                client.cache_dir.as_deref(),
                client.ecid,
                client.product_type(),
                &version,
                &build,
            );
            if path.is_file() {
                match shsh::load_ticket(&path) {
                    Ok(ticket) => {
                        info!("Using local ticket from {path:?}");
                        client.tss = Some(ticket);
                        return Ok(());
                    }
                    Err(e) => warn!("Could not read cached ticket {path:?}: {e}"),
                }
            } else {
                info!("No local ticket at {path:?}");
            }
        } else {
            warn!("No version known for local ticket lookup");
        }

        info!("Checking the community ticket mirror");
        client.tss_url = tss::CYDIA_TSS_URL.to_owned();
    } else {
        info!("Trying to fetch a new ticket");
    }

    let mut parameters = Dictionary::new();
    parameters.insert("ApECID".into(), Value::Integer(client.ecid.into()));
    if let Some(nonce) = &client.nonce {
        parameters.insert("ApNonce".into(), Value::Data(nonce.clone()));
    }
    if let Ok(mut dev) = DeviceClient::open(provider, client.mode) {
        // SEP nonce is best-effort; most 32-bit devices have no SEP.
        if let Ok(sep_nonce) = dev.sep_nonce() {
            parameters.insert("ApSepNonce".into(), Value::Data(sep_nonce));
        }
    }
    parameters.insert("ApProductionMode".into(), Value::Boolean(true));
    if client.image4_supported {
        parameters.insert("ApSecurityMode".into(), Value::Boolean(true));
        parameters.insert("ApSupportsImg4".into(), Value::Boolean(true));
    } else {
        parameters.insert("ApSupportsImg4".into(), Value::Boolean(false));
    }
    tss::parameters_from_identity(&mut parameters, identity);

    let mut request = tss::Request::new();
    request.add_common_tags(&parameters);
    request.add_ap_tags(&parameters);
    if client.image4_supported {
        request.add_ap_img4_tags(&parameters);
    } else {
        request.add_ap_img3_tags(&parameters);
    }

    if client.mode == Mode::Normal {
        // A booted device can request a baseband ticket along with the rest.
        let preflight = DeviceClient::open(provider, client.mode)
            .ok()
            .and_then(|mut dev| dev.preflight_info().ok())
            .flatten();
        if let Some(preflight) = &preflight {
            for (source_key, param_key) in [
                ("Nonce", "BbNonce"),
                ("ChipID", "BbChipID"),
                ("CertID", "BbGoldCertId"),
                ("ChipSerialNo", "BbSNUM"),
            ] {
                if let Some(value) = preflight.get(source_key) {
                    parameters.insert(param_key.to_owned(), value.clone());
                }
            }
            request.add_baseband_tags(&parameters);
        }
        client.preflight_info = preflight;
    }

    let response = request.send(&client.tss_url)?;
    info!("Received signing ticket");

    if client.flags.contains(Flags::RERESTORE) {
        // Any follow-up request (eg. after a nonce change) goes to the
        // official endpoint.
        client.tss_url = tss::TSS_URL.to_owned();
    }

    client.tss = Some(response);
    Ok(())
}

/// The `SHSH_ONLY` short-circuit: persist the ticket and stop.
fn save_ticket_only(client: &mut RestoreClient) -> Result<()> {
    let ticket = client
        .tss
        .as_ref()
        .ok_or_else(|| anyhow!("Could not fetch a ticket"))?;

    let path = shsh::ticket_path(
        client.cache_dir.as_deref(),
        client.ecid,
        client.product_type(),
        client.version.as_deref().unwrap_or(""),
        client.build.as_deref().unwrap_or(""),
    );
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.is_file() {
        info!("Ticket {path:?} already present");
    } else {
        shsh::save_ticket(&path, ticket)?;
        info!("Ticket saved to {path:?}");
    }

    Ok(())
}

/// Find or extract the filesystem image, sharing the cache directory with
/// concurrent runs. The advisory lock only guards sentinel creation; the
/// sentinel file itself is what excludes other extractors.
fn obtain_filesystem(
    ipsw: &Ipsw,
    cache_dir: Option<&Path>,
    fs_entry: &str,
    cancel_signal: &AtomicBool,
) -> Result<(PathBuf, bool)> {
    let target = ipsw::cached_filesystem_path(cache_dir, ipsw.path(), fs_entry);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if let Ok(metadata) = fs::metadata(&target) {
        if ipsw.entry_size(fs_entry).ok() == Some(metadata.len()) {
            info!("Using cached filesystem from {target:?}");
            return Ok((target, false));
        }
    }

    let sentinel = path_with_suffix(&target, ".extract");
    let lock_path = path_with_suffix(&target, ".lock");

    let claimed = {
        let _lock = LockFile::acquire(&lock_path)?;
        if sentinel.exists() {
            false
        } else {
            fs::File::create(&sentinel)?;
            true
        }
    };

    let (dest, delete_fs) = if claimed {
        (sentinel.clone(), false)
    } else {
        // Another run owns the sentinel; extract to a unique name and throw
        // it away afterwards.
        let temp = tempfile::Builder::new()
            .prefix("ipsw_")
            .tempfile_in(target.parent().unwrap_or(Path::new(".")))?
            .into_temp_path()
            .keep()?;
        (temp, true)
    };

    info!("Extracting filesystem from IPSW");
    if let Err(e) = ipsw.extract_to_file(fs_entry, &dest, cancel_signal) {
        if claimed {
            let _ = fs::remove_file(&sentinel);
        }
        return Err(e.into());
    }

    if claimed {
        let _ = fs::remove_file(&target);
        fs::rename(&dest, &target)?;
        Ok((target, false))
    } else {
        Ok((dest, delete_fs))
    }
}

/// Poll for the device to show up in `mode`: half-second steps, ten second
/// ceiling.
fn wait_for_mode(provider: &mut dyn TransportProvider, mode: Mode) -> bool {
    for _ in 0..20 {
        if probe_mode(provider) == mode {
            return true;
        }
        thread::sleep(Duration::from_millis(500));
    }
    false
}

fn send_ticket(client: &RestoreClient, recovery: &mut dyn RecoveryTransport) -> Result<()> {
    let ticket = client
        .tss
        .as_ref()
        .and_then(tss::ap_ticket)
        .ok_or_else(|| anyhow!("No raw ticket available"))?;

    info!("Sending ticket...");
    recovery.send_buffer(&ticket)?;
    recovery.send_command("ticket")?;
    Ok(())
}

fn send_component(
    client: &RestoreClient,
    recovery: &mut dyn RecoveryTransport,
    ipsw: &Ipsw,
    identity: &BuildIdentity,
    component: &str,
) -> Result<()> {
    let path = identity.component_path(component)?;
    let data = ipsw.extract_to_memory(&path)?;
    let personalized = personalize::personalize(
        component,
        &data,
        client.tss.as_ref(),
        client.keep_personalized,
    )?;

    info!("Sending {component} ({} bytes)...", personalized.len());
    recovery.send_buffer(&personalized)?;
    Ok(())
}

fn send_ibec(
    client: &RestoreClient,
    recovery: &mut dyn RecoveryTransport,
    ipsw: &Ipsw,
    identity: &BuildIdentity,
) -> Result<()> {
    send_component(client, recovery, ipsw, identity, "iBEC")
        .context("Unable to send iBEC")?;
    recovery.send_command("go")?;
    Ok(())
}

/// Bootstrap the recovery shell from DFU: upload the personalized iBEC and
/// wait for the device to come back.
fn dfu_enter_recovery(
    client: &RestoreClient,
    provider: &mut dyn TransportProvider,
    ipsw: &Ipsw,
    identity: &BuildIdentity,
) -> Result<()> {
    let path = identity.component_path("iBEC")?;
    let data = ipsw.extract_to_memory(&path)?;
    let personalized = personalize::personalize(
        "iBEC",
        &data,
        client.tss.as_ref(),
        client.keep_personalized,
    )?;

    {
        let mut dfu = provider.open_dfu()?;
        info!("Sending iBEC ({} bytes)...", personalized.len());
        dfu.send_buffer(&personalized)?;
    }

    thread::sleep(Duration::from_secs(2));
    wait_for_mode(provider, Mode::Recovery);

    Ok(())
}

/// Interpret the boot-stage flags after the iBEC upload.
fn check_ibfl(client: &RestoreClient, ibfl: u32) -> Result<()> {
    match ibfl {
        0x03 | 0x1B => {
            if client.flags.contains(Flags::CUSTOM)
                || !(client.build_major == 9 || client.build_major == 13)
            {
                bail!("Failed to enter iBEC");
            }
            bail!("Failed to enter iBEC. Your ticket might not be usable for re-restoring");
        }
        0x1A | 0x02 => {
            info!("Successfully entered iBEC");
            Ok(())
        }
        // Undocumented values proceed silently.
        _ => Ok(()),
    }
}

/// A nonce regenerated by the iBEC invalidates the ticket; re-request it
/// before anything relies on it. Ramdisk reconciliation is not re-run for
/// the fresh ticket.
fn refresh_ticket_for_nonce(
    client: &mut RestoreClient,
    provider: &mut dyn TransportProvider,
    identity: &BuildIdentity,
) -> Result<()> {
    let nonce = {
        let mut dev = DeviceClient::open(provider, Mode::Recovery)?;
        match dev.ap_nonce() {
            Ok(nonce) => nonce,
            Err(e) => {
                if let Ok(mut recovery) = provider.open_recovery() {
                    let _ = recovery.send_command("reset");
                }
                bail!("Unable to get nonce from device: {e}");
            }
        }
    };

    if update_nonce(&mut client.nonce, nonce) {
        debug!("Nonce changed, requesting a fresh ticket");
        client.tss = None;
        fetch_ticket(client, provider, identity)?;
        if client.tss.is_none() {
            bail!("Can't continue without a ticket");
        }
        if let Some(tss_dict) = client.tss.as_mut() {
            tss::fixup_ticket(tss_dict);
        }
    }

    Ok(())
}

/// Boot the restore ramdisk: upload the personalized restore triplet and
/// kick off the kernel.
fn recovery_enter_restore(
    client: &RestoreClient,
    provider: &mut dyn TransportProvider,
    ipsw: &Ipsw,
    identity: &BuildIdentity,
) -> Result<()> {
    {
        let mut recovery = provider.open_recovery()?;
        for (component, command) in [
            ("RestoreRamDisk", "ramdisk"),
            ("RestoreDeviceTree", "devicetree"),
            ("RestoreKernelCache", "bootx"),
        ] {
            send_component(client, recovery.as_mut(), ipsw, identity, component)?;
            recovery.send_command(command)?;
        }
    }

    if !wait_for_mode(provider, Mode::Restore) {
        bail!("Device did not reach restore mode");
    }

    Ok(())
}

/// Deletes a temporary filesystem extraction on scope exit.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use plist::Value;

    use super::*;
    use crate::device::{
        transport::{DfuKind, DfuTransport, NormalTransport, RestoreTransport},
        DeviceInfo, Error as DeviceError, IBOOT_FLAG_IMAGE4_AWARE,
    };

    struct MockRecovery {
        info: DeviceInfo,
    }

    impl RecoveryTransport for MockRecovery {
        fn device_info(&self) -> &DeviceInfo {
            &self.info
        }
        fn send_buffer(&mut self, _data: &[u8]) -> crate::device::Result<()> {
            Ok(())
        }
        fn send_command(&mut self, _command: &str) -> crate::device::Result<()> {
            Ok(())
        }
        fn set_autoboot(&mut self, _enable: bool) -> crate::device::Result<()> {
            Ok(())
        }
        fn reboot(&mut self) -> crate::device::Result<()> {
            Ok(())
        }
    }

    /// A device sitting in recovery mode and answering nothing else.
    struct RecoveryOnlyProvider {
        info: DeviceInfo,
    }

    impl TransportProvider for RecoveryOnlyProvider {
        fn probe_recovery(&mut self) -> crate::device::Result<bool> {
            Ok(true)
        }
        fn probe_dfu(&mut self) -> crate::device::Result<Option<DfuKind>> {
            Ok(None)
        }
        fn probe_normal(&mut self) -> crate::device::Result<bool> {
            Ok(false)
        }
        fn probe_restore(&mut self) -> crate::device::Result<bool> {
            Ok(false)
        }
        fn open_dfu(&mut self) -> crate::device::Result<Box<dyn DfuTransport>> {
            Err(DeviceError::InvalidState)
        }
        fn open_recovery(&mut self) -> crate::device::Result<Box<dyn RecoveryTransport>> {
            Ok(Box::new(MockRecovery {
                info: self.info.clone(),
            }))
        }
        fn open_normal(&mut self) -> crate::device::Result<Box<dyn NormalTransport>> {
            Err(DeviceError::InvalidState)
        }
        fn open_restore(&mut self) -> crate::device::Result<Box<dyn RestoreTransport>> {
            Err(DeviceError::InvalidState)
        }
    }

    fn recovery_device(ecid: u64, ibfl: u32) -> DeviceInfo {
        DeviceInfo {
            cpid: 0x8950,
            bdid: 0x02,
            ecid,
            ibfl,
            srnm: Some("F17TESTSRNM".to_owned()),
            ..DeviceInfo::default()
        }
    }

    fn write_test_ipsw(dir: &Path) -> PathBuf {
        let mut info = Dictionary::new();
        info.insert("DeviceClass".into(), Value::String("N42AP".into()));
        info.insert("RestoreBehavior".into(), Value::String("Erase".into()));
        info.insert("Variant".into(), Value::String("Customer Erase Install".into()));

        let mut ident = Dictionary::new();
        ident.insert("Info".into(), Value::Dictionary(info));
        ident.insert("Manifest".into(), Value::Dictionary(Dictionary::new()));
        ident.insert("UniqueBuildID".into(), Value::Data(vec![0xAB; 8]));

        let mut manifest = Dictionary::new();
        manifest.insert(
            "BuildIdentities".into(),
            Value::Array(vec![Value::Dictionary(ident)]),
        );
        manifest.insert("ProductVersion".into(), Value::String("8.4.1".into()));
        manifest.insert("ProductBuildVersion".into(), Value::String("12H321".into()));
        manifest.insert(
            "SupportedProductTypes".into(),
            Value::Array(vec![Value::String("iPhone5,2".into())]),
        );

        let mut xml = Vec::new();
        Value::Dictionary(manifest).to_writer_xml(&mut xml).unwrap();

        let path = dir.join("iPhone5,2_8.4.1_12H321.ipsw");
        let mut writer = zip::ZipWriter::new(fs::File::create(&path).unwrap());
        writer
            .start_file("BuildManifest.plist", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(&xml).unwrap();
        writer.finish().unwrap();
        path
    }

    fn write_fresh_version_data(cache_dir: &Path) {
        let mut xml = Vec::new();
        Value::Dictionary(Dictionary::new())
            .to_writer_xml(&mut xml)
            .unwrap();
        fs::write(cache_dir.join("version.xml"), xml).unwrap();
    }

    #[test]
    fn image4_capable_devices_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw_path = write_test_ipsw(dir.path());
        write_fresh_version_data(dir.path());

        let mut client = RestoreClient::new();
        client.set_flags(Flags::ERASE);
        client.set_ipsw(&ipsw_path);
        client.set_cache_dir(dir.path());

        let mut provider = RecoveryOnlyProvider {
            info: recovery_device(99, IBOOT_FLAG_IMAGE4_AWARE),
        };
        let cancel = AtomicBool::new(false);

        let failure = run(&mut client, &mut provider, &cancel).unwrap_err();
        assert_eq!(failure.code, -1);
        assert!(failure.source.to_string().contains("Image4"));
    }

    #[test]
    fn shsh_only_stops_after_saving_the_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw_path = write_test_ipsw(dir.path());
        write_fresh_version_data(dir.path());

        // Seed the ticket cache so no signing server is consulted.
        let mut ticket = Dictionary::new();
        ticket.insert("APTicket".into(), Value::Data(vec![0x30, 0x82, 0, 0]));
        let ticket_path =
            shsh::ticket_path(Some(dir.path()), 99, "iPhone5,2", "8.4.1", "12H321");
        fs::create_dir_all(ticket_path.parent().unwrap()).unwrap();
        shsh::save_ticket(&ticket_path, &ticket).unwrap();

        let mut client = RestoreClient::new();
        client.set_flags(Flags::RERESTORE | Flags::SHSH_ONLY);
        client.set_ipsw(&ipsw_path);
        client.set_cache_dir(dir.path());

        let mut provider = RecoveryOnlyProvider {
            info: recovery_device(99, 0x02),
        };
        let cancel = AtomicBool::new(false);

        // Stops after the ticket step; a restore attempt would hit the
        // provider's InvalidState restore transport and fail.
        run(&mut client, &mut provider, &cancel).unwrap();
        assert!(ticket_path.is_file());
    }

    #[test]
    fn rerestore_without_install_option_means_erase() {
        let mut flags = Flags::RERESTORE;
        normalize_flags(&mut flags);
        assert_eq!(flags, Flags::RERESTORE | Flags::ERASE);

        let mut flags = Flags::RERESTORE | Flags::UPDATE;
        normalize_flags(&mut flags);
        assert_eq!(flags, Flags::RERESTORE | Flags::UPDATE);

        let mut flags = Flags::empty();
        normalize_flags(&mut flags);
        assert_eq!(flags, Flags::empty());
    }

    #[test]
    fn nonce_updates_only_on_change() {
        let mut current = None;
        assert!(update_nonce(&mut current, vec![1, 2, 3]));
        assert!(!update_nonce(&mut current, vec![1, 2, 3]));
        assert!(update_nonce(&mut current, vec![1, 2, 3, 4]));
        assert!(update_nonce(&mut current, vec![9, 9, 9, 9]));
        assert_eq!(current, Some(vec![9, 9, 9, 9]));
    }

    #[test]
    fn suffixed_paths_keep_the_extension() {
        assert_eq!(
            path_with_suffix(Path::new("/cache/fw/058-1234.dmg"), ".lock"),
            Path::new("/cache/fw/058-1234.dmg.lock")
        );
        assert_eq!(
            path_with_suffix(Path::new("/cache/fw/058-1234.dmg"), ".extract"),
            Path::new("/cache/fw/058-1234.dmg.extract")
        );
    }
}
