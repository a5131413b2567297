// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::Cursor;

use assert_matches::assert_matches;
use plist::{Dictionary, Value};
use reticket::format::manifest::{Behavior, BuildManifest, Error};

fn identity(device_class: &str, behavior: &str, ramdisk_path: Option<&str>) -> Value {
    let mut info = Dictionary::new();
    info.insert("DeviceClass".into(), Value::String(device_class.into()));
    info.insert("RestoreBehavior".into(), Value::String(behavior.into()));
    info.insert(
        "Variant".into(),
        Value::String(format!("Customer {behavior} Install")),
    );

    let mut manifest = Dictionary::new();
    if let Some(path) = ramdisk_path {
        let mut component_info = Dictionary::new();
        component_info.insert("Path".into(), Value::String(path.into()));
        let mut component = Dictionary::new();
        component.insert("Info".into(), Value::Dictionary(component_info));
        manifest.insert("RestoreRamDisk".into(), Value::Dictionary(component));
    }
    // A component with a malformed entry: Info present but no Path.
    let mut broken = Dictionary::new();
    broken.insert("Info".into(), Value::Dictionary(Dictionary::new()));
    manifest.insert("KernelCache".into(), Value::Dictionary(broken));

    let mut ident = Dictionary::new();
    ident.insert("Info".into(), Value::Dictionary(info));
    ident.insert("Manifest".into(), Value::Dictionary(manifest));
    Value::Dictionary(ident)
}

fn manifest_xml() -> Vec<u8> {
    let identities = vec![
        identity("N41AP", "Erase", Some("038-5555.dmg")),
        identity("N42AP", "Erase", Some("038-1111.dmg")),
        identity("N42AP", "Update", Some("038-2222.dmg")),
        identity("N42AP", "Erase", Some("038-9999.dmg")),
    ];

    let mut dict = Dictionary::new();
    dict.insert("BuildIdentities".into(), Value::Array(identities));
    dict.insert("ProductVersion".into(), Value::String("8.4.1".into()));
    dict.insert("ProductBuildVersion".into(), Value::String("12H321".into()));
    dict.insert(
        "SupportedProductTypes".into(),
        Value::Array(vec![
            Value::String("iPhone5,1".into()),
            Value::String("iPhone5,2".into()),
        ]),
    );

    let mut xml = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut xml).unwrap();
    xml
}

fn parse() -> BuildManifest {
    BuildManifest::from_reader(Cursor::new(manifest_xml())).unwrap()
}

#[test]
fn first_matching_identity_wins() {
    let manifest = parse();

    // Two Erase identities exist for N42AP; the scan must return the first.
    let ident = manifest
        .identity_for_model_and_behavior("N42AP", Some(Behavior::Erase))
        .unwrap()
        .unwrap();
    assert_eq!(
        ident.component_path("RestoreRamDisk").unwrap(),
        "038-1111.dmg"
    );

    // Model matching is case-insensitive.
    let ident = manifest
        .identity_for_model_and_behavior("n42ap", Some(Behavior::Update))
        .unwrap()
        .unwrap();
    assert_eq!(
        ident.component_path("RestoreRamDisk").unwrap(),
        "038-2222.dmg"
    );

    // Without a behavior filter, the first identity for the model wins.
    let ident = manifest.identity_for_model("N42AP").unwrap().unwrap();
    assert_eq!(ident.restore_behavior(), Some("Erase"));
    assert_eq!(
        ident.component_path("RestoreRamDisk").unwrap(),
        "038-1111.dmg"
    );
}

#[test]
fn unmatched_identity_is_absent() {
    let manifest = parse();

    assert!(manifest
        .identity_for_model_and_behavior("N94AP", Some(Behavior::Erase))
        .unwrap()
        .is_none());
    assert!(manifest
        .identity_for_model_and_behavior("N41AP", Some(Behavior::Update))
        .unwrap()
        .is_none());
}

#[test]
fn compatibility_is_exact_product_membership() {
    let manifest = parse();

    assert!(manifest.check_compatibility("iPhone5,2").is_ok());
    assert!(manifest.check_compatibility("iPhone5,1").is_ok());
    assert_matches!(
        manifest.check_compatibility("iPhone5,3"),
        Err(Error::IncompatibleProduct(_))
    );
    // Product matching is case-sensitive, unlike model matching.
    assert_matches!(
        manifest.check_compatibility("iphone5,2"),
        Err(Error::IncompatibleProduct(_))
    );
}

#[test]
fn component_paths_are_verbatim_or_error() {
    let manifest = parse();
    let ident = manifest
        .identity_for_model_and_behavior("N42AP", Some(Behavior::Erase))
        .unwrap()
        .unwrap();

    assert_eq!(
        ident.component_path("RestoreRamDisk").unwrap(),
        "038-1111.dmg"
    );

    // Missing component vs. missing intermediate node are both errors, not
    // empty strings.
    assert_matches!(
        ident.component_path("RestoreLogo"),
        Err(Error::MissingComponent(_))
    );
    assert_matches!(
        ident.component_path("KernelCache"),
        Err(Error::MissingKey("Path"))
    );
}

#[test]
fn component_presence_check() {
    let manifest = parse();
    let ident = manifest.identity_for_model("N42AP").unwrap().unwrap();

    assert!(ident.has_component("RestoreRamDisk"));
    assert!(ident.has_component("KernelCache"));
    assert!(!ident.has_component("BasebandFirmware"));
}

#[test]
fn version_info_extraction() {
    let manifest = parse();
    let info = manifest.version_info().unwrap();

    assert_eq!(info.version, "8.4.1");
    assert_eq!(info.build, "12H321");
    assert_eq!(info.build_major, 12);
}

#[test]
fn identity_index_access() {
    let manifest = parse();

    assert_eq!(manifest.identity_count().unwrap(), 4);
    let ident = manifest.identity_at(2).unwrap().unwrap();
    assert_eq!(ident.restore_behavior(), Some("Update"));
    assert!(manifest.identity_at(4).unwrap().is_none());
}

#[test]
fn binary_manifests_parse_too() {
    let xml = manifest_xml();
    let value = Value::from_reader_xml(Cursor::new(&xml)).unwrap();
    let mut binary = Vec::new();
    value.to_writer_binary(Cursor::new(&mut binary)).unwrap();

    let manifest = BuildManifest::from_reader(Cursor::new(binary)).unwrap();
    assert_eq!(manifest.identity_count().unwrap(), 4);
}
