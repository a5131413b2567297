// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::File, io::Write, path::Path};

use flate2::{write::GzEncoder, Compression};
use plist::{Dictionary, Value};
use reticket::format::shsh;

fn sample_ticket() -> Dictionary {
    let mut logo = Dictionary::new();
    logo.insert("Blob".into(), Value::Data(vec![0x5A; 64]));

    let mut ticket = Dictionary::new();
    ticket.insert("APTicket".into(), Value::Data(vec![0x30, 0x82, 0x04, 0x00]));
    ticket.insert("AppleLogo".into(), Value::Dictionary(logo));
    ticket
}

fn write_gz(path: &Path, body: &[u8]) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_all(body).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn filename_template() {
    let path = shsh::ticket_path(
        Some(Path::new("/cache")),
        1838221234567890,
        "iPhone5,2",
        "8.4.1",
        "12H321",
    );
    assert_eq!(
        path,
        Path::new("/cache/shsh/1838221234567890-iPhone5,2-8.4.1-12H321.shsh")
    );

    // Without a cache directory the shsh directory sits in the working dir.
    let path = shsh::ticket_path(None, 1, "iPad3,5", "9.3.5", "13G36");
    assert_eq!(path, Path::new("shsh/1-iPad3,5-9.3.5-13G36.shsh"));
}

#[test]
fn round_trip_preserves_the_ticket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("1-iPhone5,2-8.4.1-12H321.shsh");
    let ticket = sample_ticket();

    shsh::save_ticket(&path, &ticket).unwrap();
    let loaded = shsh::load_ticket(&path).unwrap();

    assert_eq!(loaded, ticket);
}

#[test]
fn reads_gzipped_xml_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xml.shsh");

    let mut xml = Vec::new();
    Value::Dictionary(sample_ticket())
        .to_writer_xml(&mut xml)
        .unwrap();
    write_gz(&path, &xml);

    let loaded = shsh::load_ticket(&path).unwrap();
    assert_eq!(loaded, sample_ticket());
}

#[test]
fn reads_gzipped_binary_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bin.shsh");

    let mut bin = Vec::new();
    Value::Dictionary(sample_ticket())
        .to_writer_binary(std::io::Cursor::new(&mut bin))
        .unwrap();
    assert_eq!(&bin[..8], b"bplist00");
    write_gz(&path, &bin);

    let loaded = shsh::load_ticket(&path).unwrap();
    assert_eq!(loaded, sample_ticket());
}

#[test]
fn rejects_non_dictionary_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.shsh");

    let mut xml = Vec::new();
    Value::Array(vec![Value::String("not a ticket".into())])
        .to_writer_xml(&mut xml)
        .unwrap();
    write_gz(&path, &xml);

    assert!(shsh::load_ticket(&path).is_err());
}

#[test]
fn rejects_truncated_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trunc.shsh");
    std::fs::write(&path, [0x1F, 0x8B, 0x00]).unwrap();

    assert!(shsh::load_ticket(&path).is_err());
}
