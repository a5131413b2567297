// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Minimal reader/patcher for the legacy IMG3 signed container.
//!
//! The layout is a 20 byte object header followed by a flat sequence of
//! tags. The first 12 bytes of the file (magic, full size, buffer size) are
//! not covered by the signature; everything from offset 0xC onward is.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

/// File magic, little-endian `Img3`.
pub const HEADER_MAGIC: &[u8; 4] = b"3gmI";

/// Offset where the signed region begins.
pub const SIGNED_OFFSET: usize = 0xC;

/// Smallest possible IMG3: just the object header.
pub const MIN_SIZE: usize = 0x14;

/// Tag magic for the signature slot, little-endian `SHSH`.
const TAG_SHSH: &[u8; 4] = b"HSHS";

/// Size of a ticket-supplied signature blob.
pub const BLOB_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image too small to be an IMG3: {0} bytes")]
    TooSmall(usize),
    #[error("Invalid IMG3 magic: {0:02x?}")]
    InvalidMagic([u8; 4]),
    #[error("Tag at offset {offset:#x} exceeds image bounds")]
    TruncatedTag { offset: usize },
    #[error("Image has no signature slot")]
    NoSignatureSlot,
    #[error("Signature slot holds {actual} bytes; need at least {min}", min = BLOB_SIZE)]
    SignatureSlotTooSmall { actual: usize },
    #[error("Signature blob must be {min} bytes, but have {0}", min = BLOB_SIZE)]
    InvalidBlobSize(usize),
    #[error("I/O error when parsing IMG3")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Object header fields. Only the fields the restore path needs are kept.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Total size of the image, including this header.
    pub full_size: u32,
    /// Size of the tag buffer following the header.
    pub buf_size: u32,
    /// Size of the signed region. Zero means the image is unsigned.
    pub signed_size: u32,
    /// Image type fourcc, byte-reversed on disk.
    pub image_type: [u8; 4],
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_SIZE {
            return Err(Error::TooSmall(data.len()));
        }
        if &data[0..4] != HEADER_MAGIC {
            return Err(Error::InvalidMagic(data[0..4].try_into().unwrap()));
        }

        let mut reader = Cursor::new(&data[4..MIN_SIZE]);
        let full_size = reader.read_u32::<LittleEndian>()?;
        let buf_size = reader.read_u32::<LittleEndian>()?;
        let signed_size = reader.read_u32::<LittleEndian>()?;
        let mut image_type = [0u8; 4];
        reader.read_exact(&mut image_type)?;

        Ok(Self {
            full_size,
            buf_size,
            signed_size,
            image_type,
        })
    }
}

/// Whether the image carries no signature, ie. the dword at [`SIGNED_OFFSET`]
/// is zero. Short buffers are not considered unsigned; the caller decides how
/// to treat those.
pub fn is_unsigned(data: &[u8]) -> bool {
    data.len() >= SIGNED_OFFSET + 4 && data[SIGNED_OFFSET..SIGNED_OFFSET + 4] == [0, 0, 0, 0]
}

/// The signed portion of the image: everything from [`SIGNED_OFFSET`] to the
/// end of the buffer.
pub fn signed_region(data: &[u8]) -> Result<&[u8]> {
    if data.len() < MIN_SIZE {
        return Err(Error::TooSmall(data.len()));
    }
    Ok(&data[SIGNED_OFFSET..])
}

/// Locate a tag's data region within the tag stream. Returns the byte range
/// of the tag data in `data`.
fn find_tag(data: &[u8], magic: &[u8; 4]) -> Result<Option<(usize, usize)>> {
    let header = Header::parse(data)?;
    let end = (MIN_SIZE as u64 + u64::from(header.buf_size)).min(data.len() as u64) as usize;

    let mut reader = Cursor::new(data);
    reader.seek(SeekFrom::Start(MIN_SIZE as u64))?;

    while (reader.position() as usize) < end {
        let offset = reader.position() as usize;
        if offset + 12 > data.len() {
            return Err(Error::TruncatedTag { offset });
        }

        let mut tag = [0u8; 4];
        reader.read_exact(&mut tag)?;
        let skip_dist = reader.read_u32::<LittleEndian>()?;
        let data_len = reader.read_u32::<LittleEndian>()?;

        if skip_dist < 12 || offset + skip_dist as usize > data.len() {
            return Err(Error::TruncatedTag { offset });
        }
        let data_start = offset + 12;
        if data_start + data_len as usize > data.len() {
            return Err(Error::TruncatedTag { offset });
        }

        if &tag == magic {
            return Ok(Some((data_start, data_start + data_len as usize)));
        }

        reader.seek(SeekFrom::Start((offset + skip_dist as usize) as u64))?;
    }

    Ok(None)
}

/// Stitch a ticket-supplied signature blob into the image's signature slot,
/// returning the personalized copy. The image layout is unchanged; only the
/// leading [`BLOB_SIZE`] bytes of the slot are replaced.
pub fn stitch_signature(data: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() != BLOB_SIZE {
        return Err(Error::InvalidBlobSize(blob.len()));
    }

    let (start, end) = find_tag(data, TAG_SHSH)?.ok_or(Error::NoSignatureSlot)?;
    if end - start < BLOB_SIZE {
        return Err(Error::SignatureSlotTooSmall {
            actual: end - start,
        });
    }

    let mut stitched = data.to_vec();
    stitched[start..start + BLOB_SIZE].copy_from_slice(blob);
    Ok(stitched)
}
