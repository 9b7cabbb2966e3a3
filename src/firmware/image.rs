// (c) 2025 Ross Younger

//! MCUboot image decoding
//!
//! Layout on disk (all multi-byte fields little-endian):
//!
//! ```text
//! ┌────────────────┐ 0
//! │ header (32 B)  │   magic, load address, sizes, flags, version
//! ├────────────────┤ header_size
//! │ image body     │
//! ├────────────────┤ header_size + image_size
//! │ TLV section(s) │   2-byte magic, 2-byte total length, entries
//! └────────────────┘
//! ```
//!
//! Each TLV entry is `type:u8, pad:u8, length:u16, value`. Sections whose
//! magic is `0x6907` are unprotected, `0x6908` protected (covered by the
//! image signature). The unprotected entry of type `0x10` holds the SHA-256
//! of the image, which is how MCUmgr names images; an image without it is
//! unusable for management purposes and fails to decode.

use bytes::Buf;

use crate::{Error, Result};

/// Magic number opening the fixed header
const IMAGE_MAGIC: u32 = 0x96F3_B83D;
/// Magic of an unprotected TLV section
const TLV_INFO_MAGIC: u16 = 0x6907;
/// Magic of a protected TLV section
const TLV_PROT_INFO_MAGIC: u16 = 0x6908;
/// TLV type of the image SHA-256
const TLV_SHA256: u8 = 0x10;
/// On-disk size of the fixed header
const FIXED_HEADER_LEN: usize = 32;

/// An image's semantic version, from the fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageVersion {
    /// Major
    pub major: u8,
    /// Minor
    pub minor: u8,
    /// Revision
    pub revision: u16,
    /// Build number; 0 when unset
    pub build: u32,
}

impl std::fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

/// The decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Flash address the image is linked to run from
    pub load_addr: u32,
    /// Size of the header region (the body starts here; may exceed the
    /// 32 bytes actually defined)
    pub header_size: u16,
    /// Size of the image body
    pub image_size: u32,
    /// Image flag bits
    pub flags: u32,
    /// Image version
    pub version: ImageVersion,
}

/// One TLV trailer entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    /// Entry type
    pub tag: u8,
    /// Whether the entry came from a protected section
    pub protected: bool,
    /// Entry value
    pub value: Vec<u8>,
}

/// A decoded MCUboot image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuImage {
    /// The fixed header
    pub header: ImageHeader,
    /// All TLV entries, in file order
    pub tlv: Vec<TlvEntry>,
    /// The image SHA-256 from the unprotected TLV trailer
    pub hash: Vec<u8>,
    /// The complete file, as fed to upload
    pub content: Vec<u8>,
    /// SHA-256 of the complete file. Empty here; filled in when the image
    /// came out of a [package](super::decode_zip).
    pub sha: Vec<u8>,
}

/// Decodes an MCUboot image file
pub fn decode_image(bytes: &[u8]) -> Result<McuImage> {
    let header = decode_header(bytes)?;
    let tlv_start = usize::from(header.header_size)
        .checked_add(header.image_size as usize)
        .filter(|start| *start <= bytes.len())
        .ok_or_else(|| Error::Format("TLV trailer lies beyond end of file".into()))?;
    let tlv = decode_tlv_sections(&bytes[tlv_start..])?;
    let hash = tlv
        .iter()
        .find(|e| !e.protected && e.tag == TLV_SHA256)
        .ok_or_else(|| Error::Format("no image hash TLV".into()))?;
    if hash.value.len() != 32 {
        return Err(Error::Format(format!(
            "image hash TLV is {} bytes, want 32",
            hash.value.len()
        )));
    }
    let hash = hash.value.clone();
    Ok(McuImage {
        header,
        tlv,
        hash,
        content: bytes.to_vec(),
        sha: Vec::new(),
    })
}

fn decode_header(bytes: &[u8]) -> Result<ImageHeader> {
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(Error::Format(format!(
            "{}-byte file is too short for an image header",
            bytes.len()
        )));
    }
    let mut buf = bytes;
    let magic = buf.get_u32_le();
    if magic != IMAGE_MAGIC {
        return Err(Error::Format(format!("bad image magic {magic:#010x}")));
    }
    let load_addr = buf.get_u32_le();
    let header_size = buf.get_u16_le();
    let _reserved = buf.get_u16_le();
    let image_size = buf.get_u32_le();
    let flags = buf.get_u32_le();
    let version = ImageVersion {
        major: buf.get_u8(),
        minor: buf.get_u8(),
        revision: buf.get_u16_le(),
        build: buf.get_u32_le(),
    };
    let _pad = buf.get_u32_le();
    Ok(ImageHeader {
        load_addr,
        header_size,
        image_size,
        flags,
        version,
    })
}

/// Walks concatenated TLV sections to the end of the buffer
fn decode_tlv_sections(mut trailer: &[u8]) -> Result<Vec<TlvEntry>> {
    let mut entries = Vec::new();
    while !trailer.is_empty() {
        if trailer.len() < 4 {
            return Err(Error::Format("truncated TLV section header".into()));
        }
        let magic = u16::from_le_bytes([trailer[0], trailer[1]]);
        let protected = match magic {
            TLV_INFO_MAGIC => false,
            TLV_PROT_INFO_MAGIC => true,
            other => return Err(Error::Format(format!("bad TLV magic {other:#06x}"))),
        };
        let total = usize::from(u16::from_le_bytes([trailer[2], trailer[3]]));
        if total < 4 || total > trailer.len() {
            return Err(Error::Format(format!("TLV section length {total} invalid")));
        }
        let mut section = &trailer[4..total];
        while !section.is_empty() {
            if section.len() < 4 {
                return Err(Error::Format("truncated TLV entry".into()));
            }
            let tag = section[0];
            let len = usize::from(u16::from_le_bytes([section[2], section[3]]));
            if section.len() < 4 + len {
                return Err(Error::Format(format!(
                    "TLV entry of {len} bytes overruns its section"
                )));
            }
            entries.push(TlvEntry {
                tag,
                protected,
                value: section[4..4 + len].to_vec(),
            });
            section = &section[4 + len..];
        }
        trailer = &trailer[total..];
    }
    Ok(entries)
}
