// (c) 2025 Ross Younger

//! ZIP update packages
//!
//! Multi-image updates ship as a ZIP archive holding a `manifest.json` and
//! one MCUboot image per updateable core. The manifest names each binary
//! and says which image number it targets; everything else in it is
//! metadata for humans and build systems.

use std::io::{Cursor, Read as _};

use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use zip::ZipArchive;

use super::image::{McuImage, decode_image};
use crate::{Error, Result};

const MANIFEST_NAME: &str = "manifest.json";

/// `manifest.json`, as emitted by the Zephyr/nRF build systems.
///
/// Only `files` is required; everything else is carried through as-is for
/// callers that want it.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Manifest schema version
    #[serde(rename = "format-version", default)]
    pub format_version: Option<u32>,
    /// Build timestamp (Unix seconds)
    #[serde(default)]
    pub time: Option<u64>,
    /// Package name
    #[serde(default)]
    pub name: Option<String>,
    /// Source revisions of the firmware
    #[serde(default)]
    pub firmware: Option<FirmwareInfo>,
    /// The files making up the update
    pub files: Vec<ManifestEntry>,
}

/// Source revision block of the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareInfo {
    /// Zephyr revision
    #[serde(default)]
    pub zephyr: Option<RevisionInfo>,
    /// nRF Connect SDK revision
    #[serde(default)]
    pub nrf: Option<RevisionInfo>,
}

/// A single source revision
#[derive(Debug, Clone, Deserialize)]
pub struct RevisionInfo {
    /// VCS revision string
    #[serde(default)]
    pub revision: Option<String>,
}

/// One file entry in the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Archive member holding the binary
    pub file: String,
    /// Entry type, e.g. `application`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Board the binary was built for
    #[serde(default)]
    pub board: Option<String>,
    /// SoC name
    #[serde(default)]
    pub soc: Option<String>,
    /// Flash load address
    #[serde(default)]
    pub load_address: Option<u64>,
    /// Target image number, as a decimal string
    #[serde(default)]
    pub image_index: Option<String>,
    /// Primary slot index
    #[serde(default)]
    pub slot_index_primary: Option<String>,
    /// Secondary slot index
    #[serde(default)]
    pub slot_index_secondary: Option<String>,
    /// MCUboot-facing version string
    #[serde(rename = "version_MCUBOOT", default)]
    pub version_mcuboot: Option<String>,
    /// Binary size in bytes
    #[serde(default)]
    pub size: Option<u64>,
    /// Binary modification time (Unix seconds)
    #[serde(default)]
    pub modtime: Option<u64>,
    /// Free-form version field; a string or a number depending on tooling
    #[serde(default)]
    pub version: Option<serde_json::Value>,
}

/// One image out of a decoded package
#[derive(Debug, Clone)]
pub struct PackageImage {
    /// Target image number
    pub index: u32,
    /// The package's name
    pub name: String,
    /// Archive member the image came from
    pub file: String,
    /// MCUboot version string from the manifest
    pub version: Option<String>,
    /// Board from the manifest
    pub board: Option<String>,
    /// The decoded image, with [`sha`](McuImage::sha) filled in
    pub image: McuImage,
}

/// A decoded update package
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    /// Package name from the manifest (possibly empty)
    pub name: String,
    /// One entry per manifest file
    pub images: Vec<PackageImage>,
}

/// Decodes a ZIP update package
pub fn decode_zip(bytes: &[u8]) -> Result<FirmwarePackage> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::Format(format!("not a ZIP archive: {e}")))?;

    let manifest: Manifest = {
        let mut member = archive
            .by_name(MANIFEST_NAME)
            .map_err(|_| Error::Format("package has no manifest.json".into()))?;
        let mut text = String::new();
        let _ = member
            .read_to_string(&mut text)
            .map_err(|e| Error::Format(format!("manifest unreadable: {e}")))?;
        serde_json::from_str(&text).map_err(|e| Error::Format(format!("manifest invalid: {e}")))?
    };
    let name = manifest.name.clone().unwrap_or_default();

    let mut images = Vec::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        let mut binary = Vec::new();
        {
            let mut member = archive
                .by_name(&entry.file)
                .map_err(|_| Error::Format(format!("package member '{}' missing", entry.file)))?;
            let _ = member
                .read_to_end(&mut binary)
                .map_err(|e| Error::Format(format!("member '{}' unreadable: {e}", entry.file)))?;
        }
        let mut image = decode_image(&binary)?;
        image.sha = Sha256::digest(&binary).to_vec();
        let index = match &entry.image_index {
            None => 0,
            Some(s) => s
                .parse()
                .map_err(|_| Error::Format(format!("image_index '{s}' is not a number")))?,
        };
        images.push(PackageImage {
            index,
            name: name.clone(),
            file: entry.file.clone(),
            version: entry.version_mcuboot.clone(),
            board: entry.board.clone(),
            image,
        });
    }
    Ok(FirmwarePackage { name, images })
}
