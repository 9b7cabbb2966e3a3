// (c) 2025 Ross Younger

//! Firmware file formats
//!
//! Two containers arrive at an updater's door: a bare MCUboot image
//! (`.bin`, a 32-byte header, the image body, then one or more TLV trailer
//! sections carrying hashes and signatures), and a ZIP update package
//! (a `manifest.json` plus one MCUboot image per updateable core, as
//! produced by Zephyr/nRF build systems).
//!
//! [`decode_image`] pulls the header apart and digs the SHA-256 out of the
//! TLV trailer, the hash that identifies the image to
//! [`set_pending_image`](crate::SmpClient::set_pending_image).
//! [`decode_zip`] unpacks a whole package, decoding each member image and
//! computing the binary's SHA-256 for upload resumption.

mod image;
pub use image::{ImageHeader, ImageVersion, McuImage, TlvEntry, decode_image};

mod package;
pub use package::{
    FirmwareInfo, FirmwarePackage, Manifest, ManifestEntry, PackageImage, RevisionInfo, decode_zip,
};
