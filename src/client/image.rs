// (c) 2025 Ross Younger

//! Image management group (group 1)
//!
//! Firmware lives in numbered slots. The usual update dance is: upload into
//! the secondary slot, mark the new image pending ("test"), reset, and once
//! the new firmware has proven itself, confirm it so MCUboot stops
//! reverting on reboot.

use std::time::Duration;

use tracing::debug;

use super::SmpClient;
use crate::payload;
use crate::protocol::{Op, PayloadExt as _, PayloadMap, SmpFrame, Value, group};
use crate::transfer::upload::ChunkFormat;
use crate::{Error, Result};

const STATE: u8 = 0;
pub(crate) const UPLOAD: u8 = 1;
const ERASE: u8 = 5;

/// One slot's worth of image state, as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSlot {
    /// Slot number
    pub slot: u32,
    /// Version string, e.g. `1.2.0`
    pub version: String,
    /// SHA-256 of the image, as stored in its MCUboot TLV trailer
    pub hash: Vec<u8>,
    /// The slot holds a bootable image
    pub bootable: bool,
    /// The image will be booted (tested) on next reset
    pub pending: bool,
    /// The image is confirmed: MCUboot will not revert it
    pub confirmed: bool,
    /// The image is the one currently running
    pub active: bool,
    /// The image is marked permanent
    pub permanent: bool,
    /// Image number, on devices with more than one updateable image
    pub image: Option<u32>,
}

impl std::fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {} v{} [{}]", self.slot, self.version, hex::encode(&self.hash))?;
        for (set, label) in [
            (self.bootable, "bootable"),
            (self.pending, "pending"),
            (self.confirmed, "confirmed"),
            (self.active, "active"),
            (self.permanent, "permanent"),
        ] {
            if set {
                write!(f, " {label}")?;
            }
        }
        Ok(())
    }
}

/// The device's image slots plus split-image status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageState {
    /// Split-image status; `None` when the device does not report it
    pub split_status: Option<i64>,
    /// Per-slot state
    pub images: Vec<ImageSlot>,
}

impl ImageState {
    /// Decodes the state out of a response payload.
    ///
    /// Devices routinely omit fields that are false or not applicable, so
    /// absent booleans read as false and the hash may be empty.
    fn from_payload(payload: &PayloadMap) -> Result<ImageState> {
        payload.check_rc()?;
        let mut images = Vec::new();
        for item in payload.array_field("images")? {
            let m = item.as_map().ok_or_else(|| {
                Error::UnexpectedPayload(format!("images entry is not a map: {item:?}"))
            })?;
            let hash = match m.get("hash") {
                None => Vec::new(),
                Some(v) => v
                    .as_bytes()
                    .ok_or_else(|| {
                        Error::UnexpectedPayload(format!("hash is not a byte string: {v:?}"))
                    })?
                    .to_vec(),
            };
            images.push(ImageSlot {
                slot: slot_number(m)?,
                version: m.str_field("version")?.to_string(),
                hash,
                bootable: m.bool_field_or("bootable", false)?,
                pending: m.bool_field_or("pending", false)?,
                confirmed: m.bool_field_or("confirmed", false)?,
                active: m.bool_field_or("active", false)?,
                permanent: m.bool_field_or("permanent", false)?,
                image: m
                    .opt_u64_field("image")?
                    .map(|v| u32::try_from(v).unwrap_or(u32::MAX)),
            });
        }
        let split_status = match payload.get("splitStatus") {
            None => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                Error::UnexpectedPayload(format!("splitStatus is not an integer: {v:?}"))
            })?),
        };
        Ok(ImageState {
            split_status,
            images,
        })
    }
}

fn slot_number(m: &PayloadMap) -> Result<u32> {
    let v = m.u64_field("slot")?;
    u32::try_from(v).map_err(|_| Error::UnexpectedPayload(format!("slot {v} out of range")))
}

impl SmpClient {
    /// Reads the state of every image slot
    pub async fn read_image_state(&self, timeout: Duration) -> Result<ImageState> {
        let request = SmpFrame::request(Op::Read, group::IMAGE, STATE, payload! {});
        let response = self.execute(request, timeout).await?;
        let state = ImageState::from_payload(&response.payload)?;
        for slot in &state.images {
            debug!("{slot}");
        }
        Ok(state)
    }

    /// Marks the image with the given TLV hash pending, so MCUboot boots it
    /// on the next reset. With `confirm`, the image is made permanent
    /// straight away instead of running as a one-shot test.
    ///
    /// An empty hash addresses the currently booted image.
    pub async fn set_pending_image(
        &self,
        hash: &[u8],
        confirm: bool,
        timeout: Duration,
    ) -> Result<ImageState> {
        let request = SmpFrame::request(
            Op::Write,
            group::IMAGE,
            STATE,
            payload! { "hash" => hash, "confirm" => confirm },
        );
        let response = self.execute(request, timeout).await?;
        ImageState::from_payload(&response.payload)
    }

    /// Confirms the currently booted image, preventing rollback
    pub async fn confirm_image_state(&self, timeout: Duration) -> Result<ImageState> {
        self.set_pending_image(&[], true, timeout).await
    }

    /// Erases the inactive image slot
    pub async fn erase(&self, timeout: Duration) -> Result<()> {
        let request = SmpFrame::request(Op::Write, group::IMAGE, ERASE, payload! {});
        let response = self.execute(request, timeout).await?;
        response.payload.check_rc()
    }
}

/// Chunk payloads for firmware upload (group 1, id 1).
///
/// The first chunk announces the total length, the target image number and
/// the SHA-256 of the whole upload (which lets the device resume a
/// previously interrupted transfer); continuations carry only data and
/// offset.
pub(crate) struct ImageChunks {
    pub(crate) image: u32,
    pub(crate) sha: Option<Vec<u8>>,
}

impl ChunkFormat for ImageChunks {
    fn group(&self) -> u16 {
        group::IMAGE
    }

    fn id(&self) -> u8 {
        UPLOAD
    }

    fn payload(&self, off: usize, chunk: &[u8], total: usize) -> PayloadMap {
        if off == 0 {
            let mut map = payload! {
                "image" => u64::from(self.image),
                "data" => chunk,
                "len" => total,
                "off" => 0u64,
            };
            if let Some(sha) = &self.sha {
                let _ = map.insert("sha".to_string(), Value::from(sha.clone()));
            }
            map
        } else {
            payload! { "data" => chunk, "off" => off }
        }
    }
}
